//! Wait-with-timeout mailbox slots.
//!
//! A [`Notifier`] guards one slot. Writers [`deposit`](Notifier::deposit)
//! into it and wake every current waiter; readers [`wait`](Notifier::wait)
//! for the slot to become ready, take its contents, or give up at a
//! deadline. Two slot shapes exist:
//!
//! * [`Single`]: a scalar that is overwritten on deposit and consumed by
//!   exactly one successful wait.
//! * [`Queue`]: an ordered list that grows on deposit and is drained as a
//!   whole batch; an empty list never satisfies a wait.
//!
//! Waiters register with the underlying [`Notify`] *before* inspecting the
//! slot, so a deposit racing the check always wakes them.

use std::{fmt, time::Duration};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::{sync::Notify, time::Instant};

/// Storage strategy for a notifier slot.
pub trait Slot: Default + Send + 'static {
    type Item: Send;
    type Output: Send;

    fn put(&mut self, item: Self::Item);
    /// Removes and returns the contents if they can satisfy a waiter.
    fn take(&mut self) -> Option<Self::Output>;
    fn is_ready(&self) -> bool;
    fn clear(&mut self);
}

/// Consume-once scalar slot.
#[derive(Debug)]
pub struct Single<T>(Option<T>);

impl<T> Default for Single<T> {
    fn default() -> Self {
        Self(None)
    }
}

impl<T: Send + 'static> Slot for Single<T> {
    type Item = T;
    type Output = T;

    fn put(&mut self, item: T) {
        self.0 = Some(item);
    }

    fn take(&mut self) -> Option<T> {
        self.0.take()
    }

    fn is_ready(&self) -> bool {
        self.0.is_some()
    }

    fn clear(&mut self) {
        self.0 = None;
    }
}

/// Accumulate-and-drain list slot.
#[derive(Debug)]
pub struct Queue<T>(Vec<T>);

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T: Send + 'static> Slot for Queue<T> {
    type Item = T;
    type Output = Vec<T>;

    fn put(&mut self, item: T) {
        self.0.push(item);
    }

    fn take(&mut self) -> Option<Vec<T>> {
        if self.0.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.0))
        }
    }

    fn is_ready(&self) -> bool {
        !self.0.is_empty()
    }

    fn clear(&mut self) {
        self.0.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("wait timed out")]
    TimedOut,
    #[error("slot closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("slot closed")]
pub struct Closed;

struct SlotState<S> {
    slot: S,
    closed: bool,
}

pub struct Notifier<S: Slot> {
    state: Mutex<SlotState<S>>,
    notify: Notify,
}

pub type ValueNotifier<T> = Notifier<Single<T>>;
pub type ListNotifier<T> = Notifier<Queue<T>>;

impl<S: Slot> Notifier<S> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                slot: S::default(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Stores `item` and wakes every waiter currently parked on this slot.
    pub fn deposit(&self, item: S::Item) -> Result<(), Closed> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Closed);
            }
            state.slot.put(item);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn try_take(&self) -> Result<Option<S::Output>, Closed> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Closed);
        }
        Ok(state.slot.take())
    }

    /// Takes the slot contents, waiting up to `timeout` for them to appear.
    pub async fn wait(&self, timeout: Duration) -> Result<S::Output, WaitError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before looking at the slot; a deposit landing between
            // the check and the await below still wakes us.
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(WaitError::Closed);
                }
                if let Some(output) = state.slot.take() {
                    return Ok(output);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(WaitError::TimedOut);
            }
        }
    }

    /// Releases every outstanding and future waiter with [`WaitError::Closed`].
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.slot.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether a wait issued now would return immediately with a value.
    pub fn pending(&self) -> bool {
        let state = self.state.lock();
        !state.closed && state.slot.is_ready()
    }
}

impl<S: Slot> Default for Notifier<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Slot> fmt::Debug for Notifier<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Notifier")
            .field("ready", &state.slot.is_ready())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    const SHORT: Duration = Duration::from_millis(50);
    const LONG: Duration = Duration::from_secs(5);

    #[test_timeout::tokio_timeout_test]
    async fn present_value_is_returned_once() {
        let slot = ValueNotifier::new();
        slot.deposit("offer").unwrap();
        assert!(slot.pending());

        assert_eq!(slot.wait(SHORT).await, Ok("offer"));
        assert!(!slot.pending());
        assert_eq!(slot.wait(SHORT).await, Err(WaitError::TimedOut));
    }

    #[test_timeout::tokio_timeout_test]
    async fn scalar_deposit_overwrites_unread_value() {
        let slot = ValueNotifier::new();
        slot.deposit(1).unwrap();
        slot.deposit(2).unwrap();
        assert_eq!(slot.wait(SHORT).await, Ok(2));
    }

    #[test_timeout::tokio_timeout_test]
    async fn queue_drains_in_deposit_order() {
        let slot = ListNotifier::new();
        for candidate in ["a", "b", "c"] {
            slot.deposit(candidate).unwrap();
        }

        assert_eq!(slot.wait(SHORT).await, Ok(vec!["a", "b", "c"]));
        // Drained: the next wait times out instead of succeeding with `[]`.
        assert_eq!(slot.wait(SHORT).await, Err(WaitError::TimedOut));
    }

    #[test_timeout::tokio_timeout_test]
    async fn waiter_wakes_on_later_deposit() {
        let slot = Arc::new(ValueNotifier::new());
        let waiter = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.wait(LONG).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        slot.deposit("answer").unwrap();

        assert_eq!(waiter.await.unwrap(), Ok("answer"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn queue_waiter_wakes_on_first_append() {
        let slot = Arc::new(ListNotifier::new());
        let waiter = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.wait(LONG).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        slot.deposit(7u32).unwrap();

        assert_eq!(waiter.await.unwrap(), Ok(vec![7]));
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_releases_outstanding_waiters_promptly() {
        let slot = Arc::new(ListNotifier::<u32>::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let slot = slot.clone();
                tokio::spawn(async move { slot.wait(Duration::from_secs(30)).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = Instant::now();
        slot.close();

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Err(WaitError::Closed));
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test_timeout::tokio_timeout_test]
    async fn closed_slot_rejects_deposits_and_waits() {
        let slot = ValueNotifier::new();
        slot.deposit(1).unwrap();
        slot.close();

        assert!(slot.is_closed());
        assert!(!slot.pending());
        assert_eq!(slot.deposit(2), Err(Closed));
        assert_eq!(slot.try_take(), Err(Closed));
        assert_eq!(slot.wait(SHORT).await, Err(WaitError::Closed));
    }

    #[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread", worker_threads = 4)]
    async fn racing_waiters_receive_a_scalar_exactly_once() {
        for _ in 0..100 {
            let slot = Arc::new(ValueNotifier::new());
            let delivered = Arc::new(AtomicUsize::new(0));

            let waiters: Vec<_> = (0..2)
                .map(|_| {
                    let slot = slot.clone();
                    let delivered = delivered.clone();
                    tokio::spawn(async move {
                        if slot.wait(Duration::from_millis(50)).await.is_ok() {
                            delivered.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();

            tokio::task::yield_now().await;
            slot.deposit("offer").unwrap();

            for waiter in waiters {
                waiter.await.unwrap();
            }
            assert_eq!(delivered.load(Ordering::SeqCst), 1);
        }
    }

    #[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread", worker_threads = 4)]
    async fn deposit_right_after_wait_is_never_missed() {
        for round in 0..1_000u32 {
            let slot = Arc::new(ValueNotifier::new());
            let waiter = {
                let slot = slot.clone();
                tokio::spawn(async move { slot.wait(LONG).await })
            };
            if round % 2 == 0 {
                tokio::task::yield_now().await;
            }
            slot.deposit(round).unwrap();
            assert_eq!(waiter.await.unwrap(), Ok(round));
        }
    }

    #[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_are_all_drained() {
        let slot = Arc::new(ListNotifier::new());
        let writers: Vec<_> = (0..8u32)
            .map(|writer| {
                let slot = slot.clone();
                tokio::spawn(async move {
                    for n in 0..50u32 {
                        slot.deposit(writer * 1_000 + n).unwrap();
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        let mut seen = Vec::new();
        while seen.len() < 400 {
            seen.extend(slot.wait(LONG).await.unwrap());
        }
        for writer in writers {
            writer.await.unwrap();
        }

        assert_eq!(seen.len(), 400);
        for writer in 0..8u32 {
            let own: Vec<u32> = seen
                .iter()
                .copied()
                .filter(|value| value / 1_000 == writer)
                .collect();
            let expected: Vec<u32> = (0..50).map(|n| writer * 1_000 + n).collect();
            assert_eq!(own, expected, "writer {writer} appends reordered");
        }
    }
}
