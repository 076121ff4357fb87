//! Core of the Pier signaling broker.
//!
//! Two browser peers rendezvous on a short-lived session: the caller
//! creates it with its offer, the callee joins with the session id, and the
//! two exchange an answer, ICE candidates and a completion signal through
//! per-slot [`Notifier`]s. The [`SessionRegistry`] owns every session and
//! enforces identity and lifetime rules; [`SignalingService`] exposes the
//! command vocabulary that transports bind to.

pub mod clock;
pub mod error;
pub mod handlers;
pub mod ids;
pub mod notifier;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod session;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ErrorBody, ErrorKind, SignalError, SignalResult};
pub use handlers::SignalingService;
pub use notifier::{ListNotifier, Notifier, ValueNotifier, WaitError};
pub use protocol::{Command, CommandName, Reply};
pub use registry::{CloseReason, RegistryConfig, SessionRegistry};
pub use retry::{Backoff, RetryPolicy};
pub use session::{Payload, Peer, SessionSnapshot, SessionState};
