//! Persistent duplex surface on `GET /apiv1/stream`.
//!
//! Each WebSocket binds to at most one session, as either the caller
//! (`server-init`) or the callee (`client-init`). Inbound events map onto the
//! same commands as the polling surface; pump tasks loop on the registry
//! waits and push whatever arrives as outbound events.
//!
//! When the bound session ends before the handshake finished (the peer
//! disconnected or the session expired) the connection gets a
//! `custom-error` and is closed.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, decrement_gauge, increment_gauge};
use pier_core::{
    CloseReason, Command, ErrorBody, Reply, SessionRegistry, SessionState, SignalError,
    SignalResult, SignalingService,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
    time::{timeout, Duration},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::server::AppState;

const OUTBOUND_BUFFER: usize = 64;
const SESSION_CLOSED: &str = "session closed";

#[derive(Debug, Deserialize)]
struct InboundFrame {
    event: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    ack: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OutboundFrame {
    Event { event: &'static str, data: Value },
    Ack { ack: u64, data: Value },
    AckError { ack: u64, error: ErrorBody },
}

impl OutboundFrame {
    fn custom_error(message: impl Into<String>) -> Self {
        OutboundFrame::Event {
            event: "custom-error",
            data: json!({ "message": message.into() }),
        }
    }
}

#[derive(Debug, Clone)]
enum Binding {
    Unbound,
    Caller { sid: String },
    Callee { sid: String, cid: String },
}

impl Binding {
    fn session_id(&self) -> Option<&str> {
        match self {
            Binding::Unbound => None,
            Binding::Caller { sid } | Binding::Callee { sid, .. } => Some(sid),
        }
    }
}

/// Raised by a pump when the bound session ends under the connection.
#[derive(Default)]
struct Hangup {
    handshake_finished: AtomicBool,
    raised: Notify,
}

impl Hangup {
    fn raise(&self) {
        self.raised.notify_one();
    }

    /// A session that ended because the handshake completed is not a hangup.
    fn finished(&self, registry: &SessionRegistry, sid: &str) -> bool {
        self.handshake_finished.load(Ordering::SeqCst)
            || matches!(registry.status(sid), Ok(status) if status.state == SessionState::Completed)
    }
}

/// What a pump does when its wait reports the session gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnSessionEnd {
    Stop,
    Hangup,
}

pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4();
    if let Err(err) = serve_connection(socket, state, connection_id).await {
        warn!(connection_id = %connection_id, "stream ended with error: {err:?}");
    }
}

async fn serve_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    connection_id: Uuid,
) -> Result<()> {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_BUFFER);

    counter!("pier_streams_total", 1);
    increment_gauge!("pier_streams_active", 1.0);
    debug!(connection_id = %connection_id, "stream connected");

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "failed to encode outbound frame");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let hangup = Arc::new(Hangup::default());
    let mut connection = Connection {
        service: state.service.clone(),
        outbound: tx,
        binding: Binding::Unbound,
        pumps: Vec::new(),
        hangup: hangup.clone(),
    };

    let read_loop = async {
        loop {
            let message = tokio::select! {
                message = ws_rx.next() => message,
                _ = hangup.raised.notified() => {
                    info!(connection_id = %connection_id, "bound session ended; closing stream");
                    break;
                }
            };
            let Some(message) = message else {
                break;
            };
            match message {
                Ok(Message::Text(text)) => connection.on_text(&text).await,
                Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => connection.on_text(text).await,
                    Err(_) => {
                        connection
                            .push(OutboundFrame::custom_error("binary frames must be UTF-8 JSON"))
                            .await
                    }
                },
                Ok(Message::Close(frame)) => {
                    debug!(
                        connection_id = %connection_id,
                        reason = ?frame.map(|f| f.reason.to_string()),
                        "client closed stream"
                    );
                    break;
                }
                Ok(_) => continue,
                Err(err) => {
                    warn!(connection_id = %connection_id, error = %err, "error receiving frame");
                    break;
                }
            }
        }
    };
    if timeout(state.stream_lifetime, read_loop).await.is_err() {
        info!(connection_id = %connection_id, "stream outlived its session lifetime; closing");
    }

    connection.shutdown();
    drop(connection);
    let _ = timeout(Duration::from_secs(1), writer).await;
    decrement_gauge!("pier_streams_active", 1.0);
    Ok(())
}

struct Connection {
    service: SignalingService,
    outbound: mpsc::Sender<OutboundFrame>,
    binding: Binding,
    pumps: Vec<JoinHandle<()>>,
    hangup: Arc<Hangup>,
}

impl Connection {
    async fn push(&self, frame: OutboundFrame) {
        let _ = self.outbound.send(frame).await;
    }

    async fn on_text(&mut self, text: &str) {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                self.push(OutboundFrame::custom_error(format!("malformed frame: {err}")))
                    .await;
                return;
            }
        };

        let ack = frame.ack;
        match self.on_event(&frame.event, frame.data).await {
            Ok(data) => {
                if let Some(ack) = ack {
                    self.push(OutboundFrame::Ack { ack, data }).await;
                }
            }
            Err(err) => {
                debug!(
                    session_id = self.binding.session_id().unwrap_or("-"),
                    event = %frame.event,
                    error = %err,
                    "stream event rejected"
                );
                match ack {
                    Some(ack) => {
                        self.push(OutboundFrame::AckError {
                            ack,
                            error: err.to_body(),
                        })
                        .await
                    }
                    None => self.push(OutboundFrame::custom_error(err.to_string())).await,
                }
            }
        }
    }

    async fn on_event(&mut self, event: &str, data: Value) -> SignalResult<Value> {
        match (event, self.binding.clone()) {
            ("server-init", Binding::Unbound) => {
                let reply = self.call("emit-server-init", data).await?;
                if let Reply::Created { sid } = &reply {
                    self.bind_caller(sid.clone());
                }
                to_value(reply)
            }
            ("client-init", Binding::Unbound) => {
                let command = Command::parse("emit-client-init", data)?;
                let sid = command.session_id().unwrap_or_default().to_string();
                let reply = self.service.dispatch(command).await?;
                if let Reply::Joined { cid } = &reply {
                    self.bind_callee(sid, cid.clone());
                }
                to_value(reply)
            }
            ("server-answer" | "client-answer", Binding::Callee { sid, cid }) => {
                let data = with_identity(data, &sid, Some(&cid))?;
                self.call("emit-client-answer", data).await?;
                Ok(json!({}))
            }
            ("ice-candidate", Binding::Caller { sid }) => {
                let data = with_identity(data, &sid, None)?;
                self.call("emit-server-ice-candidate", data).await?;
                Ok(Value::Bool(true))
            }
            ("ice-candidate", Binding::Callee { sid, cid }) => {
                let data = with_identity(data, &sid, Some(&cid))?;
                self.call("emit-client-ice-candidate", data).await?;
                Ok(Value::Bool(true))
            }
            ("done", Binding::Callee { sid, cid }) => {
                // Set before the call: completion wakes this connection's
                // pumps, which must not read it as a hangup.
                self.hangup.handshake_finished.store(true, Ordering::SeqCst);
                if let Err(err) = self.call("emit-done", json!({"sid": sid, "cid": cid})).await {
                    self.hangup.handshake_finished.store(false, Ordering::SeqCst);
                    if err.kind().is_terminal() {
                        self.hangup.raise();
                    }
                    return Err(err);
                }
                Ok(json!({}))
            }
            (
                "server-init" | "client-init" | "server-answer" | "client-answer" | "ice-candidate"
                | "done",
                _,
            ) => {
                Err(SignalError::invalid(format!("unexpected event {event}")))
            }
            (other, _) => Err(SignalError::invalid(format!("unknown event {other}"))),
        }
    }

    async fn call(&self, command: &str, data: Value) -> SignalResult<Reply> {
        self.service.handle(command, data).await
    }

    fn bind_caller(&mut self, sid: String) {
        info!(session_id = %sid, "stream bound as caller");
        // The done wait outlives the negotiation waits, so it alone reports
        // an early end of the session.
        self.spawn_pump(
            "answer",
            false,
            OnSessionEnd::Stop,
            Command::AwaitClientAnswer { sid: sid.clone() },
        );
        self.spawn_pump(
            "ice-candidates",
            true,
            OnSessionEnd::Stop,
            Command::AwaitClientIceCandidate { sid: sid.clone() },
        );
        self.spawn_pump(
            "done",
            false,
            OnSessionEnd::Hangup,
            Command::AwaitDone { sid: sid.clone() },
        );
        self.binding = Binding::Caller { sid };
    }

    fn bind_callee(&mut self, sid: String, cid: String) {
        info!(session_id = %sid, "stream bound as callee");
        self.spawn_pump(
            "offer",
            false,
            OnSessionEnd::Hangup,
            Command::AwaitServerInit {
                sid: sid.clone(),
                cid: cid.clone(),
            },
        );
        self.spawn_pump(
            "ice-candidates",
            true,
            OnSessionEnd::Hangup,
            Command::AwaitServerIceCandidate {
                sid: sid.clone(),
                cid: cid.clone(),
            },
        );
        self.binding = Binding::Callee { sid, cid };
    }

    /// Re-issues `command` until it yields, pushing each reply as `event`.
    /// Timeouts are swallowed. A terminal error on an `OnSessionEnd::Hangup`
    /// pump tells the client and closes the connection.
    fn spawn_pump(
        &mut self,
        event: &'static str,
        repeat: bool,
        on_end: OnSessionEnd,
        command: Command,
    ) {
        let service = self.service.clone();
        let outbound = self.outbound.clone();
        let hangup = self.hangup.clone();
        self.pumps.push(tokio::spawn(async move {
            let sid = command.session_id().unwrap_or_default().to_string();
            loop {
                match service.dispatch(command.clone()).await {
                    Ok(reply) => {
                        let data = serde_json::to_value(reply).unwrap_or(Value::Null);
                        let sent = outbound.send(OutboundFrame::Event { event, data }).await;
                        if sent.is_err() || !repeat {
                            break;
                        }
                    }
                    Err(SignalError::Timeout) => continue,
                    Err(err)
                        if on_end == OnSessionEnd::Hangup
                            && err.kind().is_terminal()
                            && !hangup.finished(service.registry(), &sid) =>
                    {
                        info!(session_id = %sid, event, error = %err, "session ended under the stream");
                        let _ = outbound.send(OutboundFrame::custom_error(SESSION_CLOSED)).await;
                        hangup.raise();
                        break;
                    }
                    Err(err) => {
                        debug!(event, error = %err, "pump finished");
                        break;
                    }
                }
            }
        }));
    }

    /// Stops the pumps and closes the bound session unless the handshake
    /// already finished.
    fn shutdown(&mut self) {
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        let Some(sid) = self.binding.session_id() else {
            return;
        };
        match self
            .service
            .registry()
            .close_unless_completed(sid, CloseReason::Disconnected)
        {
            Ok(true) => info!(session_id = %sid, "stream disconnected; session closed"),
            Ok(false) => debug!(session_id = %sid, "stream disconnected after completion"),
            Err(_) => {}
        }
    }
}

/// Adds the connection's identity to an event payload so it can be
/// validated as the equivalent polling command.
fn with_identity(data: Value, sid: &str, cid: Option<&str>) -> SignalResult<Value> {
    let mut fields = match data {
        Value::Object(fields) => fields,
        Value::Null => Map::new(),
        _ => return Err(SignalError::invalid("event data must be a JSON object")),
    };
    fields.insert("sid".into(), Value::String(sid.to_string()));
    if let Some(cid) = cid {
        fields.insert("cid".into(), Value::String(cid.to_string()));
    }
    Ok(Value::Object(fields))
}

fn to_value(reply: Reply) -> SignalResult<Value> {
    serde_json::to_value(reply).map_err(|err| SignalError::invalid(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test_support::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::{
        connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
    };

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn connect(server: &TestServer) -> Client {
        let (client, _) = connect_async(server.ws_url()).await.unwrap();
        client
    }

    async fn send(client: &mut Client, frame: Value) {
        client
            .send(WsMessage::Text(frame.to_string().into()))
            .await
            .unwrap();
    }

    /// Reads frames until one satisfies `wanted`, skipping the rest.
    async fn expect(client: &mut Client, wanted: impl Fn(&Value) -> bool) -> Value {
        loop {
            let message = timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .unwrap();
            if let WsMessage::Text(text) = message {
                let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                if wanted(&frame) {
                    return frame;
                }
            }
        }
    }

    fn event(name: &'static str) -> impl Fn(&Value) -> bool {
        move |frame| frame["event"] == name
    }

    fn ack(id: u64) -> impl Fn(&Value) -> bool {
        move |frame| frame["ack"] == id
    }

    /// Reads until the server closes the connection.
    async fn expect_close(client: &mut Client) {
        loop {
            match timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for close")
            {
                None | Some(Ok(WsMessage::Close(_))) | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    }

    /// Binds a caller and a callee to one session; the callee has its offer.
    async fn bound_pair(server: &TestServer) -> (Client, Client, String) {
        let mut caller = connect(server).await;
        let mut callee = connect(server).await;

        send(&mut caller, json!({"event": "server-init", "ack": 1, "data": {"offer": "o"}})).await;
        let sid = expect(&mut caller, ack(1)).await["data"]["sid"]
            .as_str()
            .unwrap()
            .to_string();
        send(&mut callee, json!({"event": "client-init", "ack": 1, "data": {"sid": sid}})).await;
        expect(&mut callee, ack(1)).await;
        expect(&mut callee, event("offer")).await;
        (caller, callee, sid)
    }

    fn session_closed(frame: &Value) -> bool {
        frame["event"] == "custom-error" && frame["data"]["message"] == SESSION_CLOSED
    }

    #[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread")]
    async fn duplex_handshake_pushes_every_step() {
        let server = spawn_test_server(fast_registry_config()).await;
        let mut caller = connect(&server).await;
        let mut callee = connect(&server).await;

        send(
            &mut caller,
            json!({"event": "server-init", "ack": 1, "data": {"offer": {"type": "offer"}}}),
        )
        .await;
        let created = expect(&mut caller, ack(1)).await;
        let sid = created["data"]["sid"].as_str().unwrap().to_string();

        send(&mut callee, json!({"event": "client-init", "ack": 1, "data": {"sid": sid}})).await;
        let joined = expect(&mut callee, ack(1)).await;
        assert!(joined["data"]["cid"].is_string());

        let offer = expect(&mut callee, event("offer")).await;
        assert_eq!(offer["data"], json!({"offer": {"type": "offer"}}));

        send(
            &mut callee,
            json!({"event": "server-answer", "data": {"desc": {"type": "answer"}}}),
        )
        .await;
        let answer = expect(&mut caller, event("answer")).await;
        assert_eq!(answer["data"], json!({"answer": {"type": "answer"}}));

        send(
            &mut callee,
            json!({"event": "ice-candidate", "ack": 2, "data": {"candidate": "from-callee"}}),
        )
        .await;
        assert_eq!(expect(&mut callee, ack(2)).await["data"], json!(true));
        let batch = expect(&mut caller, event("ice-candidates")).await;
        assert_eq!(batch["data"], json!({"candidates": ["from-callee"]}));

        send(
            &mut caller,
            json!({"event": "ice-candidate", "ack": 2, "data": {"candidate": "from-caller"}}),
        )
        .await;
        let batch = expect(&mut callee, event("ice-candidates")).await;
        assert_eq!(batch["data"], json!({"candidates": ["from-caller"]}));

        send(&mut callee, json!({"event": "done"})).await;
        expect(&mut caller, event("done")).await;

        for _ in 0..50 {
            if server.state.registry().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(server.state.registry().is_empty());
    }

    #[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread")]
    async fn callee_is_told_and_closed_when_caller_disconnects() {
        let server = spawn_test_server(fast_registry_config()).await;
        let (mut caller, mut callee, sid) = bound_pair(&server).await;

        caller.close(None).await.unwrap();
        drop(caller);

        expect(&mut callee, session_closed).await;
        expect_close(&mut callee).await;
        assert_eq!(
            server.state.registry().status(&sid).map(|_| ()),
            Err(SignalError::NotFound)
        );
    }

    #[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread")]
    async fn caller_is_told_and_closed_when_callee_disconnects() {
        let server = spawn_test_server(fast_registry_config()).await;
        let (mut caller, mut callee, _sid) = bound_pair(&server).await;

        callee.close(None).await.unwrap();
        drop(callee);

        expect(&mut caller, session_closed).await;
        expect_close(&mut caller).await;
    }

    #[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread")]
    async fn callee_disconnect_after_done_keeps_the_session_for_the_caller() {
        let server = spawn_test_server(fast_registry_config()).await;
        let (mut caller, mut callee, _sid) = bound_pair(&server).await;

        send(&mut callee, json!({"event": "done", "ack": 2})).await;
        expect(&mut callee, ack(2)).await;
        callee.close(None).await.unwrap();
        drop(callee);

        let done = expect(&mut caller, |frame: &Value| {
            frame["event"] == "done" || session_closed(frame)
        })
        .await;
        assert_eq!(done["event"], "done");
    }

    #[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread")]
    async fn protocol_violations_raise_custom_errors() {
        let server = spawn_test_server(fast_registry_config()).await;
        let mut client = connect(&server).await;

        send(&mut client, json!({"event": "client-answer", "data": {"answer": "a"}})).await;
        let error = expect(&mut client, event("custom-error")).await;
        assert!(error["data"]["message"]
            .as_str()
            .unwrap()
            .contains("unexpected event client-answer"));

        client.send(WsMessage::Text("not json".into())).await.unwrap();
        let error = expect(&mut client, event("custom-error")).await;
        assert!(error["data"]["message"]
            .as_str()
            .unwrap()
            .starts_with("malformed frame"));

        send(
            &mut client,
            json!({"event": "client-init", "ack": 7, "data": {"sid": "AAAAAAAAAAAAAAAAAAAAAA"}}),
        )
        .await;
        let rejected = expect(&mut client, ack(7)).await;
        assert_eq!(rejected["error"]["code"], "not_found");
    }

    #[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread")]
    async fn early_candidate_ack_is_retryable() {
        let server = spawn_test_server(fast_registry_config()).await;
        let mut caller = connect(&server).await;

        send(&mut caller, json!({"event": "server-init", "ack": 1, "data": {"offer": "o"}})).await;
        expect(&mut caller, ack(1)).await;
        send(
            &mut caller,
            json!({"event": "ice-candidate", "ack": 2, "data": {"candidate": "early"}}),
        )
        .await;
        let rejected = expect(&mut caller, ack(2)).await;
        assert_eq!(rejected["error"]["code"], "not_joined");
        assert_eq!(rejected["error"]["retryable"], true);
    }

    #[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread")]
    async fn disconnect_closes_the_bound_session() {
        let server = spawn_test_server(fast_registry_config()).await;
        let mut caller = connect(&server).await;

        send(&mut caller, json!({"event": "server-init", "ack": 1, "data": {"offer": "o"}})).await;
        let sid = expect(&mut caller, ack(1)).await["data"]["sid"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(server.state.registry().status(&sid).is_ok());

        caller.close(None).await.unwrap();
        drop(caller);

        for _ in 0..100 {
            if server.state.registry().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            server.state.registry().status(&sid).map(|_| ()),
            Err(SignalError::NotFound)
        );
    }
}
