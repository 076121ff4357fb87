use serde_json::Value;
use tracing::{debug, trace};

use crate::{
    error::{ErrorKind, SignalResult},
    protocol::{Command, Reply},
    registry::SessionRegistry,
    session::Peer,
};

/// Maps protocol commands onto registry operations. Transports own one of
/// these and never talk to the registry's mutation API directly.
#[derive(Clone)]
pub struct SignalingService {
    registry: SessionRegistry,
}

impl SignalingService {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Parses and executes a named command.
    pub async fn handle(&self, name: &str, body: Value) -> SignalResult<Reply> {
        let command = Command::parse(name, body)?;
        self.dispatch(command).await
    }

    pub async fn dispatch(&self, command: Command) -> SignalResult<Reply> {
        let name = command.name();
        let session_id = command.session_id().map(str::to_owned);
        let result = self.execute(command).await;

        if let Err(err) = &result {
            match err.kind() {
                ErrorKind::Timeout => trace!(
                    command = name.as_str(),
                    session_id = session_id.as_deref().unwrap_or("-"),
                    "wait timed out; client should poll again"
                ),
                _ => debug!(
                    command = name.as_str(),
                    session_id = session_id.as_deref().unwrap_or("-"),
                    error = %err,
                    "command rejected"
                ),
            }
        }
        result
    }

    async fn execute(&self, command: Command) -> SignalResult<Reply> {
        let registry = &self.registry;
        match command {
            Command::EmitServerInit { offer } => Ok(Reply::Created {
                sid: registry.create_session(offer),
            }),
            Command::EmitClientInit { sid } => Ok(Reply::Joined {
                cid: registry.join_session(&sid)?,
            }),
            Command::AwaitServerInit { sid, cid } => Ok(Reply::Offer {
                offer: registry.await_offer(&sid, &cid).await?,
            }),
            Command::EmitClientAnswer { sid, cid, answer } => {
                registry.post_answer(&sid, &cid, answer)?;
                Ok(Reply::Ack {})
            }
            Command::AwaitClientAnswer { sid } => Ok(Reply::Answer {
                answer: registry.await_answer(&sid).await?,
            }),
            Command::EmitServerIceCandidate { sid, candidate } => {
                registry.post_candidate(&sid, &Peer::Caller, candidate)?;
                Ok(Reply::Ack {})
            }
            Command::EmitClientIceCandidate {
                sid,
                cid,
                candidate,
            } => {
                registry.post_candidate(&sid, &Peer::Callee(cid), candidate)?;
                Ok(Reply::Ack {})
            }
            Command::AwaitServerIceCandidate { sid, cid } => Ok(Reply::Candidates {
                candidates: registry.await_candidates(&sid, &Peer::Callee(cid)).await?,
            }),
            Command::AwaitClientIceCandidate { sid } => Ok(Reply::Candidates {
                candidates: registry.await_candidates(&sid, &Peer::Caller).await?,
            }),
            Command::EmitDone { sid, cid } => {
                registry.mark_done(&sid, &cid)?;
                Ok(Reply::Ack {})
            }
            Command::AwaitDone { sid } => {
                registry.await_done(&sid).await?;
                Ok(Reply::Ack {})
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::SignalError, registry::RegistryConfig};
    use serde_json::json;
    use std::time::Duration;

    fn service() -> SignalingService {
        SignalingService::new(SessionRegistry::new(RegistryConfig {
            rendezvous_timeout: Duration::from_millis(200),
            candidate_timeout: Duration::from_millis(50),
            ..RegistryConfig::default()
        }))
    }

    async fn call(service: &SignalingService, name: &str, body: Value) -> SignalResult<Value> {
        service
            .handle(name, body)
            .await
            .map(|reply| serde_json::to_value(reply).unwrap())
    }

    #[test_timeout::tokio_timeout_test]
    async fn caller_and_callee_directions_do_not_cross() {
        let service = service();
        let sid = call(&service, "emit-server-init", json!({"offer": "o"}))
            .await
            .unwrap()["sid"]
            .as_str()
            .unwrap()
            .to_string();
        let cid = call(&service, "emit-client-init", json!({ "sid": sid }))
            .await
            .unwrap()["cid"]
            .as_str()
            .unwrap()
            .to_string();

        call(
            &service,
            "emit-server-ice-candidate",
            json!({"sid": sid, "candidate": "from-caller"}),
        )
        .await
        .unwrap();
        call(
            &service,
            "emit-client-ice-candidate",
            json!({"sid": sid, "cid": cid, "candidate": "from-callee"}),
        )
        .await
        .unwrap();

        assert_eq!(
            call(&service, "await-server-ice-candidate", json!({"sid": sid, "cid": cid}))
                .await
                .unwrap(),
            json!({"candidates": ["from-caller"]})
        );
        assert_eq!(
            call(&service, "await-client-ice-candidate", json!({ "sid": sid }))
                .await
                .unwrap(),
            json!({"candidates": ["from-callee"]})
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_input_never_reaches_the_registry() {
        let service = service();
        let result = call(&service, "emit-server-init", json!({"sdp": "v=0"})).await;
        assert!(matches!(result, Err(SignalError::InvalidInput(_))));
        assert!(service.registry().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_commands_are_reported() {
        let service = service();
        assert_eq!(
            call(&service, "get-peer-client", json!({})).await,
            Err(SignalError::UnknownCommand("get-peer-client".into()))
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn early_caller_candidate_is_retryable() {
        let service = service();
        let sid = call(&service, "emit-server-init", json!({"offer": "o"}))
            .await
            .unwrap()["sid"]
            .as_str()
            .unwrap()
            .to_string();

        let err = call(
            &service,
            "emit-server-ice-candidate",
            json!({"sid": sid, "candidate": "early"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err, SignalError::NotJoined);
        assert!(err.kind().is_retryable());
    }
}
