use std::time::{Duration, Instant};

use pier_core::{CommandName, ErrorBody, ErrorKind, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{command} rejected with status {status}: {}", .body.message)]
    Rejected {
        command: &'static str,
        status: u16,
        body: ErrorBody,
    },
    #[error("{command} still failing after {attempts} attempts")]
    Exhausted { command: &'static str, attempts: u32 },
    #[error("unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: &'static str, reply: Value },
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

/// Client for the `/apiv1/:command` polling surface.
pub struct PollClient {
    http: reqwest::Client,
    base_url: String,
    policy: RetryPolicy,
}

impl PollClient {
    pub fn new(base_url: impl Into<String>, policy: RetryPolicy) -> Result<Self, ClientError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            base_url,
            policy,
        })
    }

    pub async fn send(&self, command: CommandName, body: Value) -> Result<Value, ClientError> {
        let response = self
            .http
            .post(format!("{}/apiv1/{}", self.base_url, command.as_str()))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let envelope: ErrorEnvelope = response.json().await?;
        Err(ClientError::Rejected {
            command: command.as_str(),
            status: status.as_u16(),
            body: envelope.error,
        })
    }

    /// Re-issues `command` while the broker reports a retryable failure.
    /// Wait timeouts are polled again immediately; other retryable errors
    /// back off. Gives up once the policy ceiling is reached.
    pub async fn send_with_retry(
        &self,
        command: CommandName,
        body: Value,
    ) -> Result<Value, ClientError> {
        let mut backoff = self.policy.start();
        loop {
            match self.send(command, body.clone()).await {
                Err(ClientError::Rejected { body: error, .. }) if error.retryable => {
                    let now = tokio::time::Instant::now();
                    let exhausted = ClientError::Exhausted {
                        command: command.as_str(),
                        attempts: backoff.attempts() + 1,
                    };
                    if error.code == ErrorKind::Timeout && command.is_wait() {
                        if !backoff.within_ceiling(now) {
                            return Err(exhausted);
                        }
                        debug!(command = command.as_str(), "wait timed out; polling again");
                        continue;
                    }
                    let delay = backoff.next_delay(now).ok_or(exhausted)?;
                    debug!(
                        command = command.as_str(),
                        code = error.code.code(),
                        delay_ms = delay.as_millis() as u64,
                        "retryable rejection; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    pub async fn status(&self, session_id: &str) -> Result<Value, ClientError> {
        let response = self
            .http
            .get(format!("{}/sessions/{}", self.base_url, session_id))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let envelope: ErrorEnvelope = response.json().await?;
        Err(ClientError::Rejected {
            command: "status",
            status: status.as_u16(),
            body: envelope.error,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct HandshakeReport {
    pub session_id: String,
    pub candidates_per_side: usize,
    pub elapsed_ms: u64,
}

const DEMO_CANDIDATES: usize = 2;

/// Plays both peers of a handshake against a live broker with synthetic
/// descriptions and candidates.
pub async fn run_handshake(client: &PollClient) -> Result<HandshakeReport, ClientError> {
    let started = Instant::now();

    let created = client
        .send_with_retry(
            CommandName::EmitServerInit,
            json!({"offer": {"type": "offer", "sdp": "v=0\r\ns=pier-handshake\r\n"}}),
        )
        .await?;
    let sid = field(&created, "sid", CommandName::EmitServerInit)?;

    let joined = client
        .send_with_retry(CommandName::EmitClientInit, json!({ "sid": sid }))
        .await?;
    let cid = field(&joined, "cid", CommandName::EmitClientInit)?;

    client
        .send_with_retry(CommandName::AwaitServerInit, json!({"sid": sid, "cid": cid}))
        .await?;
    client
        .send_with_retry(
            CommandName::EmitClientAnswer,
            json!({"sid": sid, "cid": cid, "answer": {"type": "answer", "sdp": "v=0\r\n"}}),
        )
        .await?;
    client
        .send_with_retry(CommandName::AwaitClientAnswer, json!({ "sid": sid }))
        .await?;

    for n in 0..DEMO_CANDIDATES {
        client
            .send_with_retry(
                CommandName::EmitServerIceCandidate,
                json!({"sid": sid, "candidate": format!("caller-{n}")}),
            )
            .await?;
        client
            .send_with_retry(
                CommandName::EmitClientIceCandidate,
                json!({"sid": sid, "cid": cid, "candidate": format!("callee-{n}")}),
            )
            .await?;
    }
    let to_callee = drain(
        client,
        CommandName::AwaitServerIceCandidate,
        json!({"sid": sid, "cid": cid}),
    )
    .await?;
    let to_caller = drain(
        client,
        CommandName::AwaitClientIceCandidate,
        json!({ "sid": sid }),
    )
    .await?;
    debug!(to_callee, to_caller, "candidates exchanged");

    client
        .send_with_retry(CommandName::EmitDone, json!({"sid": sid, "cid": cid}))
        .await?;
    client
        .send_with_retry(CommandName::AwaitDone, json!({ "sid": sid }))
        .await?;

    Ok(HandshakeReport {
        session_id: sid,
        candidates_per_side: to_callee.min(to_caller),
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

/// Collects candidate batches until the expected count has arrived.
async fn drain(client: &PollClient, command: CommandName, body: Value) -> Result<usize, ClientError> {
    let mut received = 0;
    while received < DEMO_CANDIDATES {
        let reply = client.send_with_retry(command, body.clone()).await?;
        received += reply["candidates"].as_array().map(Vec::len).ok_or_else(|| {
            ClientError::UnexpectedReply {
                command: command.as_str(),
                reply: reply.clone(),
            }
        })?;
    }
    Ok(received)
}

fn field(reply: &Value, name: &str, command: CommandName) -> Result<String, ClientError> {
    reply[name]
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| ClientError::UnexpectedReply {
            command: command.as_str(),
            reply: reply.clone(),
        })
}

pub fn default_policy(ceiling: Duration) -> RetryPolicy {
    RetryPolicy::default().with_ceiling(ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test_support::*;
    use pier_core::RegistryConfig;

    fn client_for(server: &TestServer, ceiling: Duration) -> PollClient {
        PollClient::new(server.http_url(), default_policy(ceiling)).unwrap()
    }

    #[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread")]
    async fn handshake_client_completes_against_live_broker() {
        let server = spawn_test_server(fast_registry_config()).await;
        let client = client_for(&server, Duration::from_secs(10));

        let report = run_handshake(&client).await.unwrap();
        assert_eq!(report.candidates_per_side, DEMO_CANDIDATES);
        assert!(server.state.registry().is_empty());

        match client.status(&report.session_id).await {
            Err(ClientError::Rejected { status, body, .. }) => {
                assert_eq!(status, 404);
                assert_eq!(body.code, ErrorKind::NotFound);
            }
            other => panic!("expected not found, got {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread")]
    async fn wait_timeouts_stop_at_the_ceiling() {
        let server = spawn_test_server(fast_registry_config()).await;
        let client = client_for(&server, Duration::from_millis(500));
        let sid = server.state.registry().create_session(json!("offer"));

        let result = client
            .send_with_retry(CommandName::AwaitClientAnswer, json!({ "sid": sid }))
            .await;
        assert!(matches!(result, Err(ClientError::Exhausted { .. })), "{result:?}");
    }

    #[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread")]
    async fn early_candidate_is_retried_until_callee_joins() {
        let server = spawn_test_server(RegistryConfig {
            candidate_timeout: Duration::from_secs(1),
            ..fast_registry_config()
        })
        .await;
        let client = client_for(&server, Duration::from_secs(5));
        let registry = server.state.registry().clone();
        let sid = registry.create_session(json!("offer"));

        let joiner = {
            let sid = sid.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                registry.join_session(&sid).unwrap()
            })
        };
        client
            .send_with_retry(
                CommandName::EmitServerIceCandidate,
                json!({"sid": sid, "candidate": "early"}),
            )
            .await
            .unwrap();

        let cid = joiner.await.unwrap();
        let batch = client
            .send(
                CommandName::AwaitServerIceCandidate,
                json!({"sid": sid, "cid": cid}),
            )
            .await
            .unwrap();
        assert_eq!(batch, json!({"candidates": ["early"]}));
    }

    #[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread")]
    async fn terminal_rejections_are_not_retried() {
        let server = spawn_test_server(fast_registry_config()).await;
        let client = client_for(&server, Duration::from_secs(5));

        let result = client
            .send_with_retry(
                CommandName::EmitClientInit,
                json!({"sid": "AAAAAAAAAAAAAAAAAAAAAA"}),
            )
            .await;
        match result {
            Err(ClientError::Rejected { status, body, .. }) => {
                assert_eq!(status, 404);
                assert!(!body.retryable);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
