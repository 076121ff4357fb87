//! Command vocabulary shared by every transport.
//!
//! In this vocabulary the *server* is the caller that creates the session
//! and the *client* is the callee that joins it.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{SignalError, SignalResult},
    session::Payload,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandName {
    EmitServerInit,
    EmitClientInit,
    AwaitServerInit,
    EmitClientAnswer,
    AwaitClientAnswer,
    EmitServerIceCandidate,
    EmitClientIceCandidate,
    AwaitServerIceCandidate,
    AwaitClientIceCandidate,
    EmitDone,
    AwaitDone,
}

impl CommandName {
    pub const ALL: [CommandName; 11] = [
        CommandName::EmitServerInit,
        CommandName::EmitClientInit,
        CommandName::AwaitServerInit,
        CommandName::EmitClientAnswer,
        CommandName::AwaitClientAnswer,
        CommandName::EmitServerIceCandidate,
        CommandName::EmitClientIceCandidate,
        CommandName::AwaitServerIceCandidate,
        CommandName::AwaitClientIceCandidate,
        CommandName::EmitDone,
        CommandName::AwaitDone,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandName::EmitServerInit => "emit-server-init",
            CommandName::EmitClientInit => "emit-client-init",
            CommandName::AwaitServerInit => "await-server-init",
            CommandName::EmitClientAnswer => "emit-client-answer",
            CommandName::AwaitClientAnswer => "await-client-answer",
            CommandName::EmitServerIceCandidate => "emit-server-ice-candidate",
            CommandName::EmitClientIceCandidate => "emit-client-ice-candidate",
            CommandName::AwaitServerIceCandidate => "await-server-ice-candidate",
            CommandName::AwaitClientIceCandidate => "await-client-ice-candidate",
            CommandName::EmitDone => "emit-done",
            CommandName::AwaitDone => "await-done",
        }
    }

    pub fn parse(name: &str) -> SignalResult<Self> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == name)
            .ok_or_else(|| SignalError::UnknownCommand(name.to_string()))
    }

    /// Commands that may suspend until a message arrives.
    pub fn is_wait(self) -> bool {
        matches!(
            self,
            CommandName::AwaitServerInit
                | CommandName::AwaitClientAnswer
                | CommandName::AwaitServerIceCandidate
                | CommandName::AwaitClientIceCandidate
                | CommandName::AwaitDone
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    EmitServerInit { offer: Payload },
    EmitClientInit { sid: String },
    AwaitServerInit { sid: String, cid: String },
    EmitClientAnswer { sid: String, cid: String, answer: Payload },
    AwaitClientAnswer { sid: String },
    EmitServerIceCandidate { sid: String, candidate: Payload },
    EmitClientIceCandidate { sid: String, cid: String, candidate: Payload },
    AwaitServerIceCandidate { sid: String, cid: String },
    AwaitClientIceCandidate { sid: String },
    EmitDone { sid: String, cid: String },
    AwaitDone { sid: String },
}

#[derive(Deserialize)]
struct InitBody {
    #[serde(alias = "desc")]
    offer: Payload,
}

#[derive(Deserialize)]
struct SidBody {
    sid: String,
}

#[derive(Deserialize)]
struct SidCidBody {
    sid: String,
    cid: String,
}

#[derive(Deserialize)]
struct AnswerBody {
    sid: String,
    cid: String,
    #[serde(alias = "desc")]
    answer: Payload,
}

#[derive(Deserialize)]
struct ServerCandidateBody {
    sid: String,
    candidate: Payload,
}

#[derive(Deserialize)]
struct ClientCandidateBody {
    sid: String,
    cid: String,
    candidate: Payload,
}

impl Command {
    /// Validates a raw request body for `name` without touching any session.
    pub fn parse(name: &str, body: Value) -> SignalResult<Self> {
        let command = match CommandName::parse(name)? {
            CommandName::EmitServerInit => {
                let body: InitBody = decode(body)?;
                Command::EmitServerInit {
                    offer: payload("offer", body.offer)?,
                }
            }
            CommandName::EmitClientInit => {
                let body: SidBody = decode(body)?;
                Command::EmitClientInit {
                    sid: id("sid", body.sid)?,
                }
            }
            CommandName::AwaitServerInit => {
                let body: SidCidBody = decode(body)?;
                Command::AwaitServerInit {
                    sid: id("sid", body.sid)?,
                    cid: id("cid", body.cid)?,
                }
            }
            CommandName::EmitClientAnswer => {
                let body: AnswerBody = decode(body)?;
                Command::EmitClientAnswer {
                    sid: id("sid", body.sid)?,
                    cid: id("cid", body.cid)?,
                    answer: payload("answer", body.answer)?,
                }
            }
            CommandName::AwaitClientAnswer => {
                let body: SidBody = decode(body)?;
                Command::AwaitClientAnswer {
                    sid: id("sid", body.sid)?,
                }
            }
            CommandName::EmitServerIceCandidate => {
                let body: ServerCandidateBody = decode(body)?;
                Command::EmitServerIceCandidate {
                    sid: id("sid", body.sid)?,
                    candidate: payload("candidate", body.candidate)?,
                }
            }
            CommandName::EmitClientIceCandidate => {
                let body: ClientCandidateBody = decode(body)?;
                Command::EmitClientIceCandidate {
                    sid: id("sid", body.sid)?,
                    cid: id("cid", body.cid)?,
                    candidate: payload("candidate", body.candidate)?,
                }
            }
            CommandName::AwaitServerIceCandidate => {
                let body: SidCidBody = decode(body)?;
                Command::AwaitServerIceCandidate {
                    sid: id("sid", body.sid)?,
                    cid: id("cid", body.cid)?,
                }
            }
            CommandName::AwaitClientIceCandidate => {
                let body: SidBody = decode(body)?;
                Command::AwaitClientIceCandidate {
                    sid: id("sid", body.sid)?,
                }
            }
            CommandName::EmitDone => {
                let body: SidCidBody = decode(body)?;
                Command::EmitDone {
                    sid: id("sid", body.sid)?,
                    cid: id("cid", body.cid)?,
                }
            }
            CommandName::AwaitDone => {
                let body: SidBody = decode(body)?;
                Command::AwaitDone {
                    sid: id("sid", body.sid)?,
                }
            }
        };
        Ok(command)
    }

    pub fn name(&self) -> CommandName {
        match self {
            Command::EmitServerInit { .. } => CommandName::EmitServerInit,
            Command::EmitClientInit { .. } => CommandName::EmitClientInit,
            Command::AwaitServerInit { .. } => CommandName::AwaitServerInit,
            Command::EmitClientAnswer { .. } => CommandName::EmitClientAnswer,
            Command::AwaitClientAnswer { .. } => CommandName::AwaitClientAnswer,
            Command::EmitServerIceCandidate { .. } => CommandName::EmitServerIceCandidate,
            Command::EmitClientIceCandidate { .. } => CommandName::EmitClientIceCandidate,
            Command::AwaitServerIceCandidate { .. } => CommandName::AwaitServerIceCandidate,
            Command::AwaitClientIceCandidate { .. } => CommandName::AwaitClientIceCandidate,
            Command::EmitDone { .. } => CommandName::EmitDone,
            Command::AwaitDone { .. } => CommandName::AwaitDone,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Command::EmitServerInit { .. } => None,
            Command::EmitClientInit { sid }
            | Command::AwaitServerInit { sid, .. }
            | Command::EmitClientAnswer { sid, .. }
            | Command::AwaitClientAnswer { sid }
            | Command::EmitServerIceCandidate { sid, .. }
            | Command::EmitClientIceCandidate { sid, .. }
            | Command::AwaitServerIceCandidate { sid, .. }
            | Command::AwaitClientIceCandidate { sid }
            | Command::EmitDone { sid, .. }
            | Command::AwaitDone { sid } => Some(sid),
        }
    }
}

/// Successful command result. Serializes to the bare JSON object each
/// command documents, e.g. `{"sid": "..."}` or `{}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Created { sid: String },
    Joined { cid: String },
    Offer { offer: Payload },
    Answer { answer: Payload },
    Candidates { candidates: Vec<Payload> },
    Ack {},
}

fn decode<T: DeserializeOwned>(body: Value) -> SignalResult<T> {
    if !body.is_object() {
        return Err(SignalError::invalid("request body must be a JSON object"));
    }
    serde_json::from_value(body).map_err(|err| SignalError::invalid(err.to_string()))
}

fn id(field: &str, value: String) -> SignalResult<String> {
    if value.trim().is_empty() {
        return Err(SignalError::invalid(format!("`{field}` must not be empty")));
    }
    Ok(value)
}

fn payload(field: &str, value: Payload) -> SignalResult<Payload> {
    if value.is_null() {
        return Err(SignalError::invalid(format!("`{field}` must not be null")));
    }
    Ok(value)
}
