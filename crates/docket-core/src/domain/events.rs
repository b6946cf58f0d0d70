//! Real-time wire protocol: JSON envelopes `{type, payload...}`.

use serde::{Deserialize, Serialize};

use super::{ProgressSnapshot, UserId};

/// Inbound events (client -> server).
///
/// Unknown types and malformed payloads are protocol errors: reported back to
/// the offending connection as an `error` event, connection stays open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    Typing {
        is_typing: bool,
    },
    ChatMessage {
        text: String,
    },
    JurisdictionUpdate {
        jurisdiction: String,
    },
    RequestContext,
}

/// Outbound events (server -> connections).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Reply to the joining connection with the current member list.
    SessionJoined {
        user_id: UserId,
        users: Vec<UserId>,
    },
    UserJoined {
        user_id: UserId,
    },
    UserLeft {
        user_id: UserId,
    },
    TypingUpdate {
        user_id: UserId,
        is_typing: bool,
        typing_users: Vec<UserId>,
    },
    UserMessage {
        user_id: UserId,
        text: String,
    },
    JurisdictionUpdate {
        user_id: UserId,
        jurisdiction: String,
    },
    AiTyping,
    AiMessage {
        text: String,
    },
    AiError {
        message: String,
    },
    /// Reply to `request_context`: who is here and who is typing.
    SessionContext {
        users: Vec<UserId>,
        typing_users: Vec<UserId>,
    },
    /// Progress push for a task registered against this session/user.
    TaskProgress {
        snapshot: ProgressSnapshot,
    },
    Error {
        message: String,
    },
    /// Heartbeat after 30s of inbound silence on a monitoring channel.
    Ping,
}
