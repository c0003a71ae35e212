use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events sent over the realtime gateway, server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum GatewayEvent {
    /// Handshake accepted
    Ready { user_id: Uuid, username: String },

    UserTyping {
        user_id: Uuid,
        username: String,
        conversation_id: Uuid,
    },

    UserStoppedTyping {
        user_id: Uuid,
        username: String,
        conversation_id: Uuid,
    },

    /// Client-supplied payload relayed verbatim. Nothing is persisted on this path.
    NewMessage {
        conversation_id: Uuid,
        message: serde_json::Value,
    },

    Error { message: String },
}

impl GatewayEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Returns the conversation room this event is fanned out to, if any.
    pub fn conversation_id(&self) -> Option<Uuid> {
        match self {
            Self::UserTyping { conversation_id, .. }
            | Self::UserStoppedTyping { conversation_id, .. }
            | Self::NewMessage { conversation_id, .. } => Some(*conversation_id),
            Self::Ready { .. } | Self::Error { .. } => None,
        }
    }
}

/// Commands sent FROM client TO server over the realtime gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum GatewayCommand {
    /// Join the personal room. Only the connection's own user id is accepted.
    Join { user_id: Uuid },

    JoinConversation { conversation_id: Uuid },

    LeaveConversation { conversation_id: Uuid },

    TypingStart { conversation_id: Uuid },

    TypingStop { conversation_id: Uuid },

    /// Echo a message to the conversation room (no persistence).
    SendMessage {
        conversation_id: Uuid,
        message: serde_json::Value,
    },
}
