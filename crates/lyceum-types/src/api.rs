use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ConversationKind, Message, MessageType, Role, User};

// -- JWT Claims --

/// JWT claims shared across lyceum-api (REST middleware) and lyceum-gateway
/// (WebSocket handshake).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub role: Role,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub display_name: String,
    pub role: Role,
    pub token: String,
}

// -- Recipients --

/// Contactable users, bucketed relative to the actor's role.
///
/// `classmates` holds same-role peers: co-enrolled students for a student,
/// co-teachers for a teacher. Students reachable by an admin or a teacher
/// go into `students`, which is always empty for a student actor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Contacts {
    pub admins: Vec<User>,
    pub teachers: Vec<User>,
    pub classmates: Vec<User>,
    #[serde(default)]
    pub students: Vec<User>,
}

impl Contacts {
    pub fn contains(&self, user_id: Uuid) -> bool {
        self.iter().any(|u| u.id == user_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &User> {
        self.admins
            .iter()
            .chain(self.teachers.iter())
            .chain(self.classmates.iter())
            .chain(self.students.iter())
    }

    pub fn len(&self) -> usize {
        self.admins.len() + self.teachers.len() + self.classmates.len() + self.students.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateConversationRequest {
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    #[serde(default)]
    pub participant_ids: Vec<Uuid>,
    pub class_id: Option<Uuid>,
    pub name: Option<String>,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SendMessageRequest {
    pub conversation_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub page: u32,
    pub limit: u32,
    pub has_more: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub updated: usize,
}

// -- Errors --

/// Structured error body: `{"error": {"code": ..., "message": ...}}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}
