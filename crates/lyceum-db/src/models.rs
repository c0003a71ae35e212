/// Database row types. These map directly to SQLite rows.
/// Distinct from lyceum-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub role: String,
    pub password: String,
    pub avatar_url: Option<String>,
}

pub struct ClassSectionRow {
    pub id: String,
    pub name: String,
    pub teacher_id: String,
}

pub struct ConversationRow {
    pub id: String,
    pub kind: String,
    pub name: Option<String>,
    pub class_id: Option<String>,
    pub is_active: bool,
    pub last_sender_id: Option<String>,
    pub last_content: Option<String>,
    pub last_sent_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct ParticipantRow {
    pub conversation_id: String,
    pub user_id: String,
    pub role: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub joined_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub message_type: String,
    pub status: String,
    pub is_deleted: bool,
    pub deleted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct ReadRow {
    pub message_id: String,
    pub user_id: String,
    pub read_at: String,
}

/// Insert payload for a conversation and its initial participant set.
pub struct NewConversation {
    pub id: String,
    pub kind: String,
    pub name: Option<String>,
    pub class_id: Option<String>,
    /// Canonical sorted-pair key; only set for direct conversations.
    pub pair_key: Option<String>,
    /// (user_id, role)
    pub participants: Vec<(String, String)>,
    pub created_at: String,
}

pub struct NewMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub message_type: String,
    pub created_at: String,
}

/// Which messages a read-receipt batch applies to.
pub enum ReadScope<'a> {
    /// Every message in the conversation.
    All,
    /// Only the listed message ids (e.g. one fetched page).
    Messages(&'a [String]),
}
