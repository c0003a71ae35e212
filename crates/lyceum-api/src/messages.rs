use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, error, info};
use uuid::Uuid;

use lyceum_db::models::{MessageRow, NewMessage, ReadRow, ReadScope};
use lyceum_db::{Database, parse_id, parse_timestamp, timestamp};
use lyceum_types::api::{Claims, MarkReadResponse, MessagePage, SendMessageRequest};
use lyceum_types::models::{Message, MessageStatus, MessageType, ReadReceipt};

use crate::conversations::ConversationStore;
use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, blocking};

pub const MAX_CONTENT_CHARS: usize = 4000;
pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Persists messages and their read receipts. Access is decided by
/// conversation participation, which is delegated to the conversation store.
#[derive(Clone)]
pub struct MessageStore {
    db: Arc<Database>,
    conversations: ConversationStore,
}

impl MessageStore {
    pub fn new(db: Arc<Database>, conversations: ConversationStore) -> Self {
        Self { db, conversations }
    }

    /// Stores a message and refreshes the conversation summary.
    ///
    /// The summary refresh is a second write. If it fails the message stays
    /// stored and the summary is left stale until the next successful send.
    pub fn send(
        &self,
        sender_id: Uuid,
        conversation_id: Uuid,
        content: &str,
        message_type: MessageType,
    ) -> ApiResult<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ApiError::invalid("message content is empty"));
        }
        if content.chars().count() > MAX_CONTENT_CHARS {
            return Err(ApiError::invalid(format!(
                "message content exceeds {} characters",
                MAX_CONTENT_CHARS
            )));
        }

        let conversation = self.conversations.require_participant(conversation_id, sender_id)?;
        if !conversation.is_active {
            return Err(ApiError::forbidden("conversation is inactive"));
        }

        let new = NewMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation.id,
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            message_type: message_type.as_str().to_string(),
            created_at: timestamp(Utc::now()),
        };
        // Deactivation may land between the check above and this write.
        if !self.db.insert_message(&new)? {
            return Err(ApiError::forbidden("conversation is inactive"));
        }

        if let Err(e) = self.db.update_last_message(
            &new.conversation_id,
            &new.sender_id,
            &new.content,
            &new.created_at,
        ) {
            error!(
                "Message {} stored but summary of {} not refreshed: {:#}",
                new.id, new.conversation_id, e
            );
        }

        debug!("{} sent message {} to {}", sender_id, new.id, conversation_id);
        self.load(&new.id)
    }

    /// One page of messages in chronological order. Fetching marks every
    /// returned message as read by the requester, so this is a write.
    pub fn list(
        &self,
        conversation_id: Uuid,
        requester_id: Uuid,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> ApiResult<MessagePage> {
        self.conversations.require_participant(conversation_id, requester_id)?;

        let page = page.unwrap_or(1).max(1);
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = (page - 1).saturating_mul(limit);
        let conv_id = conversation_id.to_string();

        let mut rows = self.db.get_messages_page(&conv_id, limit + 1, offset)?;
        let has_more = rows.len() > limit as usize;
        rows.truncate(limit as usize);

        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let marked = self.db.mark_read(
            &conv_id,
            &requester_id.to_string(),
            ReadScope::Messages(&ids),
            &timestamp(Utc::now()),
        )?;
        if marked > 0 {
            debug!("{} read {} messages in {}", requester_id, marked, conversation_id);
        }

        let mut reads = group_reads(self.db.get_reads_for_messages(&ids)?);
        let mut messages = rows
            .into_iter()
            .map(|row| {
                let receipts = reads.remove(&row.id).unwrap_or_default();
                message_from_row(row, receipts)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        messages.reverse();

        Ok(MessagePage {
            messages,
            page,
            limit,
            has_more,
        })
    }

    /// Marks every unread message in the conversation as read by the
    /// requester. Returns how many messages gained a receipt.
    pub fn mark_read(&self, conversation_id: Uuid, requester_id: Uuid) -> ApiResult<usize> {
        self.conversations.require_participant(conversation_id, requester_id)?;
        let updated = self.db.mark_read(
            &conversation_id.to_string(),
            &requester_id.to_string(),
            ReadScope::All,
            &timestamp(Utc::now()),
        )?;
        Ok(updated)
    }

    /// Soft-deletes a message. Only its sender may do this.
    pub fn delete(&self, message_id: Uuid, requester_id: Uuid) -> ApiResult<Message> {
        let id = message_id.to_string();
        let row = self
            .db
            .get_message(&id)?
            .ok_or_else(|| ApiError::not_found(format!("message {}", message_id)))?;

        if row.sender_id != requester_id.to_string() {
            return Err(ApiError::forbidden("only the sender can delete a message"));
        }

        if self.db.soft_delete_message(&id, &timestamp(Utc::now()))? {
            info!("{} deleted message {}", requester_id, message_id);
        }
        self.load(&id)
    }

    fn load(&self, id: &str) -> ApiResult<Message> {
        let row = self
            .db
            .get_message(id)?
            .ok_or_else(|| ApiError::not_found(format!("message {}", id)))?;
        let reads = self.db.get_reads_for_messages(&[row.id.clone()])?;
        Ok(message_from_row(row, reads)?)
    }
}

fn group_reads(reads: Vec<ReadRow>) -> HashMap<String, Vec<ReadRow>> {
    let mut grouped: HashMap<String, Vec<ReadRow>> = HashMap::new();
    for r in reads {
        grouped.entry(r.message_id.clone()).or_default().push(r);
    }
    grouped
}

fn message_from_row(row: MessageRow, reads: Vec<ReadRow>) -> anyhow::Result<Message> {
    let read_by = reads
        .into_iter()
        .map(|r| {
            Ok(ReadReceipt {
                user_id: parse_id(&r.user_id)?,
                read_at: parse_timestamp(&r.read_at)?,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let sender_id = parse_id(&row.sender_id)?;
    let mut status: MessageStatus = row.status.parse()?;
    // Receipts appended in this same call are not in the fetched row yet.
    if read_by.iter().any(|r| r.user_id != sender_id) {
        status = status.max(MessageStatus::Read);
    }

    Ok(Message {
        id: parse_id(&row.id)?,
        conversation_id: parse_id(&row.conversation_id)?,
        sender_id,
        sender_name: row.sender_name,
        content: row.content,
        message_type: row.message_type.parse()?,
        read_by,
        status,
        is_deleted: row.is_deleted,
        deleted_at: row.deleted_at.as_deref().map(parse_timestamp).transpose()?,
        created_at: parse_timestamp(&row.created_at)?,
        updated_at: parse_timestamp(&row.updated_at)?,
    })
}

// -- Handlers --

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

/// POST /messages
pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let store = state.messages.clone();
    let message = blocking(move || {
        store.send(claims.sub, req.conversation_id, &req.content, req.message_type)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// GET /conversations/{id}/messages?page&limit
///
/// Not side-effect free: returned messages are marked read for the caller.
pub async fn list_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<PageQuery>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<MessagePage>> {
    let store = state.messages.clone();
    let page = blocking(move || store.list(conversation_id, claims.sub, query.page, query.limit)).await?;
    Ok(Json(page))
}

/// POST /conversations/{id}/read
pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<MarkReadResponse>> {
    let store = state.messages.clone();
    let updated = blocking(move || store.mark_read(conversation_id, claims.sub)).await?;
    Ok(Json(MarkReadResponse { updated }))
}

/// DELETE /messages/{id}
pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Message>> {
    let store = state.messages.clone();
    let message = blocking(move || store.delete(message_id, claims.sub)).await?;
    Ok(Json(message))
}
