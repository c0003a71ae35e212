use std::collections::HashMap;

use crate::Database;
use crate::models::{
    ConversationRow, MessageRow, NewConversation, NewMessage, ParticipantRow, ReadRow, ReadScope,
};
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};

const CONVERSATION_COLUMNS: &str = "id, kind, name, class_id, is_active, last_sender_id, last_content, last_sent_at, created_at, updated_at";

impl Database {
    // -- Conversations --

    /// Inserts a conversation and its participants in one transaction.
    pub fn insert_conversation(&self, new: &NewConversation) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;
            insert_conversation_rows(&tx, new)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Atomic find-or-insert for direct conversations, keyed by the canonical
    /// sorted pair. Returns the id of the active conversation for the pair and
    /// whether this call created it.
    ///
    /// The partial unique index on `pair_key` rejects a second active row for
    /// the same pair even if another writer slipped in; `INSERT OR IGNORE`
    /// turns that into "someone else won" and we return their row.
    pub fn find_or_insert_direct(&self, new: &NewConversation) -> Result<(String, bool)> {
        let pair_key = new
            .pair_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("direct conversation without pair key"))?;

        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO conversations (id, kind, name, class_id, pair_key, is_active, created_at, updated_at)
                 VALUES (?1, 'direct', ?2, NULL, ?3, 1, ?4, ?4)",
                rusqlite::params![new.id, new.name, pair_key, new.created_at],
            )?;

            if inserted == 0 {
                let existing: String = tx.query_row(
                    "SELECT id FROM conversations WHERE pair_key = ?1 AND kind = 'direct' AND is_active = 1",
                    [pair_key],
                    |row| row.get(0),
                )?;
                tx.commit()?;
                return Ok((existing, false));
            }

            insert_participants(&tx, &new.id, &new.participants, &new.created_at)?;
            tx.commit()?;
            Ok((new.id.clone(), true))
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM conversations WHERE id = ?1", CONVERSATION_COLUMNS);
            let row = conn.query_row(&sql, [id], map_conversation).optional()?;
            Ok(row)
        })
    }

    /// Active conversations the user participates in, most recently updated first.
    pub fn list_conversations_for_user(&self, user_id: &str) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM conversations
                 WHERE is_active = 1
                   AND id IN (SELECT conversation_id FROM conversation_participants WHERE user_id = ?1)
                 ORDER BY updated_at DESC, rowid DESC",
                CONVERSATION_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id], map_conversation)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn is_participant(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM conversation_participants WHERE conversation_id = ?1 AND user_id = ?2",
                    [conversation_id, user_id],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Batch-fetch participants (with display info) for a set of conversations.
    pub fn get_participants_for_conversations(
        &self,
        conversation_ids: &[String],
    ) -> Result<Vec<ParticipantRow>> {
        if conversation_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT p.conversation_id, p.user_id, p.role, u.display_name, u.avatar_url, p.joined_at
                 FROM conversation_participants p
                 LEFT JOIN users u ON u.id = p.user_id
                 WHERE p.conversation_id IN ({})
                 ORDER BY p.joined_at, p.rowid",
                placeholders(conversation_ids.len())
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(conversation_ids), |row| {
                    Ok(ParticipantRow {
                        conversation_id: row.get(0)?,
                        user_id: row.get(1)?,
                        role: row.get(2)?,
                        display_name: row
                            .get::<_, Option<String>>(3)?
                            .unwrap_or_else(|| "unknown".to_string()),
                        avatar_url: row.get(4)?,
                        joined_at: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Adds participants that are not already present. Returns how many were added.
    pub fn add_participants(
        &self,
        conversation_id: &str,
        participants: &[(String, String)],
        joined_at: &str,
    ) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;
            let added = insert_participants(&tx, conversation_id, participants, joined_at)?;
            tx.commit()?;
            Ok(added)
        })
    }

    /// Refreshes the denormalized last-message summary. A separate write from
    /// the message insert: if this one fails the message is still stored and
    /// the next successful send overwrites the stale summary.
    pub fn update_last_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        sent_at: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE conversations
                 SET last_sender_id = ?2, last_content = ?3, last_sent_at = ?4, updated_at = ?4
                 WHERE id = ?1",
                [conversation_id, sender_id, content, sent_at],
            )?;
            Ok(())
        })
    }

    /// Soft-disables a conversation. Returns false if it was already inactive.
    pub fn deactivate_conversation(&self, id: &str, updated_at: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE conversations SET is_active = 0, updated_at = ?2 WHERE id = ?1 AND is_active = 1",
                [id, updated_at],
            )?;
            Ok(changed == 1)
        })
    }

    /// Per-conversation count of messages the user has not read yet.
    pub fn unread_counts(
        &self,
        user_id: &str,
        conversation_ids: &[String],
    ) -> Result<HashMap<String, u32>> {
        if conversation_ids.is_empty() {
            return Ok(HashMap::new());
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT m.conversation_id, COUNT(*)
                 FROM messages m
                 WHERE m.conversation_id IN ({})
                   AND m.is_deleted = 0
                   AND m.sender_id != ?1
                   AND NOT EXISTS (SELECT 1 FROM message_reads r
                                   WHERE r.message_id = m.id AND r.user_id = ?1)
                 GROUP BY m.conversation_id",
                numbered_placeholders(2, conversation_ids.len())
            );

            let mut params: Vec<&str> = Vec::with_capacity(conversation_ids.len() + 1);
            params.push(user_id);
            params.extend(conversation_ids.iter().map(String::as_str));

            let mut stmt = conn.prepare(&sql)?;
            let counts = stmt
                .query_map(rusqlite::params_from_iter(params), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
                })?
                .collect::<std::result::Result<HashMap<_, _>, _>>()?;
            Ok(counts)
        })
    }

    // -- Messages --

    /// Inserts a message together with the sender's own read receipt.
    /// Returns false, writing nothing, when the conversation is missing or
    /// no longer active at the time of the write.
    pub fn insert_message(&self, new: &NewMessage) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;
            let inserted = tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content, message_type, status, created_at, updated_at)
                 SELECT ?1, ?2, ?3, ?4, ?5, 'sent', ?6, ?6
                 WHERE EXISTS (SELECT 1 FROM conversations WHERE id = ?2 AND is_active = 1)",
                rusqlite::params![
                    new.id,
                    new.conversation_id,
                    new.sender_id,
                    new.content,
                    new.message_type,
                    new.created_at
                ],
            )?;
            if inserted == 0 {
                return Ok(false);
            }
            tx.execute(
                "INSERT INTO message_reads (message_id, user_id, read_at) VALUES (?1, ?2, ?3)",
                [&new.id, &new.sender_id, &new.created_at],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT m.id, m.conversation_id, m.sender_id, u.display_name, m.content, m.message_type,
                            m.status, m.is_deleted, m.deleted_at, m.created_at, m.updated_at
                     FROM messages m
                     LEFT JOIN users u ON m.sender_id = u.id
                     WHERE m.id = ?1",
                    [id],
                    map_message,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Newest-first page of non-deleted messages.
    pub fn get_messages_page(
        &self,
        conversation_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_messages(conn, conversation_id, limit, offset))
    }

    /// Batch-fetch read receipts for a set of message IDs, oldest receipt first.
    pub fn get_reads_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReadRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT message_id, user_id, read_at FROM message_reads
                 WHERE message_id IN ({})
                 ORDER BY read_at, rowid",
                placeholders(message_ids.len())
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(message_ids), |row| {
                    Ok(ReadRow {
                        message_id: row.get(0)?,
                        user_id: row.get(1)?,
                        read_at: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Appends a read receipt for `reader_id` to every in-scope message that
    /// the reader did not send and has not read yet, and promotes those
    /// messages to `read`. Runs as one transaction; returns how many messages
    /// gained a receipt. Calling it again is a no-op.
    pub fn mark_read(
        &self,
        conversation_id: &str,
        reader_id: &str,
        scope: ReadScope<'_>,
        read_at: &str,
    ) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;

            let candidates: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT m.id FROM messages m
                     WHERE m.conversation_id = ?1
                       AND m.sender_id != ?2
                       AND m.is_deleted = 0
                       AND NOT EXISTS (SELECT 1 FROM message_reads r
                                       WHERE r.message_id = m.id AND r.user_id = ?2)",
                )?;
                stmt.query_map([conversation_id, reader_id], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };

            let targets = candidates.into_iter().filter(|id| match &scope {
                ReadScope::All => true,
                ReadScope::Messages(ids) => ids.contains(id),
            });

            let mut updated = 0;
            for message_id in targets {
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at) VALUES (?1, ?2, ?3)",
                    [message_id.as_str(), reader_id, read_at],
                )?;
                if inserted == 1 {
                    tx.execute(
                        "UPDATE messages SET status = 'read', updated_at = ?2 WHERE id = ?1 AND status != 'read'",
                        [message_id.as_str(), read_at],
                    )?;
                    updated += 1;
                }
            }

            tx.commit()?;
            Ok(updated)
        })
    }

    /// Soft-deletes a message. Returns false if it was already deleted.
    pub fn soft_delete_message(&self, id: &str, deleted_at: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET is_deleted = 1, deleted_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND is_deleted = 0",
                [id, deleted_at],
            )?;
            Ok(changed == 1)
        })
    }
}

fn insert_conversation_rows(conn: &Connection, new: &NewConversation) -> Result<()> {
    conn.execute(
        "INSERT INTO conversations (id, kind, name, class_id, pair_key, is_active, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)",
        rusqlite::params![
            new.id,
            new.kind,
            new.name,
            new.class_id,
            new.pair_key,
            new.created_at
        ],
    )?;
    insert_participants(conn, &new.id, &new.participants, &new.created_at)?;
    Ok(())
}

fn insert_participants(
    conn: &Connection,
    conversation_id: &str,
    participants: &[(String, String)],
    joined_at: &str,
) -> Result<usize> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id, role, joined_at)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    let mut added = 0;
    for (user_id, role) in participants {
        added += stmt.execute([conversation_id, user_id.as_str(), role.as_str(), joined_at])?;
    }
    Ok(added)
}

fn query_messages(
    conn: &Connection,
    conversation_id: &str,
    limit: u32,
    offset: u32,
) -> Result<Vec<MessageRow>> {
    // JOIN users to fetch the sender name in a single query
    let mut stmt = conn.prepare(
        "SELECT m.id, m.conversation_id, m.sender_id, u.display_name, m.content, m.message_type,
                m.status, m.is_deleted, m.deleted_at, m.created_at, m.updated_at
         FROM messages m
         LEFT JOIN users u ON m.sender_id = u.id
         WHERE m.conversation_id = ?1 AND m.is_deleted = 0
         ORDER BY m.created_at DESC, m.rowid DESC
         LIMIT ?2 OFFSET ?3",
    )?;

    let rows = stmt
        .query_map(rusqlite::params![conversation_id, limit, offset], map_message)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn map_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        name: row.get(2)?,
        class_id: row.get(3)?,
        is_active: row.get(4)?,
        last_sender_id: row.get(5)?,
        last_content: row.get(6)?,
        last_sent_at: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_name: row
            .get::<_, Option<String>>(3)?
            .unwrap_or_else(|| "unknown".to_string()),
        content: row.get(4)?,
        message_type: row.get(5)?,
        status: row.get(6)?,
        is_deleted: row.get(7)?,
        deleted_at: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn placeholders(n: usize) -> String {
    numbered_placeholders(1, n)
}

fn numbered_placeholders(first: usize, n: usize) -> String {
    (first..first + n)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}
