use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);"
    )?;

    let version: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (directory + messaging schema)");
        conn.execute_batch(
            "
            -- Directory tables. Owned by the account/enrollment subsystems;
            -- the messaging core only reads them.
            CREATE TABLE users (
                id            TEXT PRIMARY KEY,
                username      TEXT NOT NULL UNIQUE,
                display_name  TEXT NOT NULL,
                role          TEXT NOT NULL CHECK (role IN ('admin', 'teacher', 'student')),
                password      TEXT NOT NULL,
                avatar_url    TEXT,
                created_at    TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE class_sections (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL UNIQUE,
                teacher_id  TEXT NOT NULL REFERENCES users(id),
                created_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX idx_class_sections_teacher ON class_sections(teacher_id);

            CREATE TABLE enrollments (
                student_id  TEXT NOT NULL REFERENCES users(id),
                class_id    TEXT NOT NULL REFERENCES class_sections(id),
                status      TEXT NOT NULL CHECK (status IN ('enrolled', 'dropped')),
                updated_at  TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (student_id, class_id)
            );

            CREATE INDEX idx_enrollments_class ON enrollments(class_id, status);

            -- Messaging tables.
            CREATE TABLE conversations (
                id              TEXT PRIMARY KEY,
                kind            TEXT NOT NULL CHECK (kind IN ('direct', 'group', 'class')),
                name            TEXT,
                class_id        TEXT REFERENCES class_sections(id),
                pair_key        TEXT,
                is_active       INTEGER NOT NULL DEFAULT 1,
                last_sender_id  TEXT,
                last_content    TEXT,
                last_sent_at    TEXT,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );

            -- At most one active direct conversation per unordered pair.
            CREATE UNIQUE INDEX idx_conversations_active_pair
                ON conversations(pair_key)
                WHERE kind = 'direct' AND is_active = 1;

            CREATE TABLE conversation_participants (
                conversation_id  TEXT NOT NULL REFERENCES conversations(id),
                user_id          TEXT NOT NULL REFERENCES users(id),
                role             TEXT NOT NULL,
                joined_at        TEXT NOT NULL,
                PRIMARY KEY (conversation_id, user_id)
            );

            CREATE INDEX idx_participants_user ON conversation_participants(user_id);

            CREATE TABLE messages (
                id               TEXT PRIMARY KEY,
                conversation_id  TEXT NOT NULL REFERENCES conversations(id),
                sender_id        TEXT NOT NULL REFERENCES users(id),
                content          TEXT NOT NULL,
                message_type     TEXT NOT NULL DEFAULT 'text',
                status           TEXT NOT NULL DEFAULT 'sent',
                is_deleted       INTEGER NOT NULL DEFAULT 0,
                deleted_at       TEXT,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            );

            CREATE INDEX idx_messages_conversation
                ON messages(conversation_id, created_at);

            -- Read receipts: one row per (message, user), never removed.
            CREATE TABLE message_reads (
                message_id  TEXT NOT NULL REFERENCES messages(id),
                user_id     TEXT NOT NULL REFERENCES users(id),
                read_at     TEXT NOT NULL,
                PRIMARY KEY (message_id, user_id)
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }
}
