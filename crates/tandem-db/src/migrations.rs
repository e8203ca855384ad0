use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL,
            nickname    TEXT UNIQUE,
            email       TEXT NOT NULL UNIQUE,
            hide_email  INTEGER NOT NULL DEFAULT 0,
            avatar_path TEXT,
            password    TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS contacts (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id         INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            contact_user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            alias           TEXT,
            created_at      TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at      TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(user_id, contact_user_id),
            CHECK (user_id <> contact_user_id)
        );

        CREATE TABLE IF NOT EXISTS chats (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            title       TEXT,
            is_group    INTEGER NOT NULL DEFAULT 0,
            created_by  INTEGER NOT NULL REFERENCES users(id),
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_chats_updated
            ON chats(updated_at);

        CREATE TABLE IF NOT EXISTS chat_members (
            chat_id                 INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            user_id                 INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            role                    TEXT NOT NULL CHECK (role IN ('owner', 'member')),
            notifications_enabled   INTEGER NOT NULL DEFAULT 1,
            joined_at               TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (chat_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_chat_members_user
            ON chat_members(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id                 INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            user_id                 INTEGER NOT NULL REFERENCES users(id),
            body                    TEXT NOT NULL,
            forwarded_message_id    INTEGER REFERENCES messages(id) ON DELETE SET NULL,
            edited_at               TEXT,
            created_at              TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at              TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_messages_chat
            ON messages(chat_id, created_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
