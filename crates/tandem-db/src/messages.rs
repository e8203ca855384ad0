use anyhow::Result;
use rusqlite::{Connection, Row};

use crate::models::{ForwardedRow, MessageRow, USER_COLUMN_COUNT, UserRow, user_columns};
use crate::{Database, OptionalExt, now};

fn message_query(filter: &str) -> String {
    // JOIN users for the sender and LEFT JOIN the forward source in one query
    format!(
        "SELECT m.id, m.chat_id, m.user_id, m.body, m.forwarded_message_id, m.edited_at, m.created_at,
                {},
                f.id, f.chat_id, f.user_id, f.body, f.edited_at, f.created_at
         FROM messages m
         JOIN users u ON u.id = m.user_id
         LEFT JOIN messages f ON f.id = m.forwarded_message_id
         {}",
        user_columns("u"),
        filter
    )
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    let fwd = 7 + USER_COLUMN_COUNT;
    let forwarded = match row.get::<_, Option<i64>>(fwd)? {
        Some(id) => Some(ForwardedRow {
            id,
            chat_id: row.get(fwd + 1)?,
            user_id: row.get(fwd + 2)?,
            body: row.get(fwd + 3)?,
            edited_at: row.get(fwd + 4)?,
            created_at: row.get(fwd + 5)?,
        }),
        None => None,
    };

    Ok(MessageRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        user_id: row.get(2)?,
        body: row.get(3)?,
        forwarded_message_id: row.get(4)?,
        edited_at: row.get(5)?,
        created_at: row.get(6)?,
        sender: UserRow::from_row(row, 7)?,
        forwarded,
    })
}

impl Database {
    /// Inserts the message and bumps the chat's `updated_at` in one
    /// transaction. Returns the message id.
    pub fn insert_message(
        &self,
        chat_id: i64,
        sender_id: i64,
        body: &str,
        forwarded_message_id: Option<i64>,
    ) -> Result<i64> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let ts = now();

            tx.execute(
                "INSERT INTO messages (chat_id, user_id, body, forwarded_message_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                rusqlite::params![chat_id, sender_id, body, forwarded_message_id, ts],
            )?;
            let message_id = tx.last_insert_rowid();

            tx.execute(
                "UPDATE chats SET updated_at = ?2 WHERE id = ?1",
                rusqlite::params![chat_id, ts],
            )?;

            tx.commit()?;
            Ok(message_id)
        })
    }

    pub fn get_message(&self, id: i64) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// Full history, oldest first.
    pub fn chat_messages(&self, chat_id: i64) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let sql = message_query("WHERE m.chat_id = ?1 ORDER BY m.created_at ASC, m.id ASC");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([chat_id], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn last_message(&self, chat_id: i64) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let sql = message_query(
                "WHERE m.chat_id = ?1 ORDER BY m.created_at DESC, m.id DESC LIMIT 1",
            );
            conn.query_row(&sql, [chat_id], message_from_row).optional()
        })
    }

    /// Replaces the body and stamps `edited_at`.
    pub fn update_message_body(&self, id: i64, body: &str) -> Result<()> {
        self.with_conn(|conn| {
            let ts = now();
            conn.execute(
                "UPDATE messages SET body = ?2, edited_at = ?3, updated_at = ?3 WHERE id = ?1",
                rusqlite::params![id, body, ts],
            )?;
            Ok(())
        })
    }

    /// Hard delete. Forwards pointing here get their reference nulled by the schema.
    pub fn delete_message(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            Ok(deleted > 0)
        })
    }
}

fn query_message(conn: &Connection, id: i64) -> Result<Option<MessageRow>> {
    conn.query_row(&message_query("WHERE m.id = ?1"), [id], message_from_row)
        .optional()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewChat;
    use tandem_types::models::Role;

    fn setup() -> (Database, i64, i64, i64) {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_user("A", "a@example.com", Some("a"), "h").unwrap();
        let b = db.create_user("B", "b@example.com", Some("b"), "h").unwrap();
        let chat = db
            .create_chat(&NewChat {
                title: None,
                is_group: false,
                created_by: a,
                members: vec![(a, Role::Owner), (b, Role::Member)],
            })
            .unwrap();
        (db, a, b, chat)
    }

    #[test]
    fn insert_loads_sender() {
        let (db, a, _, chat) = setup();
        let id = db.insert_message(chat, a, "hello", None).unwrap();

        let row = db.get_message(id).unwrap().unwrap();
        assert_eq!(row.body, "hello");
        assert_eq!(row.sender.id, a);
        assert!(row.forwarded.is_none());
        assert!(row.edited_at.is_none());
    }

    #[test]
    fn insert_touches_chat() {
        let (db, a, _, chat) = setup();
        let before = db.get_chat(chat).unwrap().unwrap().updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));

        db.insert_message(chat, a, "bump", None).unwrap();

        let after = db.get_chat(chat).unwrap().unwrap().updated_at;
        assert!(after > before);
    }

    #[test]
    fn last_message_is_newest() {
        let (db, a, b, chat) = setup();
        assert!(db.last_message(chat).unwrap().is_none());

        db.insert_message(chat, a, "one", None).unwrap();
        let two = db.insert_message(chat, b, "two", None).unwrap();

        assert_eq!(db.last_message(chat).unwrap().unwrap().id, two);
        let history: Vec<String> = db.chat_messages(chat).unwrap().into_iter().map(|m| m.body).collect();
        assert_eq!(history, vec!["one", "two"]);
    }

    #[test]
    fn deleting_source_nulls_forward_reference() {
        let (db, a, b, chat) = setup();
        let source = db.insert_message(chat, a, "original", None).unwrap();
        let copy = db.insert_message(chat, b, "original", Some(source)).unwrap();

        let row = db.get_message(copy).unwrap().unwrap();
        assert_eq!(row.forwarded.as_ref().map(|f| f.id), Some(source));

        assert!(db.delete_message(source).unwrap());
        assert!(!db.delete_message(source).unwrap());

        let row = db.get_message(copy).unwrap().unwrap();
        assert!(row.forwarded.is_none());
        assert!(row.forwarded_message_id.is_none());
        assert_eq!(row.body, "original");
    }

    #[test]
    fn edit_sets_marker() {
        let (db, a, _, chat) = setup();
        let id = db.insert_message(chat, a, "draft", None).unwrap();

        db.update_message_body(id, "final").unwrap();

        let row = db.get_message(id).unwrap().unwrap();
        assert_eq!(row.body, "final");
        assert!(row.edited_at.is_some());
    }
}
