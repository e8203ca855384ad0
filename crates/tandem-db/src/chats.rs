use anyhow::Result;

use crate::models::{CHAT_COLUMNS, ChatRow, MemberRow, NewChat, UserRow, parse_role, user_columns};
use crate::{Database, OptionalExt, now};

impl Database {
    pub fn get_chat(&self, id: i64) -> Result<Option<ChatRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM chats c WHERE c.id = ?1", CHAT_COLUMNS);
            conn.query_row(&sql, [id], ChatRow::from_row).optional()
        })
    }

    /// Chats the user belongs to, most recently updated first.
    pub fn chats_for_user(&self, user_id: i64) -> Result<Vec<ChatRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM chats c
                 JOIN chat_members m ON m.chat_id = c.id
                 WHERE m.user_id = ?1
                 ORDER BY c.updated_at DESC, c.id DESC",
                CHAT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id], ChatRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Roster in join order.
    pub fn chat_members(&self, chat_id: i64) -> Result<Vec<MemberRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT m.chat_id, m.role, m.notifications_enabled, {}
                 FROM chat_members m
                 JOIN users u ON u.id = m.user_id
                 WHERE m.chat_id = ?1
                 ORDER BY m.joined_at, m.user_id",
                user_columns("u")
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([chat_id], |row| {
                    let chat_id: i64 = row.get(0)?;
                    let role: String = row.get(1)?;
                    Ok(MemberRow {
                        chat_id,
                        role: parse_role(&role, chat_id),
                        notifications_enabled: row.get(2)?,
                        user: UserRow::from_row(row, 3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn is_member(&self, chat_id: i64, user_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let exists = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM chat_members WHERE chat_id = ?1 AND user_id = ?2)",
                [chat_id, user_id],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
    }

    /// Notification flag of one member, `None` if the user is not in the chat.
    pub fn notifications_enabled(&self, chat_id: i64, user_id: i64) -> Result<Option<bool>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT notifications_enabled FROM chat_members WHERE chat_id = ?1 AND user_id = ?2",
                [chat_id, user_id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// Returns whether a membership row was updated.
    pub fn set_notifications_enabled(&self, chat_id: i64, user_id: i64, enabled: bool) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE chat_members SET notifications_enabled = ?3 WHERE chat_id = ?1 AND user_id = ?2",
                rusqlite::params![chat_id, user_id, enabled],
            )?;
            Ok(updated > 0)
        })
    }

    /// The two-member direct chat between `a` and `b`, in either order.
    pub fn find_direct_chat(&self, a: i64, b: i64) -> Result<Option<ChatRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM chats c
                 WHERE c.is_group = 0
                   AND EXISTS (SELECT 1 FROM chat_members m WHERE m.chat_id = c.id AND m.user_id = ?1)
                   AND EXISTS (SELECT 1 FROM chat_members m WHERE m.chat_id = c.id AND m.user_id = ?2)
                   AND (SELECT COUNT(*) FROM chat_members m WHERE m.chat_id = c.id) = 2
                 ORDER BY c.id
                 LIMIT 1",
                CHAT_COLUMNS
            );
            conn.query_row(&sql, [a, b], ChatRow::from_row).optional()
        })
    }

    /// Inserts the chat and its roster in one transaction. Returns the chat id.
    pub fn create_chat(&self, chat: &NewChat) -> Result<i64> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let ts = now();

            tx.execute(
                "INSERT INTO chats (title, is_group, created_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                rusqlite::params![chat.title, chat.is_group, chat.created_by, ts],
            )?;
            let chat_id = tx.last_insert_rowid();

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO chat_members (chat_id, user_id, role, joined_at) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for (user_id, role) in &chat.members {
                    stmt.execute(rusqlite::params![chat_id, user_id, role.as_str(), ts])?;
                }
            }

            tx.commit()?;
            Ok(chat_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_types::models::Role;

    fn setup() -> (Database, i64, i64, i64) {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_user("A", "a@example.com", Some("a"), "h").unwrap();
        let b = db.create_user("B", "b@example.com", Some("b"), "h").unwrap();
        let c = db.create_user("C", "c@example.com", Some("c"), "h").unwrap();
        (db, a, b, c)
    }

    fn direct(db: &Database, a: i64, b: i64) -> i64 {
        db.create_chat(&NewChat {
            title: None,
            is_group: false,
            created_by: a,
            members: vec![(a, Role::Owner), (b, Role::Member)],
        })
        .unwrap()
    }

    #[test]
    fn direct_chat_found_in_either_order() {
        let (db, a, b, c) = setup();
        let id = direct(&db, a, b);

        assert_eq!(db.find_direct_chat(a, b).unwrap().unwrap().id, id);
        assert_eq!(db.find_direct_chat(b, a).unwrap().unwrap().id, id);
        assert!(db.find_direct_chat(a, c).unwrap().is_none());
    }

    #[test]
    fn groups_never_match_direct_lookup() {
        let (db, a, b, _) = setup();
        db.create_chat(&NewChat {
            title: Some("Pair".into()),
            is_group: true,
            created_by: a,
            members: vec![(a, Role::Owner), (b, Role::Member)],
        })
        .unwrap();

        assert!(db.find_direct_chat(a, b).unwrap().is_none());
    }

    #[test]
    fn roster_and_membership() {
        let (db, a, b, c) = setup();
        let id = direct(&db, a, b);

        let members = db.chat_members(id).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].user.id, a);
        assert_eq!(members[0].role, Role::Owner);
        assert_eq!(members[1].role, Role::Member);
        assert!(members.iter().all(|m| m.notifications_enabled));

        assert!(db.is_member(id, b).unwrap());
        assert!(!db.is_member(id, c).unwrap());
    }

    #[test]
    fn notification_flag_is_per_member() {
        let (db, a, b, c) = setup();
        let id = direct(&db, a, b);

        assert!(db.set_notifications_enabled(id, b, false).unwrap());
        assert_eq!(db.notifications_enabled(id, b).unwrap(), Some(false));
        assert_eq!(db.notifications_enabled(id, a).unwrap(), Some(true));
        assert_eq!(db.notifications_enabled(id, c).unwrap(), None);
        assert!(!db.set_notifications_enabled(id, c, false).unwrap());
    }

    #[test]
    fn failed_roster_insert_rolls_back_chat() {
        let (db, a, _, _) = setup();
        let result = db.create_chat(&NewChat {
            title: Some("Broken".into()),
            is_group: true,
            created_by: a,
            members: vec![(a, Role::Owner), (9999, Role::Member)],
        });

        assert!(result.is_err());
        assert!(db.chats_for_user(a).unwrap().is_empty());
    }
}
