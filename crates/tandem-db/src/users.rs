use anyhow::Result;
use rusqlite::Connection;

use crate::models::{ProfileUpdate, USER_COLUMN_COUNT, UserRow, user_columns};
use crate::{Database, OptionalExt, now};

impl Database {
    pub fn create_user(
        &self,
        name: &str,
        email: &str,
        nickname: Option<&str>,
        password_hash: &str,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            let ts = now();
            conn.execute(
                "INSERT INTO users (name, email, nickname, password, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                rusqlite::params![name, email, nickname, password_hash, ts],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_user_by_id(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_id(conn, id))
    }

    /// Returns the user together with the stored password hash.
    pub fn get_credentials_by_email(&self, email: &str) -> Result<Option<(UserRow, String)>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {}, u.password FROM users u WHERE u.email = ?1",
                user_columns("u")
            );
            conn.query_row(&sql, [email], |row| {
                Ok((UserRow::from_row(row, 0)?, row.get(USER_COLUMN_COUNT)?))
            })
            .optional()
        })
    }

    pub fn email_taken(&self, email: &str, except_id: Option<i64>) -> Result<bool> {
        self.with_conn(|conn| {
            let taken = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE email = ?1 AND id IS NOT ?2)",
                rusqlite::params![email, except_id],
                |row| row.get(0),
            )?;
            Ok(taken)
        })
    }

    pub fn nickname_taken(&self, nickname: &str, except_id: Option<i64>) -> Result<bool> {
        self.with_conn(|conn| {
            let taken = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE nickname = ?1 AND id IS NOT ?2)",
                rusqlite::params![nickname, except_id],
                |row| row.get(0),
            )?;
            Ok(taken)
        })
    }

    pub fn update_profile(&self, id: i64, update: &ProfileUpdate) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET
                    name = ?2,
                    email = ?3,
                    nickname = COALESCE(?4, nickname),
                    hide_email = COALESCE(?5, hide_email),
                    avatar_path = COALESCE(?6, avatar_path),
                    updated_at = ?7
                 WHERE id = ?1",
                rusqlite::params![
                    id,
                    update.name,
                    update.email,
                    update.nickname,
                    update.hide_email,
                    update.avatar_path,
                    now(),
                ],
            )?;
            Ok(())
        })
    }

    /// Exact email lookup used when adding a contact. Users who hide their email
    /// are still found while they have no nickname.
    pub fn find_contactable_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM users u
                 WHERE u.email = ?1 AND (u.hide_email = 0 OR u.nickname IS NULL)
                 ORDER BY u.id
                 LIMIT 1",
                user_columns("u")
            );
            conn.query_row(&sql, [email], |row| UserRow::from_row(row, 0))
                .optional()
        })
    }

    /// Case-insensitive substring search over nicknames, and over emails that
    /// are not hidden. `term` must already be lowercased.
    pub fn search_users(&self, term: &str, exclude_id: i64, limit: u32) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM users u
                 WHERE u.id != ?1
                   AND (unicode_lower(u.nickname) LIKE ?2 ESCAPE '\\'
                        OR (u.hide_email = 0 AND unicode_lower(u.email) LIKE ?2 ESCAPE '\\'))
                 ORDER BY unicode_lower(u.nickname)
                 LIMIT ?3",
                user_columns("u")
            );
            let pattern = format!("%{}%", escape_like(term));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![exclude_id, pattern, limit], |row| {
                    UserRow::from_row(row, 0)
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

/// Makes `%`, `_` and `\` in user input match literally.
fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn query_user_by_id(conn: &Connection, id: i64) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {} FROM users u WHERE u.id = ?1", user_columns("u"));
    conn.query_row(&sql, [id], |row| UserRow::from_row(row, 0))
        .optional()
}
