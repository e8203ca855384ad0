/// Database row types, mapped directly from SQLite rows.
/// Distinct from tandem-types API models to keep the DB layer independent.
use rusqlite::Row;
use tandem_types::models::Role;
use tracing::warn;

pub struct UserRow {
    pub id: i64,
    pub name: String,
    pub nickname: Option<String>,
    pub email: String,
    pub hide_email: bool,
    pub avatar_path: Option<String>,
    pub created_at: String,
}

/// Column list matching `UserRow::from_row`, qualified with a table alias.
pub(crate) fn user_columns(alias: &str) -> String {
    format!(
        "{a}.id, {a}.name, {a}.nickname, {a}.email, {a}.hide_email, {a}.avatar_path, {a}.created_at",
        a = alias
    )
}

pub(crate) const USER_COLUMN_COUNT: usize = 7;

impl UserRow {
    pub(crate) fn from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(offset)?,
            name: row.get(offset + 1)?,
            nickname: row.get(offset + 2)?,
            email: row.get(offset + 3)?,
            hide_email: row.get(offset + 4)?,
            avatar_path: row.get(offset + 5)?,
            created_at: row.get(offset + 6)?,
        })
    }
}

/// Fields written by a profile edit. `None` keeps the stored value.
pub struct ProfileUpdate {
    pub name: String,
    pub email: String,
    pub nickname: Option<String>,
    pub hide_email: Option<bool>,
    pub avatar_path: Option<String>,
}

pub struct ContactRow {
    pub id: i64,
    pub user_id: i64,
    pub alias: Option<String>,
    pub created_at: String,
    pub contact: UserRow,
}

pub struct ChatRow {
    pub id: i64,
    pub title: Option<String>,
    pub is_group: bool,
    pub created_by: i64,
    pub created_at: String,
    pub updated_at: String,
}

pub(crate) const CHAT_COLUMNS: &str =
    "c.id, c.title, c.is_group, c.created_by, c.created_at, c.updated_at";

impl ChatRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            is_group: row.get(2)?,
            created_by: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }
}

/// Chat to be created together with its roster.
pub struct NewChat {
    pub title: Option<String>,
    pub is_group: bool,
    pub created_by: i64,
    pub members: Vec<(i64, Role)>,
}

pub struct MemberRow {
    pub chat_id: i64,
    pub role: Role,
    pub notifications_enabled: bool,
    pub user: UserRow,
}

pub(crate) fn parse_role(raw: &str, chat_id: i64) -> Role {
    Role::parse(raw).unwrap_or_else(|| {
        warn!("Corrupt role '{}' in chat {}", raw, chat_id);
        Role::Member
    })
}

pub struct ForwardedRow {
    pub id: i64,
    pub chat_id: i64,
    pub user_id: i64,
    pub body: String,
    pub edited_at: Option<String>,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: i64,
    pub chat_id: i64,
    pub user_id: i64,
    pub body: String,
    pub forwarded_message_id: Option<i64>,
    pub edited_at: Option<String>,
    pub created_at: String,
    pub sender: UserRow,
    /// `None` when the message is not a forward or its source was deleted.
    pub forwarded: Option<ForwardedRow>,
}
