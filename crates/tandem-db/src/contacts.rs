use anyhow::Result;
use rusqlite::Row;

use crate::models::{ContactRow, UserRow, user_columns};
use crate::{Database, OptionalExt, now};

fn contact_query(filter: &str) -> String {
    format!(
        "SELECT c.id, c.user_id, c.alias, c.created_at, {}
         FROM contacts c
         JOIN users u ON u.id = c.contact_user_id
         {}",
        user_columns("u"),
        filter
    )
}

fn contact_from_row(row: &Row<'_>) -> rusqlite::Result<ContactRow> {
    Ok(ContactRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        alias: row.get(2)?,
        created_at: row.get(3)?,
        contact: UserRow::from_row(row, 4)?,
    })
}

impl Database {
    /// Newest first.
    pub fn list_contacts(&self, owner_id: i64) -> Result<Vec<ContactRow>> {
        self.with_conn(|conn| {
            let sql = contact_query("WHERE c.user_id = ?1 ORDER BY c.created_at DESC, c.id DESC");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([owner_id], contact_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_contact(&self, id: i64) -> Result<Option<ContactRow>> {
        self.with_conn(|conn| {
            conn.query_row(&contact_query("WHERE c.id = ?1"), [id], contact_from_row)
                .optional()
        })
    }

    /// Create-or-update keyed by (owner, target). A non-empty `alias` replaces
    /// the stored one; `None` or an empty alias never clears it.
    /// Returns the contact id.
    pub fn upsert_contact(&self, owner_id: i64, target_id: i64, alias: Option<&str>) -> Result<i64> {
        let alias = alias.filter(|a| !a.is_empty());

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let ts = now();

            tx.execute(
                "INSERT INTO contacts (user_id, contact_user_id, alias, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(user_id, contact_user_id) DO NOTHING",
                rusqlite::params![owner_id, target_id, alias, ts],
            )?;

            if let Some(alias) = alias {
                tx.execute(
                    "UPDATE contacts SET alias = ?3, updated_at = ?4
                     WHERE user_id = ?1 AND contact_user_id = ?2 AND alias IS NOT ?3",
                    rusqlite::params![owner_id, target_id, alias, ts],
                )?;
            }

            let id: i64 = tx.query_row(
                "SELECT id FROM contacts WHERE user_id = ?1 AND contact_user_id = ?2",
                [owner_id, target_id],
                |row| row.get(0),
            )?;

            tx.commit()?;
            Ok(id)
        })
    }

    pub fn delete_contact(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM contacts WHERE id = ?1", [id])?;
            Ok(deleted > 0)
        })
    }

    pub fn is_contact(&self, owner_id: i64, target_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let exists = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM contacts WHERE user_id = ?1 AND contact_user_id = ?2)",
                [owner_id, target_id],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
    }

    /// Subset of `candidates` that are contacts of `owner_id`.
    pub fn contact_ids_among(&self, owner_id: i64, candidates: &[i64]) -> Result<Vec<i64>> {
        if candidates.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (2..=candidates.len() + 1).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT contact_user_id FROM contacts WHERE user_id = ?1 AND contact_user_id IN ({})",
                placeholders.join(", ")
            );

            let mut params: Vec<&dyn rusqlite::types::ToSql> = Vec::with_capacity(candidates.len() + 1);
            params.push(&owner_id);
            params.extend(candidates.iter().map(|id| id as &dyn rusqlite::types::ToSql));

            let mut stmt = conn.prepare(&sql)?;
            let ids = stmt
                .query_map(params.as_slice(), |row| row.get(0))?
                .collect::<std::result::Result<Vec<i64>, _>>()?;

            Ok(ids)
        })
    }
}
