//! Persistent user records: name, access level and face templates.

use facegate_core::{AccessLevel, FeatureVector, UserProfile};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS users (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    name         TEXT NOT NULL,
    access_level INTEGER NOT NULL,
    templates    TEXT NOT NULL,
    created_at   TEXT NOT NULL
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("template encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("user name must not be empty")]
    EmptyName,
}

/// Listing row without template data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserSummary {
    pub id: i64,
    pub name: String,
    pub access_level: AccessLevel,
    pub templates: usize,
    pub created_at: String,
}

/// SQLite-backed user store.
pub struct UserStore {
    conn: Connection,
}

impl UserStore {
    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self::init(Connection::open(path)?)?;
        tracing::info!(path = %path.display(), "user store opened");
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    /// All users with decodable records, in id order.
    pub fn list_users(&self) -> Result<Vec<UserProfile>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, access_level, templates FROM users ORDER BY id")?;
        let rows = stmt.query_map([], RawUser::from_row)?;

        let mut users = Vec::new();
        for row in rows {
            if let Some(user) = row?.decode() {
                users.push(user);
            }
        }
        Ok(users)
    }

    pub fn get_user(&self, id: i64) -> Result<Option<UserProfile>, StoreError> {
        let raw = self
            .conn
            .query_row(
                "SELECT id, name, access_level, templates FROM users WHERE id = ?1",
                params![id],
                RawUser::from_row,
            )
            .optional()?;
        Ok(raw.and_then(RawUser::decode))
    }

    /// Listing for management surfaces.
    pub fn summaries(&self) -> Result<Vec<UserSummary>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, access_level, templates, created_at FROM users ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((RawUser::from_row(row)?, row.get::<_, String>(4)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (raw, created_at) = row?;
            if let Some(user) = raw.decode() {
                out.push(UserSummary {
                    id: user.id,
                    name: user.name,
                    access_level: user.access_level,
                    templates: user.templates.len(),
                    created_at,
                });
            }
        }
        Ok(out)
    }

    /// Insert a user and return the new id. An empty template list is
    /// allowed; such a user can never be matched.
    pub fn register(
        &self,
        name: &str,
        access_level: AccessLevel,
        templates: &[FeatureVector],
    ) -> Result<i64, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::EmptyName);
        }
        let encoded = serde_json::to_string(templates)?;
        let created_at = chrono::Utc::now().to_rfc3339();

        self.conn.execute(
            "INSERT INTO users (name, access_level, templates, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, u8::from(access_level), encoded, created_at],
        )?;
        let id = self.conn.last_insert_rowid();
        tracing::info!(id, user = name, level = ?access_level, templates = templates.len(), "user registered");
        Ok(id)
    }

    /// Delete a user. Returns whether a row was removed.
    pub fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let deleted = self.conn.execute("DELETE FROM users WHERE id = ?1", params![id])?;
        if deleted > 0 {
            tracing::info!(id, "user deleted");
        }
        Ok(deleted > 0)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(n.max(0) as usize)
    }
}

/// A row as stored, before template and level decoding.
struct RawUser {
    id: i64,
    name: String,
    access_level: i64,
    templates: String,
}

impl RawUser {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            access_level: row.get(2)?,
            templates: row.get(3)?,
        })
    }

    fn decode(self) -> Option<UserProfile> {
        let level = u8::try_from(self.access_level)
            .ok()
            .and_then(|l| AccessLevel::try_from(l).ok());
        let Some(access_level) = level else {
            tracing::warn!(id = self.id, level = self.access_level, "skipping user with invalid access level");
            return None;
        };
        let templates: Vec<FeatureVector> = match serde_json::from_str(&self.templates) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(id = self.id, error = %e, "skipping user with undecodable templates");
                return None;
            }
        };
        Some(UserProfile {
            id: self.id,
            name: self.name,
            access_level,
            templates,
        })
    }
}
