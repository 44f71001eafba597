//! Controller state snapshot persistence.

use super::Database;
use crate::clock::now_ms;
use anyhow::Result;
use rusqlite::params;
use serde::Serialize;
use serde::de::DeserializeOwned;

impl Database {
    /// Store a JSON snapshot under `key`, replacing any previous one.
    pub fn save_snapshot<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO controller_state (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, json, now_ms()],
            )?;
            Ok(())
        })
    }

    /// Load the snapshot stored under `key`, if any.
    pub fn load_snapshot<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw: Option<String> = self.with_conn(|conn| {
            match conn.query_row(
                "SELECT value FROM controller_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            ) {
                Ok(value) => Ok(Some(value)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}
