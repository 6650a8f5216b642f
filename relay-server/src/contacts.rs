//! SQLite-backed contact cache used to enrich inbound webhooks.
//!
//! Operators register phone numbers with a display name and arbitrary JSON
//! data; every inbound webhook whose sender is registered is tagged with that
//! record before it is relayed. Records survive restarts in the database at
//! `CONTACTS_DB_PATH`.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::relay::{webhook_sender, Payload};

#[derive(Debug, thiserror::Error)]
pub enum ContactError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contact {
    pub phone: String,
    pub name: Option<String>,
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Raw column values, decoded outside the rusqlite row callback.
struct ContactRow {
    phone: String,
    name: Option<String>,
    data: String,
    created_at: String,
    updated_at: String,
}

impl ContactRow {
    const COLUMNS: &'static str = "phone, name, data, created_at, updated_at";

    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            phone: row.get(0)?,
            name: row.get(1)?,
            data: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn decode(self) -> Result<Contact, ContactError> {
        Ok(Contact {
            phone: self.phone,
            name: self.name,
            data: serde_json::from_str(&self.data)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

// Fixed-width UTC text so `ORDER BY updated_at` sorts chronologically.
fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(text)?.with_timezone(&Utc))
}

pub struct ContactCache {
    conn: Mutex<Connection>,
}

impl ContactCache {
    /// Open (or create) the contact database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ContactError> {
        let conn = Connection::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "contacts_opened");
        Self::init(conn)
    }

    /// A cache that lives only as long as this value.
    pub fn in_memory() -> Result<Self, ContactError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ContactError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS contacts (
                phone TEXT PRIMARY KEY,
                name TEXT,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS contacts_updated_at ON contacts (updated_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace the contact for `phone`.
    ///
    /// Replacing keeps the original `created_at`. A null `data` is stored as
    /// an empty object.
    pub fn upsert(&self, phone: &str, name: Option<String>, data: Value) -> Result<Contact, ContactError> {
        let now = format_timestamp(Utc::now());
        let data = if data.is_null() { json!({}) } else { data };
        let data = serde_json::to_string(&data)?;

        let conn = self.lock();
        conn.execute(
            "INSERT INTO contacts (phone, name, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(phone) DO UPDATE SET
                name = excluded.name,
                data = excluded.data,
                updated_at = excluded.updated_at",
            params![phone, name, data, now],
        )?;
        let contact = Self::fetch(&conn, phone)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM contacts", [], |row| row.get(0))?;

        info!(phone = %phone, total = total, "contact_saved");
        Ok(contact)
    }

    pub fn get(&self, phone: &str) -> Result<Option<Contact>, ContactError> {
        Self::fetch(&self.lock(), phone)
    }

    /// All contacts, most recently updated first.
    pub fn list(&self) -> Result<Vec<Contact>, ContactError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM contacts ORDER BY updated_at DESC, phone ASC",
            ContactRow::COLUMNS
        ))?;
        let rows = stmt
            .query_map([], ContactRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(ContactRow::decode).collect()
    }

    /// Returns true if a contact was removed.
    pub fn delete(&self, phone: &str) -> Result<bool, ContactError> {
        let removed = self
            .lock()
            .execute("DELETE FROM contacts WHERE phone = ?1", params![phone])?
            > 0;
        if removed {
            info!(phone = %phone, "contact_deleted");
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<usize, ContactError> {
        let deleted = self.lock().execute("DELETE FROM contacts", [])?;
        info!(deleted = deleted, "contacts_cleared");
        Ok(deleted)
    }

    pub fn len(&self) -> Result<usize, ContactError> {
        let count: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM contacts", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    pub fn is_empty(&self) -> Result<bool, ContactError> {
        Ok(self.len()? == 0)
    }

    /// Tag a webhook payload with what is known about its sender.
    ///
    /// Sets `save_number` to whether the sender is registered and, if so,
    /// attaches the record under `cached_info`. A storage failure is logged
    /// and treated as an unknown sender so the webhook is still relayed.
    pub fn enrich(&self, payload: &mut Payload) {
        let sender = webhook_sender(payload).map(str::to_string);

        let Some(phone) = sender else {
            debug!("contact_enrich_no_sender");
            payload.insert("save_number".to_string(), Value::Bool(false));
            return;
        };

        match self.get(&phone) {
            Ok(Some(contact)) => {
                debug!(phone = %phone, name = ?contact.name, "contact_enrich_hit");
                payload.insert(
                    "cached_info".to_string(),
                    json!({
                        "name": contact.name,
                        "phone": contact.phone,
                        "data": contact.data,
                        "created_at": contact.created_at,
                        "updated_at": contact.updated_at,
                    }),
                );
                payload.insert("save_number".to_string(), Value::Bool(true));
            }
            Ok(None) => {
                debug!(phone = %phone, "contact_enrich_miss");
                payload.insert("save_number".to_string(), Value::Bool(false));
            }
            Err(e) => {
                error!(phone = %phone, error = %e, "contact_enrich_failed");
                payload.insert("save_number".to_string(), Value::Bool(false));
            }
        }
    }

    fn fetch(conn: &Connection, phone: &str) -> Result<Option<Contact>, ContactError> {
        conn.query_row(
            &format!("SELECT {} FROM contacts WHERE phone = ?1", ContactRow::COLUMNS),
            params![phone],
            ContactRow::read,
        )
        .optional()?
        .map(ContactRow::decode)
        .transpose()
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
