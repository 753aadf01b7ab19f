//! Represents an uploaded project archive and where its bytes live.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A single row of the `projects` table.
///
/// The row records the externally visible identifier and the location of the
/// archive payload. It never holds the archive bytes themselves, and it is
/// never updated after insertion.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// Surrogate key assigned by the database (never reused).
    pub id: i64,

    /// 12-character URL-safe token naming this project.
    pub identifier: String,

    /// When the row was inserted.
    pub created_at: DateTime<Utc>,

    /// Tag of the blob backend holding the payload (e.g. "local").
    pub storage_class: Option<String>,

    /// Key of the payload within that backend, always `{identifier}.zip`.
    pub storage_key: Option<String>,
}

/// Values supplied by the registry when inserting a new row.
#[derive(Clone, Debug)]
pub struct NewProject {
    pub identifier: String,
    pub storage_class: String,
    pub storage_key: String,
    pub created_at: DateTime<Utc>,
}

impl NewProject {
    pub fn new(identifier: impl Into<String>, storage_class: impl Into<String>) -> Self {
        let identifier = identifier.into();
        Self {
            storage_key: storage_key_for(&identifier),
            identifier,
            storage_class: storage_class.into(),
            created_at: Utc::now(),
        }
    }
}

/// Blob key for a project archive.
pub fn storage_key_for(identifier: &str) -> String {
    format!("{identifier}.zip")
}
