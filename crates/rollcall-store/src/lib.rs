//! rollcall-store — Durable storage for persons, face templates, and
//! attendance records.
//!
//! Attendance rows are dual-written: a SQLite row (the queryable store) and a
//! CSV line (the flat export reporting consumers read). The two must stay
//! consistent; [`Store::verify_consistency`] reports a mismatch as an error.
//!
//! The daily-uniqueness invariant — at most one record per (person, date) —
//! is enforced at write time by a `UNIQUE(person, date)` constraint, so an
//! at-least-once writer can never produce duplicates.

mod attendance;
mod identity;

pub use attendance::Stats;
pub use identity::{RegistrationToken, StudentSummary};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rollcall_core::FaceTemplate;
use rusqlite::Connection;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("student name must not be empty")]
    EmptyName,
    #[error("student '{0}' is already registered")]
    DuplicateName(String),
    #[error("not enough face samples: got {got}, need at least {needed}")]
    InsufficientSamples { got: usize, needed: usize },
    #[error("unknown registration token")]
    UnknownToken,
    #[error("database and csv disagree: {db_rows} rows vs {csv_rows} lines")]
    Inconsistent { db_rows: usize, csv_rows: usize },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) struct PendingRegistration {
    pub name: String,
    pub templates: Vec<FaceTemplate>,
}

/// Single-connection store over one SQLite file plus the attendance CSV.
pub struct Store {
    pub(crate) conn: Connection,
    pub(crate) csv_path: PathBuf,
    pub(crate) min_samples: usize,
    pub(crate) pending: HashMap<uuid::Uuid, PendingRegistration>,
}

impl Store {
    /// Open (creating if needed) the database and CSV at the given paths.
    pub fn open(db_path: &Path, csv_path: &Path, min_samples: usize) -> Result<Self, StoreError> {
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(dir) = csv_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS persons (
                 name          TEXT PRIMARY KEY,
                 registered_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS templates (
                 id            TEXT PRIMARY KEY,
                 person        TEXT NOT NULL REFERENCES persons(name) ON DELETE CASCADE,
                 embedding     BLOB NOT NULL,
                 model_version TEXT,
                 created_at    TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS attendance (
                 id     INTEGER PRIMARY KEY AUTOINCREMENT,
                 person TEXT NOT NULL,
                 date   TEXT NOT NULL,
                 time   TEXT NOT NULL,
                 status TEXT NOT NULL,
                 UNIQUE(person, date)
             );",
        )?;

        tracing::info!(db = %db_path.display(), csv = %csv_path.display(), "store opened");

        Ok(Self {
            conn,
            csv_path: csv_path.to_path_buf(),
            min_samples,
            pending: HashMap::new(),
        })
    }

    /// Remove all attendance records, persons, and templates, and truncate
    /// the CSV back to its header. Running it twice leaves the same empty
    /// state as once.
    pub fn clear_all(&mut self) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM attendance", [])?;
        tx.execute("DELETE FROM templates", [])?;
        tx.execute("DELETE FROM persons", [])?;
        tx.commit()?;

        self.pending.clear();
        attendance::write_csv_header(&self.csv_path)?;

        tracing::info!("store cleared");
        Ok(())
    }

    /// Check that every record visible in the database is visible in the CSV
    /// and vice versa (by row count — the CSV is append-only and written only
    /// by this store).
    pub fn verify_consistency(&self) -> Result<(), StoreError> {
        let db_rows: usize =
            self.conn
                .query_row("SELECT COUNT(*) FROM attendance", [], |r| r.get(0))?;
        let csv_rows = attendance::count_csv_rows(&self.csv_path)?;
        if db_rows != csv_rows {
            return Err(StoreError::Inconsistent { db_rows, csv_rows });
        }
        Ok(())
    }
}
