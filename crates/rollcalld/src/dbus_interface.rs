use std::sync::{Arc, Mutex};

use chrono::{Local, NaiveDate};
use rollcall_core::types::DATE_FORMAT;
use rollcall_store::Store;
use zbus::interface;

use crate::manager::{ManagerError, SessionManager};

/// D-Bus interface for the rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// Query methods return JSON strings so dashboard clients can consume them
/// without a typed binding.
pub struct AttendanceService {
    manager: Arc<SessionManager>,
    store: Arc<Mutex<Store>>,
}

impl AttendanceService {
    pub fn new(manager: Arc<SessionManager>, store: Arc<Mutex<Store>>) -> Self {
        Self { manager, store }
    }

    fn lock_store(&self) -> zbus::fdo::Result<std::sync::MutexGuard<'_, Store>> {
        self.store
            .lock()
            .map_err(|_| zbus::fdo::Error::Failed("store lock poisoned".into()))
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Start an attendance session. Fails if any session is already running,
    /// the camera or models are unavailable, or nobody is registered yet.
    async fn start_attendance(&self) -> zbus::fdo::Result<()> {
        tracing::info!("start_attendance requested");
        self.manager.start_attendance().map_err(failed)
    }

    /// Start a registration capture for a new student. Duplicate and empty
    /// names are rejected before any hardware is touched.
    async fn register(&self, name: &str) -> zbus::fdo::Result<()> {
        tracing::info!(name, "registration requested");
        self.manager.start_registration(name).map_err(failed)
    }

    /// Stop the active session, if any. Returns whether one was running.
    async fn stop_session(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop_session requested");
        Ok(self.manager.stop())
    }

    /// Daemon status: version, the active session kind, and for a running
    /// registration the number of samples captured so far.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let session = match self.manager.running() {
            Some(kind) => kind.to_string(),
            None => "idle".to_string(),
        };
        let mut status = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "session": session,
        });
        if let Some(samples) = self.manager.registration_progress() {
            status["samples"] = samples.into();
        }
        Ok(status.to_string())
    }

    /// Dashboard counters as JSON.
    async fn stats(&self) -> zbus::fdo::Result<String> {
        let stats = self
            .lock_store()?
            .stats(Local::now().date_naive())
            .map_err(failed)?;
        serde_json::to_string(&stats).map_err(failed)
    }

    /// Attendance records as a JSON array, time-ascending. An empty `date`
    /// returns everything; otherwise `date` must be `DD-MM-YYYY`.
    async fn attendance(&self, date: &str) -> zbus::fdo::Result<String> {
        let filter = if date.is_empty() {
            None
        } else {
            Some(
                NaiveDate::parse_from_str(date, DATE_FORMAT)
                    .map_err(|_| failed(format!("invalid date {date:?}, expected DD-MM-YYYY")))?,
            )
        };
        let records = self.lock_store()?.query(filter).map_err(failed)?;
        let rows: Vec<_> = records
            .iter()
            .map(|r| {
                serde_json::json!({
                    "name": r.person_name,
                    "time": r.time_string(),
                    "date": r.date_string(),
                    "status": r.status.as_str(),
                })
            })
            .collect();
        serde_json::to_string(&rows).map_err(failed)
    }

    /// Registered students with sample counts and last-seen dates, as JSON.
    async fn list_students(&self) -> zbus::fdo::Result<String> {
        let summaries = self.lock_store()?.student_summaries().map_err(failed)?;
        serde_json::to_string(&summaries).map_err(failed)
    }

    /// Write a timestamped CSV snapshot of all records; returns its path.
    async fn export(&self) -> zbus::fdo::Result<String> {
        let dir = self.manager.export_dir();
        let path = self.lock_store()?.export_snapshot(&dir).map_err(failed)?;
        Ok(path.to_string_lossy().into_owned())
    }

    /// Delete all attendance data, registered students, and face samples.
    /// Refused while a session is running.
    async fn clear(&self) -> zbus::fdo::Result<()> {
        if let Some(kind) = self.manager.running() {
            return Err(failed(ManagerError::AlreadyRunning(kind)));
        }
        tracing::warn!("clearing all attendance data");
        self.lock_store()?.clear_all().map_err(failed)
    }

    /// Check that the database and the CSV agree on the record count.
    async fn verify(&self) -> zbus::fdo::Result<String> {
        match self.lock_store()?.verify_consistency() {
            Ok(()) => Ok("consistent".into()),
            Err(e) => Err(failed(e)),
        }
    }
}
