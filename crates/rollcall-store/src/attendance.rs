//! Attendance log: SQLite rows plus the CSV flat file, kept consistent.
//!
//! CSV layout is `Name,Time,Date,Status` with dates as `%d-%m-%Y` and times
//! as `%H:%M:%S` — the column set and order reporting consumers depend on.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveTime, Utc};
use rollcall_core::session::{AttendanceSink, StorageError};
use rollcall_core::types::{DATE_FORMAT, TIME_FORMAT};
use rollcall_core::{AttendanceRecord, Status};
use rusqlite::params;
use serde::Serialize;

use crate::{Store, StoreError};

const CSV_HEADER: [&str; 4] = ["Name", "Time", "Date", "Status"];

/// Dashboard counters.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub students_registered: usize,
    pub face_samples: usize,
    pub today_attendance: usize,
    pub today_late: usize,
    pub total_records: usize,
    pub unique_attendees: usize,
}

impl Store {
    /// Append one record to both stores. A duplicate (person, date) is a
    /// silent no-op in both — the UNIQUE constraint decides, and the CSV line
    /// is only written when the database actually inserted.
    pub fn append(&mut self, record: &AttendanceRecord) -> Result<(), StoreError> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO attendance (person, date, time, status)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.person_name,
                record.date_string(),
                record.time_string(),
                record.status.as_str()
            ],
        )?;

        if inserted == 0 {
            tracing::debug!(name = %record.person_name, date = %record.date_string(),
                "duplicate attendance row ignored");
            return Ok(());
        }

        append_csv_line(&self.csv_path, record)?;
        Ok(())
    }

    /// Names with a durable record on `date`.
    pub fn logged_on(&self, date: NaiveDate) -> Result<HashSet<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT person FROM attendance WHERE date = ?1")?;
        let rows = stmt.query_map(params![date.format(DATE_FORMAT).to_string()], |r| {
            r.get::<_, String>(0)
        })?;
        Ok(rows.collect::<Result<HashSet<_>, _>>()?)
    }

    /// Records in acceptance order (which is time-ascending, single writer),
    /// optionally restricted to one date.
    pub fn query(&self, date: Option<NaiveDate>) -> Result<Vec<AttendanceRecord>, StoreError> {
        let (sql, date_param) = match date {
            Some(d) => (
                "SELECT person, date, time, status FROM attendance
                 WHERE date = ?1 ORDER BY id ASC",
                Some(d.format(DATE_FORMAT).to_string()),
            ),
            None => (
                "SELECT person, date, time, status FROM attendance ORDER BY id ASC",
                None,
            ),
        };

        let mut stmt = self.conn.prepare(sql)?;
        let map_row = |r: &rusqlite::Row<'_>| {
            let person: String = r.get(0)?;
            let date: String = r.get(1)?;
            let time: String = r.get(2)?;
            let status: String = r.get(3)?;
            Ok((person, date, time, status))
        };
        let rows: Vec<_> = match &date_param {
            Some(d) => stmt
                .query_map(params![d], map_row)?
                .collect::<Result<_, _>>()?,
            None => stmt.query_map([], map_row)?.collect::<Result<_, _>>()?,
        };

        let mut records = Vec::with_capacity(rows.len());
        for (person, date, time, status) in rows {
            records.push(AttendanceRecord {
                person_name: person,
                date: NaiveDate::parse_from_str(&date, DATE_FORMAT).unwrap_or_default(),
                time: NaiveTime::parse_from_str(&time, TIME_FORMAT).unwrap_or_default(),
                status: Status::parse(&status).unwrap_or(Status::OnTime),
            });
        }
        Ok(records)
    }

    /// Dashboard counters for the given "today".
    pub fn stats(&self, today: NaiveDate) -> Result<Stats, StoreError> {
        let today = today.format(DATE_FORMAT).to_string();
        let today_attendance: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM attendance WHERE date = ?1",
            params![today],
            |r| r.get(0),
        )?;
        let today_late: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM attendance WHERE date = ?1 AND status = ?2",
            params![today, Status::Late.as_str()],
            |r| r.get(0),
        )?;
        let total_records: usize =
            self.conn
                .query_row("SELECT COUNT(*) FROM attendance", [], |r| r.get(0))?;
        let unique_attendees: usize = self.conn.query_row(
            "SELECT COUNT(DISTINCT person) FROM attendance",
            [],
            |r| r.get(0),
        )?;

        Ok(Stats {
            students_registered: self.person_count()?,
            face_samples: self.sample_count()?,
            today_attendance,
            today_late,
            total_records,
            unique_attendees,
        })
    }

    /// Write a timestamped snapshot of all records into `dir` and return its path.
    pub fn export_snapshot(&self, dir: &Path) -> Result<PathBuf, StoreError> {
        std::fs::create_dir_all(dir)?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("attendance_report_{stamp}.csv"));

        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(CSV_HEADER)?;
        for record in self.query(None)? {
            writer.write_record([
                record.person_name.as_str(),
                &record.time_string(),
                &record.date_string(),
                record.status.as_str(),
            ])?;
        }
        writer.flush()?;

        tracing::info!(path = %path.display(), "attendance report exported");
        Ok(path)
    }
}

// The session's sink view of the store. Errors collapse to strings so the
// core crate stays free of storage dependencies.
impl AttendanceSink for Store {
    fn append_record(&mut self, record: &AttendanceRecord) -> Result<(), StorageError> {
        self.append(record)
            .map_err(|e| StorageError::Write(e.to_string()))
    }

    fn names_logged_on(&mut self, date: NaiveDate) -> Result<HashSet<String>, StorageError> {
        self.logged_on(date)
            .map_err(|e| StorageError::Read(e.to_string()))
    }
}

/// Truncate the CSV to just its header row.
pub(crate) fn write_csv_header(path: &Path) -> Result<(), StoreError> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(CSV_HEADER)?;
    writer.flush()?;
    Ok(())
}

fn append_csv_line(path: &Path, record: &AttendanceRecord) -> Result<(), StoreError> {
    let new_file = !path.exists() || std::fs::metadata(path)?.len() == 0;
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if new_file {
        writer.write_record(CSV_HEADER)?;
    }
    writer.write_record([
        record.person_name.as_str(),
        &record.time_string(),
        &record.date_string(),
        record.status.as_str(),
    ])?;
    writer.flush()?;
    Ok(())
}

/// Data rows in the CSV (header excluded; zero for a missing file).
pub(crate) fn count_csv_rows(path: &Path) -> Result<usize, StoreError> {
    if !path.exists() {
        return Ok(0);
    }
    let mut reader = csv::Reader::from_path(path)?;
    let mut count = 0;
    for row in reader.records() {
        row?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> Store {
        Store::open(
            &dir.path().join("attendance.db"),
            &dir.path().join("attendance/log.csv"),
            3,
        )
        .unwrap()
    }

    fn record(name: &str, day: u32, h: u32, m: u32, status: Status) -> AttendanceRecord {
        AttendanceRecord {
            person_name: name.into(),
            date: NaiveDate::from_ymd_opt(2025, 3, day).unwrap(),
            time: NaiveTime::from_hms_opt(h, m, 0).unwrap(),
            status,
        }
    }

    #[test]
    fn append_dual_writes_and_stays_consistent() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        store.append(&record("Alice", 7, 8, 59, Status::OnTime)).unwrap();
        store.append(&record("Bob", 7, 9, 15, Status::Late)).unwrap();

        store.verify_consistency().unwrap();
        let csv = std::fs::read_to_string(dir.path().join("attendance/log.csv")).unwrap();
        assert!(csv.starts_with("Name,Time,Date,Status\n"));
        assert!(csv.contains("Alice,08:59:00,07-03-2025,On Time"));
        assert!(csv.contains("Bob,09:15:00,07-03-2025,Late"));
    }

    #[test]
    fn duplicate_person_date_is_ignored_in_both_stores() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        store.append(&record("Alice", 7, 8, 59, Status::OnTime)).unwrap();
        // Same person, same date, later time: the unique constraint wins.
        store.append(&record("Alice", 7, 10, 0, Status::Late)).unwrap();

        let records = store.query(None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].time_string(), "08:59:00");
        store.verify_consistency().unwrap();

        // A different date for the same person is a fresh record.
        store.append(&record("Alice", 8, 8, 30, Status::OnTime)).unwrap();
        assert_eq!(store.query(None).unwrap().len(), 2);
    }

    #[test]
    fn query_filters_by_date_and_preserves_order() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        store.append(&record("Alice", 7, 8, 30, Status::OnTime)).unwrap();
        store.append(&record("Bob", 7, 8, 45, Status::OnTime)).unwrap();
        store.append(&record("Alice", 8, 9, 30, Status::Late)).unwrap();

        let day7 = store
            .query(Some(NaiveDate::from_ymd_opt(2025, 3, 7).unwrap()))
            .unwrap();
        assert_eq!(day7.len(), 2);
        assert_eq!(day7[0].person_name, "Alice");
        assert_eq!(day7[1].person_name, "Bob");

        let all = store.query(None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].status, Status::Late);
    }

    #[test]
    fn logged_on_reports_only_that_date() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        store.append(&record("Alice", 7, 8, 30, Status::OnTime)).unwrap();
        store.append(&record("Bob", 8, 8, 30, Status::OnTime)).unwrap();

        let names = store
            .logged_on(NaiveDate::from_ymd_opt(2025, 3, 7).unwrap())
            .unwrap();
        assert!(names.contains("Alice"));
        assert!(!names.contains("Bob"));
    }

    #[test]
    fn clear_all_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        store.append(&record("Alice", 7, 8, 30, Status::OnTime)).unwrap();
        store.clear_all().unwrap();
        assert!(store.query(None).unwrap().is_empty());
        assert_eq!(count_csv_rows(&store.csv_path).unwrap(), 0);

        // Second clear leaves the identical empty state.
        store.clear_all().unwrap();
        assert!(store.query(None).unwrap().is_empty());
        store.verify_consistency().unwrap();
    }

    #[test]
    fn stats_count_today_and_late() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        store.append(&record("Alice", 7, 8, 30, Status::OnTime)).unwrap();
        store.append(&record("Bob", 7, 9, 30, Status::Late)).unwrap();
        store.append(&record("Alice", 6, 8, 30, Status::OnTime)).unwrap();

        let stats = store.stats(NaiveDate::from_ymd_opt(2025, 3, 7).unwrap()).unwrap();
        assert_eq!(stats.today_attendance, 2);
        assert_eq!(stats.today_late, 1);
        assert_eq!(stats.total_records, 3);
        assert_eq!(stats.unique_attendees, 2);
        assert_eq!(stats.students_registered, 0);
    }

    #[test]
    fn export_snapshot_contains_all_rows() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        store.append(&record("Alice", 7, 8, 30, Status::OnTime)).unwrap();
        store.append(&record("Bob", 7, 9, 30, Status::Late)).unwrap();

        let path = store.export_snapshot(&dir.path().join("exports")).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.starts_with("Name,Time,Date,Status"));
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn consistency_mismatch_is_reported() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        store.append(&record("Alice", 7, 8, 30, Status::OnTime)).unwrap();
        // Sneak an extra line into the CSV behind the store's back.
        append_csv_line(&store.csv_path, &record("Ghost", 7, 9, 0, Status::Late)).unwrap();

        assert!(matches!(
            store.verify_consistency(),
            Err(StoreError::Inconsistent { db_rows: 1, csv_rows: 2 })
        ));
    }
}
