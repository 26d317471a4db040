//! Attendance session state machine.
//!
//! Consumes per-frame [`AttendanceEvent`]s and decides, per event, whether to
//! reject it (low confidence), skip it (already logged today, or cooldown
//! still active), or accept it and persist a durable [`AttendanceRecord`].
//!
//! Ordering matters: the cooldown check depends on the last accepted
//! timestamp per person, so events for one session must be fed sequentially.

use std::collections::{HashMap, HashSet};

use chrono::{Duration, NaiveDate, NaiveTime};
use thiserror::Error;

use crate::types::{AttendanceEvent, AttendanceRecord, Status};

/// Durable storage failure reported by an [`AttendanceSink`].
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage write failed: {0}")]
    Write(String),
    #[error("storage read failed: {0}")]
    Read(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    /// An accepted event could not be made durable within the retry budget.
    /// In-memory dedup state is untouched, so a later frame retries cleanly.
    #[error("record for {name} not durable after {attempts} attempts: {source}")]
    Storage {
        name: String,
        attempts: u32,
        source: StorageError,
    },
}

/// Destination for accepted attendance records.
///
/// The production implementation is `rollcall-store`; tests substitute an
/// in-memory sink.
pub trait AttendanceSink {
    /// Append one record. Must be a no-op (not an error) if a record for the
    /// same (person, date) already exists — the daily-uniqueness invariant is
    /// enforced at write time.
    fn append_record(&mut self, record: &AttendanceRecord) -> Result<(), StorageError>;

    /// Names that already have a durable record on `date`. Queried once at
    /// session start, never per frame.
    fn names_logged_on(&mut self, date: NaiveDate) -> Result<HashSet<String>, StorageError>;
}

/// Temporal policy for one session. Fixed for the session's lifetime.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Arrivals at or before this time-of-day are on time (inclusive).
    pub cutoff: NaiveTime,
    /// Minimum gap between two accepted events for the same person.
    pub cooldown: Duration,
    /// Maximum recognizer distance for an event to count as a recognition.
    pub max_distance: f32,
    /// Bounded write attempts per accepted event.
    pub write_attempts: u32,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            cutoff: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
            cooldown: Duration::seconds(60),
            max_distance: 1.0,
            write_attempts: 3,
        }
    }
}

/// Why an event was skipped without creating a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyLoggedToday,
    CooldownActive,
}

/// Outcome of feeding one event through the session policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Recognition distance above threshold — not a person we know.
    Reject,
    /// Known person, but policy suppressed the event.
    Skip(SkipReason),
    /// Record written durably with the given status.
    Accept(Status),
}

/// State for one bounded attendance run, from start signal to stop signal.
pub struct AttendanceSession {
    policy: SessionPolicy,
    /// Last accepted timestamp per person, discarded when the session ends.
    last_seen: HashMap<String, chrono::NaiveDateTime>,
    /// Names already durable for the session's calendar date. Loaded from the
    /// sink at start so the daily invariant holds across sessions.
    today_logged: HashSet<String>,
}

impl AttendanceSession {
    /// Begin a session for `date`, loading the already-logged set from the sink.
    pub fn begin<S: AttendanceSink>(
        policy: SessionPolicy,
        date: NaiveDate,
        sink: &mut S,
    ) -> Result<Self, StorageError> {
        let today_logged = sink.names_logged_on(date)?;
        tracing::info!(
            cutoff = %policy.cutoff,
            cooldown_secs = policy.cooldown.num_seconds(),
            already_logged = today_logged.len(),
            "attendance session started"
        );
        Ok(Self {
            policy,
            last_seen: HashMap::new(),
            today_logged,
        })
    }

    /// Apply the acceptance policy to one recognition event.
    ///
    /// `last_seen` and `today_logged` are only updated after the sink
    /// confirms the write, so a transient storage failure never loses an
    /// attendance event permanently.
    pub fn on_recognition<S: AttendanceSink>(
        &mut self,
        event: &AttendanceEvent,
        sink: &mut S,
    ) -> Result<Decision, SessionError> {
        if event.distance > self.policy.max_distance {
            return Ok(Decision::Reject);
        }

        // Cooldown is checked first: an accept also marks the name as logged
        // today, so the burst of frames right after an accept must report the
        // cooldown as the skip reason, not the daily dedup.
        if let Some(last) = self.last_seen.get(&event.person_name) {
            if event.observed_at - *last < self.policy.cooldown {
                return Ok(Decision::Skip(SkipReason::CooldownActive));
            }
        }

        if self.today_logged.contains(&event.person_name) {
            return Ok(Decision::Skip(SkipReason::AlreadyLoggedToday));
        }

        let status = if event.observed_at.time() <= self.policy.cutoff {
            Status::OnTime
        } else {
            Status::Late
        };

        let record = AttendanceRecord {
            person_name: event.person_name.clone(),
            date: event.observed_at.date(),
            time: event.observed_at.time(),
            status,
        };

        self.write_with_retry(&record, sink)?;

        self.last_seen
            .insert(event.person_name.clone(), event.observed_at);
        self.today_logged.insert(event.person_name.clone());

        tracing::info!(
            name = %record.person_name,
            time = %record.time_string(),
            status = %record.status,
            "attendance marked"
        );
        Ok(Decision::Accept(status))
    }

    fn write_with_retry<S: AttendanceSink>(
        &self,
        record: &AttendanceRecord,
        sink: &mut S,
    ) -> Result<(), SessionError> {
        let attempts = self.policy.write_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match sink.append_record(record) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        name = %record.person_name,
                        attempt,
                        attempts,
                        error = %e,
                        "attendance write failed"
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(SessionError::Storage {
            name: record.person_name.clone(),
            attempts,
            source: last_err.unwrap_or(StorageError::Write("no attempts made".into())),
        })
    }

    /// Number of records accepted by this session so far.
    pub fn accepted_count(&self) -> usize {
        self.last_seen.len()
    }
}
