//! Person registry and registration capture sessions.
//!
//! Registration is a two-phase flow: `register` opens a pending capture
//! session and returns a token, `add_template` appends extracted templates,
//! and `finalize` persists the person atomically once enough samples exist.
//! Nothing touches the database until finalize, so an abandoned capture
//! leaves no partial state.

use chrono::{NaiveDateTime, Utc};
use rollcall_core::{FaceTemplate, Person};
use rusqlite::params;
use serde::Serialize;
use uuid::Uuid;

use crate::{PendingRegistration, Store, StoreError};

/// Opaque handle for an in-progress registration.
pub type RegistrationToken = Uuid;

const REGISTERED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Per-student roster line for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StudentSummary {
    pub name: String,
    pub samples: usize,
    /// Date of the most recent attendance record, if any.
    pub last_seen: Option<String>,
}

impl Store {
    /// Begin registering a new student. Fails if the name is empty or clashes
    /// with a persisted person or another pending registration.
    pub fn register(&mut self, name: &str) -> Result<RegistrationToken, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::EmptyName);
        }

        let persisted: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM persons WHERE name = ?1",
            params![name],
            |r| r.get(0),
        )?;
        let pending_clash = self.pending.values().any(|p| p.name == name);
        if persisted > 0 || pending_clash {
            return Err(StoreError::DuplicateName(name.to_string()));
        }

        let token = Uuid::new_v4();
        self.pending.insert(
            token,
            PendingRegistration {
                name: name.to_string(),
                templates: Vec::new(),
            },
        );
        tracing::info!(name = %name, "registration started");
        Ok(token)
    }

    /// Append one captured template to a pending registration.
    /// Returns the sample count so far.
    pub fn add_template(
        &mut self,
        token: RegistrationToken,
        template: FaceTemplate,
    ) -> Result<usize, StoreError> {
        let pending = self.pending.get_mut(&token).ok_or(StoreError::UnknownToken)?;
        pending.templates.push(template);
        Ok(pending.templates.len())
    }

    /// Persist a pending registration in one transaction.
    ///
    /// Below the minimum sample count the pending session is kept so capture
    /// can continue. Returns the number of templates stored.
    pub fn finalize(&mut self, token: RegistrationToken) -> Result<usize, StoreError> {
        let got = self
            .pending
            .get(&token)
            .ok_or(StoreError::UnknownToken)?
            .templates
            .len();
        if got < self.min_samples {
            return Err(StoreError::InsufficientSamples {
                got,
                needed: self.min_samples,
            });
        }

        let pending = self.pending.remove(&token).ok_or(StoreError::UnknownToken)?;
        let result = persist_pending(&mut self.conn, &pending);
        match result {
            Ok(()) => {
                tracing::info!(name = %pending.name, samples = got, "registration finalized");
                Ok(got)
            }
            Err(e) => {
                // Transaction rolled back; keep the captured templates so
                // finalize can be retried on the same token.
                self.pending.insert(token, pending);
                Err(e)
            }
        }
    }

    /// Number of templates captured so far for a pending registration.
    pub fn pending_sample_count(&self, token: RegistrationToken) -> Result<usize, StoreError> {
        Ok(self
            .pending
            .get(&token)
            .ok_or(StoreError::UnknownToken)?
            .templates
            .len())
    }

    /// Discard a pending registration. Returns whether the token was live.
    pub fn abort_registration(&mut self, token: RegistrationToken) -> bool {
        self.pending.remove(&token).is_some()
    }

    /// All registered persons with their templates, for recognizer training.
    pub fn all_persons(&self) -> Result<Vec<Person>, StoreError> {
        let mut person_stmt = self
            .conn
            .prepare("SELECT name, registered_at FROM persons ORDER BY name")?;
        let mut template_stmt = self.conn.prepare(
            "SELECT embedding, model_version FROM templates WHERE person = ?1",
        )?;

        let rows = person_stmt.query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;

        let mut persons = Vec::new();
        for row in rows {
            let (name, registered_at) = row?;
            let registered_at =
                NaiveDateTime::parse_from_str(&registered_at, REGISTERED_AT_FORMAT)
                    .unwrap_or_default();

            let templates = template_stmt
                .query_map(params![name], |r| {
                    let blob: Vec<u8> = r.get(0)?;
                    let version: Option<String> = r.get(1)?;
                    Ok(FaceTemplate::from_le_bytes(&blob, version))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            persons.push(Person {
                name,
                templates,
                registered_at,
            });
        }
        Ok(persons)
    }

    pub fn person_count(&self) -> Result<usize, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM persons", [], |r| r.get(0))?)
    }

    pub fn sample_count(&self) -> Result<usize, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM templates", [], |r| r.get(0))?)
    }

    /// Roster with per-student sample counts and last attendance date.
    pub fn student_summaries(&self) -> Result<Vec<StudentSummary>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT p.name,
                    (SELECT COUNT(*) FROM templates t WHERE t.person = p.name),
                    (SELECT a.date FROM attendance a WHERE a.person = p.name
                     ORDER BY a.id DESC LIMIT 1)
             FROM persons p ORDER BY p.name",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(StudentSummary {
                name: r.get(0)?,
                samples: r.get::<_, i64>(1)? as usize,
                last_seen: r.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn persist_pending(
    conn: &mut rusqlite::Connection,
    pending: &PendingRegistration,
) -> Result<(), StoreError> {
    let now = Utc::now().naive_utc().format(REGISTERED_AT_FORMAT).to_string();

    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO persons (name, registered_at) VALUES (?1, ?2)",
        params![pending.name, now],
    )?;
    for template in &pending.templates {
        tx.execute(
            "INSERT INTO templates (id, person, embedding, model_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                pending.name,
                template.to_le_bytes(),
                template.model_version,
                now
            ],
        )?;
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> Store {
        Store::open(
            &dir.path().join("data/attendance.db"),
            &dir.path().join("attendance/log.csv"),
            3,
        )
        .unwrap()
    }

    fn template(seed: f32) -> FaceTemplate {
        FaceTemplate {
            values: vec![seed, 1.0 - seed],
            model_version: Some("w600k_r50".into()),
        }
    }

    #[test]
    fn register_finalize_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        let token = store.register("Alice").unwrap();
        for i in 0..3 {
            store.add_template(token, template(i as f32 * 0.1)).unwrap();
        }
        assert_eq!(store.finalize(token).unwrap(), 3);

        let persons = store.all_persons().unwrap();
        assert_eq!(persons.len(), 1);
        assert_eq!(persons[0].name, "Alice");
        assert_eq!(persons[0].templates.len(), 3);
        assert_eq!(persons[0].templates[0].values.len(), 2);
        assert_eq!(store.sample_count().unwrap(), 3);
    }

    #[test]
    fn duplicate_name_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        let token = store.register("Alice").unwrap();
        for _ in 0..3 {
            store.add_template(token, template(0.5)).unwrap();
        }
        store.finalize(token).unwrap();

        assert!(matches!(
            store.register("Alice"),
            Err(StoreError::DuplicateName(_))
        ));
        // Whitespace-padded variant hits the same key.
        assert!(matches!(
            store.register("  Alice  "),
            Err(StoreError::DuplicateName(_))
        ));
    }

    #[test]
    fn pending_names_also_collide() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let _token = store.register("Bob").unwrap();
        assert!(matches!(
            store.register("Bob"),
            Err(StoreError::DuplicateName(_))
        ));
    }

    #[test]
    fn empty_name_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        assert!(matches!(store.register("   "), Err(StoreError::EmptyName)));
    }

    #[test]
    fn finalize_below_minimum_keeps_pending_session() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        let token = store.register("Carol").unwrap();
        store.add_template(token, template(0.1)).unwrap();

        let err = store.finalize(token).unwrap_err();
        assert!(matches!(
            err,
            StoreError::InsufficientSamples { got: 1, needed: 3 }
        ));

        // Capture continues on the same token.
        store.add_template(token, template(0.2)).unwrap();
        store.add_template(token, template(0.3)).unwrap();
        assert_eq!(store.finalize(token).unwrap(), 3);
    }

    #[test]
    fn pending_sample_count_tracks_capture() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        let token = store.register("Erin").unwrap();
        assert_eq!(store.pending_sample_count(token).unwrap(), 0);

        store.add_template(token, template(0.1)).unwrap();
        store.add_template(token, template(0.2)).unwrap();
        assert_eq!(store.pending_sample_count(token).unwrap(), 2);

        assert!(matches!(
            store.pending_sample_count(Uuid::new_v4()),
            Err(StoreError::UnknownToken)
        ));
    }

    #[test]
    fn abort_discards_pending_state() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        let token = store.register("Dave").unwrap();
        store.add_template(token, template(0.1)).unwrap();
        assert!(store.abort_registration(token));
        assert!(!store.abort_registration(token));
        assert!(matches!(
            store.add_template(token, template(0.2)),
            Err(StoreError::UnknownToken)
        ));
        // Name is free again after an aborted capture.
        assert!(store.register("Dave").is_ok());
    }

    #[test]
    fn unknown_token_errors() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        assert!(matches!(
            store.finalize(Uuid::new_v4()),
            Err(StoreError::UnknownToken)
        ));
    }
}
