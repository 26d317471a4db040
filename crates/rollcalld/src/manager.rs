//! Session lifecycle: at most one attendance or registration session at a
//! time, each on a dedicated OS thread.
//!
//! Start is fail-fast: camera, models, gallery, and the already-logged set
//! are all acquired before the worker thread spawns, so a start request
//! either returns with everything held or fails with no partial state. The
//! worker owns the camera and drops it on every exit path.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDate};
use thiserror::Error;

use rollcall_core::detector::{DetectorError, FaceDetector, OnnxFaceDetector};
use rollcall_core::extractor::{OnnxExtractor, RecognizerError};
use rollcall_core::session::{AttendanceSink, SessionError, StorageError};
use rollcall_core::{AttendanceEvent, AttendanceSession, Decision, FaceCrop, Recognizer};
use rollcall_hw::{Camera, CameraError};
use rollcall_store::{RegistrationToken, Store, StoreError};

use crate::config::Config;

/// Padding (pixels) added around a detection box before cropping,
/// matching what the recognizer was fed during registration.
const CROP_PADDING: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Attendance,
    Registration,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKind::Attendance => f.write_str("attendance"),
            SessionKind::Registration => f.write_str("registration"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("a {0} session is already running")]
    AlreadyRunning(SessionKind),
    #[error("camera unavailable: {0}")]
    Camera(#[from] CameraError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("could not load today's attendance: {0}")]
    Storage(#[from] StorageError),
    #[error("no registered students; register someone first")]
    NoRegisteredStudents,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
}

struct Active {
    kind: SessionKind,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    /// Pending registration handle, for progress reporting.
    token: Option<RegistrationToken>,
}

/// Sink view over the shared store for the session state machine.
struct SharedSink(Arc<Mutex<Store>>);

impl AttendanceSink for SharedSink {
    fn append_record(
        &mut self,
        record: &rollcall_core::AttendanceRecord,
    ) -> Result<(), StorageError> {
        let mut store = self
            .0
            .lock()
            .map_err(|_| StorageError::Write("store lock poisoned".into()))?;
        store.append_record(record)
    }

    fn names_logged_on(&mut self, date: NaiveDate) -> Result<HashSet<String>, StorageError> {
        let mut store = self
            .0
            .lock()
            .map_err(|_| StorageError::Read("store lock poisoned".into()))?;
        store.names_logged_on(date)
    }
}

/// Holds at most one active session handle behind a mutex.
pub struct SessionManager {
    config: Config,
    store: Arc<Mutex<Store>>,
    active: Mutex<Option<Active>>,
}

impl SessionManager {
    pub fn new(config: Config, store: Arc<Mutex<Store>>) -> Self {
        Self {
            config,
            store,
            active: Mutex::new(None),
        }
    }

    /// Directory export snapshots are written into.
    pub fn export_dir(&self) -> PathBuf {
        self.config.attendance_dir.join("exports")
    }

    /// Kind of the currently running session, if any.
    pub fn running(&self) -> Option<SessionKind> {
        let mut active = match self.active.lock() {
            Ok(a) => a,
            Err(_) => return None,
        };
        match active.as_ref() {
            Some(a) if !a.handle.is_finished() => Some(a.kind),
            Some(_) => {
                // Worker exited on its own (stop key or idle timeout).
                if let Some(done) = active.take() {
                    let _ = done.handle.join();
                }
                None
            }
            None => None,
        }
    }

    /// Signal the active session to stop at the next frame boundary and wait
    /// for it to wind down. Returns whether a session was running.
    pub fn stop(&self) -> bool {
        let taken = match self.active.lock() {
            Ok(mut active) => active.take(),
            Err(_) => return false,
        };
        match taken {
            Some(active) => {
                active.stop.store(true, Ordering::SeqCst);
                let was_live = !active.handle.is_finished();
                let _ = active.handle.join();
                tracing::info!(kind = %active.kind, "session stopped");
                was_live
            }
            None => false,
        }
    }

    /// Start an attendance session. Rejected while any session is running.
    pub fn start_attendance(&self) -> Result<(), ManagerError> {
        let mut active = self.active.lock().map_err(|_| ManagerError::Poisoned)?;
        if let Some(a) = active.as_ref() {
            if !a.handle.is_finished() {
                return Err(ManagerError::AlreadyRunning(a.kind));
            }
        }
        if let Some(done) = active.take() {
            let _ = done.handle.join();
        }

        // Fail-fast acquisition: everything the worker needs, before spawn.
        let camera = Camera::open(&self.config.camera_device)?;
        let detector = OnnxFaceDetector::load(&self.config.detect_model_path())?;
        let extractor = OnnxExtractor::load(&self.config.embed_model_path())?;

        let persons = {
            let store = self.store.lock().map_err(|_| ManagerError::Poisoned)?;
            store.all_persons()?
        };
        if persons.is_empty() {
            return Err(ManagerError::NoRegisteredStudents);
        }

        let mut recognizer = Recognizer::new(extractor);
        recognizer.train(&persons);

        let mut sink = SharedSink(Arc::clone(&self.store));
        let session = AttendanceSession::begin(
            self.config.session_policy(),
            Local::now().date_naive(),
            &mut sink,
        )?;

        let stop = Arc::new(AtomicBool::new(false));
        let worker = AttendanceWorker {
            camera,
            detector,
            recognizer,
            session,
            sink,
            stop: Arc::clone(&stop),
            warmup_frames: self.config.warmup_frames,
            idle_timeout: Duration::from_secs(self.config.idle_timeout_secs),
        };

        let handle = std::thread::Builder::new()
            .name("rollcall-attendance".into())
            .spawn(move || worker.run())
            .map_err(ManagerError::Spawn)?;

        *active = Some(Active {
            kind: SessionKind::Attendance,
            stop,
            handle,
            token: None,
        });
        Ok(())
    }

    /// Start a registration capture for `name`. Rejected while any session is
    /// running; name validation happens synchronously so the caller sees
    /// duplicate-name errors immediately.
    pub fn start_registration(&self, name: &str) -> Result<(), ManagerError> {
        let mut active = self.active.lock().map_err(|_| ManagerError::Poisoned)?;
        if let Some(a) = active.as_ref() {
            if !a.handle.is_finished() {
                return Err(ManagerError::AlreadyRunning(a.kind));
            }
        }
        if let Some(done) = active.take() {
            let _ = done.handle.join();
        }

        let token = {
            let mut store = self.store.lock().map_err(|_| ManagerError::Poisoned)?;
            store.register(name)?
        };

        let camera = match Camera::open(&self.config.camera_device) {
            Ok(c) => c,
            Err(e) => {
                self.abort_token(token);
                return Err(e.into());
            }
        };
        let detector = match OnnxFaceDetector::load(&self.config.detect_model_path()) {
            Ok(d) => d,
            Err(e) => {
                self.abort_token(token);
                return Err(e.into());
            }
        };
        let extractor = match OnnxExtractor::load(&self.config.embed_model_path()) {
            Ok(x) => x,
            Err(e) => {
                self.abort_token(token);
                return Err(e.into());
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        let worker = RegistrationWorker {
            camera,
            detector,
            extractor,
            store: Arc::clone(&self.store),
            token,
            name: name.trim().to_string(),
            stop: Arc::clone(&stop),
            warmup_frames: self.config.warmup_frames,
            sample_interval: Duration::from_millis(self.config.sample_interval_ms),
            max_samples: self.config.max_samples,
            idle_timeout: Duration::from_secs(self.config.idle_timeout_secs),
        };

        let handle = std::thread::Builder::new()
            .name("rollcall-register".into())
            .spawn(move || worker.run())
            .map_err(|e| {
                self.abort_token(token);
                ManagerError::Spawn(e)
            })?;

        *active = Some(Active {
            kind: SessionKind::Registration,
            stop,
            handle,
            token: Some(token),
        });
        Ok(())
    }

    /// Samples captured so far by a running registration session, if any.
    pub fn registration_progress(&self) -> Option<usize> {
        let active = self.active.lock().ok()?;
        let a = active.as_ref()?;
        if a.handle.is_finished() {
            return None;
        }
        let token = a.token?;
        let store = self.store.lock().ok()?;
        store.pending_sample_count(token).ok()
    }

    fn abort_token(&self, token: RegistrationToken) {
        if let Ok(mut store) = self.store.lock() {
            store.abort_registration(token);
        }
    }
}

struct AttendanceWorker {
    camera: Camera,
    detector: OnnxFaceDetector,
    recognizer: Recognizer<OnnxExtractor>,
    session: AttendanceSession,
    sink: SharedSink,
    stop: Arc<AtomicBool>,
    warmup_frames: usize,
    idle_timeout: Duration,
}

impl AttendanceWorker {
    fn run(mut self) {
        tracing::info!("attendance worker started");
        let mut stream = match self.camera.stream() {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to start capture stream");
                return;
            }
        };
        stream.discard(self.warmup_frames);

        let mut last_activity = Instant::now();

        loop {
            if self.stop.load(Ordering::SeqCst) {
                tracing::info!("stop requested; ending attendance session");
                break;
            }
            if last_activity.elapsed() > self.idle_timeout {
                tracing::info!("idle timeout; ending attendance session");
                break;
            }

            let mut frame = match stream.next_frame() {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(error = %e, "frame capture failed");
                    std::thread::sleep(Duration::from_millis(100));
                    continue;
                }
            };

            if frame.is_dark() {
                continue;
            }
            rollcall_hw::frame::equalize_hist(&mut frame.data);

            let faces = match self.detector.detect(&frame.data, frame.width, frame.height) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(error = %e, "face detection failed");
                    continue;
                }
            };
            if !faces.is_empty() {
                last_activity = Instant::now();
            }

            let observed_at = Local::now().naive_local();
            for bbox in &faces {
                let Some(crop) =
                    FaceCrop::from_gray(&frame.data, frame.width, frame.height, bbox, CROP_PADDING)
                else {
                    continue;
                };

                let identification = match self.recognizer.identify(&crop) {
                    Ok(id) => id,
                    Err(e) => {
                        tracing::warn!(error = %e, "feature extraction failed");
                        continue;
                    }
                };
                let Some(label) = identification.label else {
                    continue;
                };

                let event = AttendanceEvent {
                    person_name: label,
                    observed_at,
                    distance: identification.distance,
                };

                match self.session.on_recognition(&event, &mut self.sink) {
                    Ok(Decision::Accept(_)) => {} // session already logged it
                    Ok(Decision::Skip(reason)) => {
                        tracing::debug!(name = %event.person_name, ?reason, "event skipped");
                    }
                    Ok(Decision::Reject) => {
                        tracing::trace!(distance = event.distance, "unrecognized face");
                    }
                    Err(SessionError::Storage { name, attempts, source }) => {
                        // Dedup state untouched; a later frame retries cleanly.
                        tracing::error!(
                            name = %name,
                            attempts,
                            error = %source,
                            "attendance record not durable"
                        );
                    }
                }
            }
        }

        tracing::info!(
            accepted = self.session.accepted_count(),
            "attendance worker exiting"
        );
        // Camera handle drops here, releasing the device.
    }
}

struct RegistrationWorker {
    camera: Camera,
    detector: OnnxFaceDetector,
    extractor: OnnxExtractor,
    store: Arc<Mutex<Store>>,
    token: RegistrationToken,
    name: String,
    stop: Arc<AtomicBool>,
    warmup_frames: usize,
    sample_interval: Duration,
    max_samples: usize,
    idle_timeout: Duration,
}

impl RegistrationWorker {
    fn run(mut self) {
        use rollcall_core::extractor::FeatureExtractor;

        tracing::info!(name = %self.name, "registration worker started");
        let mut stream = match self.camera.stream() {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to start capture stream");
                self.abort();
                return;
            }
        };
        stream.discard(self.warmup_frames);

        let mut last_activity = Instant::now();
        let mut last_sample: Option<Instant> = None;
        let mut samples = 0usize;

        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            if samples >= self.max_samples {
                tracing::info!(samples, "sample limit reached; finishing capture");
                break;
            }
            if last_activity.elapsed() > self.idle_timeout {
                tracing::warn!("idle timeout during registration capture");
                break;
            }

            let mut frame = match stream.next_frame() {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(error = %e, "frame capture failed");
                    std::thread::sleep(Duration::from_millis(100));
                    continue;
                }
            };
            if frame.is_dark() {
                continue;
            }
            rollcall_hw::frame::equalize_hist(&mut frame.data);

            let faces = match self.detector.detect(&frame.data, frame.width, frame.height) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(error = %e, "face detection failed");
                    continue;
                }
            };
            // Only the most confident face per frame is sampled.
            let Some(bbox) = faces.first() else {
                continue;
            };
            last_activity = Instant::now();

            // Space samples out so near-identical consecutive frames don't
            // dominate the template set.
            if let Some(t) = last_sample {
                if t.elapsed() < self.sample_interval {
                    continue;
                }
            }

            let Some(crop) =
                FaceCrop::from_gray(&frame.data, frame.width, frame.height, bbox, CROP_PADDING)
            else {
                continue;
            };
            let template = match self.extractor.extract(&crop) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(error = %e, "feature extraction failed");
                    continue;
                }
            };

            match self.lock_store(|store| store.add_template(self.token, template.clone())) {
                Ok(count) => {
                    samples = count;
                    last_sample = Some(Instant::now());
                    tracing::debug!(samples, "captured registration sample");
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to record sample");
                    break;
                }
            }
        }

        match self.lock_store(|store| store.finalize(self.token)) {
            Ok(count) => {
                tracing::info!(name = %self.name, samples = count, "registration complete");
            }
            Err(e) => {
                tracing::error!(name = %self.name, error = %e, "registration failed");
                self.abort();
            }
        }
        // Camera handle drops here, releasing the device.
    }

    fn lock_store<T>(
        &self,
        f: impl FnOnce(&mut Store) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut store = self
            .store
            .lock()
            .map_err(|_| StoreError::Io(std::io::Error::other("store lock poisoned")))?;
        f(&mut store)
    }

    fn abort(&self) {
        if let Ok(mut store) = self.store.lock() {
            store.abort_registration(self.token);
        }
    }
}
