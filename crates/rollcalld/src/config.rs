use std::path::PathBuf;

use chrono::NaiveTime;
use rollcall_core::SessionPolicy;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory holding the attendance CSV and export snapshots.
    pub attendance_dir: PathBuf,
    /// Time-of-day boundary: arrivals after this are late (default 09:00).
    pub cutoff: NaiveTime,
    /// Seconds before the same person can be accepted again in a session.
    pub cooldown_secs: u64,
    /// Maximum recognizer distance for a recognition to count.
    pub max_distance: f32,
    /// Bounded attempts per attendance write.
    pub write_attempts: u32,
    /// Minimum face samples required to finalize a registration.
    pub min_samples: usize,
    /// Registration capture stops automatically at this many samples.
    pub max_samples: usize,
    /// Minimum milliseconds between captured registration samples.
    pub sample_interval_ms: u64,
    /// Frames to discard at session start for auto-exposure stabilization.
    pub warmup_frames: usize,
    /// Session ends after this many seconds without any detected face.
    pub idle_timeout_secs: u64,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        let attendance_dir = std::env::var("ROLLCALL_ATTENDANCE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance"));

        Self {
            camera_device: std::env::var("ROLLCALL_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            model_dir,
            db_path,
            attendance_dir,
            cutoff: std::env::var("ROLLCALL_CUTOFF")
                .ok()
                .and_then(|v| parse_cutoff(&v))
                .unwrap_or_else(default_cutoff),
            cooldown_secs: env_u64("ROLLCALL_COOLDOWN_SECS", 60),
            max_distance: env_f32("ROLLCALL_MAX_DISTANCE", 1.0),
            write_attempts: env_u64("ROLLCALL_WRITE_ATTEMPTS", 3) as u32,
            min_samples: env_usize("ROLLCALL_MIN_SAMPLES", 20),
            max_samples: env_usize("ROLLCALL_MAX_SAMPLES", 100),
            sample_interval_ms: env_u64("ROLLCALL_SAMPLE_INTERVAL_MS", 500),
            warmup_frames: env_usize("ROLLCALL_WARMUP_FRAMES", 4),
            idle_timeout_secs: env_u64("ROLLCALL_IDLE_TIMEOUT_SECS", 300),
        }
    }

    /// Path to the face detection model.
    pub fn detect_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the embedding model.
    pub fn embed_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path of the attendance CSV the store dual-writes.
    pub fn csv_path(&self) -> PathBuf {
        self.attendance_dir.join("Attendance.csv")
    }

    /// Temporal policy for one attendance session. Fixed at session start.
    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            cutoff: self.cutoff,
            cooldown: chrono::Duration::seconds(self.cooldown_secs as i64),
            max_distance: self.max_distance,
            write_attempts: self.write_attempts,
        }
    }
}

fn default_cutoff() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default()
}

/// Accept "HH:MM" or "HH:MM:SS".
fn parse_cutoff(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .ok()
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
