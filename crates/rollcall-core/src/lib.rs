//! rollcall-core — Attendance domain logic.
//!
//! The heart of the crate is [`session::AttendanceSession`]: a state machine
//! that turns a noisy per-frame recognition stream into a deduplicated,
//! policy-compliant attendance log. Face detection and feature extraction run
//! via ONNX Runtime and sit behind traits so the session logic is testable
//! without a camera or model files.

pub mod detector;
pub mod extractor;
pub mod matcher;
pub mod session;
pub mod types;

pub use matcher::{Identification, Recognizer, TemplateGallery};
pub use session::{AttendanceSession, AttendanceSink, Decision, SessionPolicy, SkipReason};
pub use types::{
    AttendanceEvent, AttendanceRecord, BoundingBox, FaceCrop, FaceTemplate, Person, Status,
};
