//! rollcall-hw — Camera capture for attendance and registration sessions.
//!
//! The camera is a scoped resource: a session opens it at start and the
//! handle is dropped on every exit path. V4L2 access goes through the `v4l`
//! crate; frames come out as grayscale with histogram equalization applied
//! before detection.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CameraStream, PixelFormat};
pub use frame::Frame;
