//! wicket-hw — Hardware abstraction for kiosk cameras.
//!
//! Provides the stream acquisition boundary, a V4L2 backend, camera sessions
//! with facing-mode fallback, and JPEG encoding of captured frames.

pub mod camera;
pub mod frame;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod session;

pub use camera::{
    Camera, CameraError, Constraints, FacingMode, StreamSource, V4l2Devices, V4l2Source,
    VideoStream,
};
pub use frame::{Frame, FrameError};
pub use session::CameraSession;
