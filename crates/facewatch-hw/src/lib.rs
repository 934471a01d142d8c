//! facewatch-hw — Frame capture for the live pipeline.
//!
//! V4L2 cameras and HTTP MJPEG streams behind one [`FrameSource`] trait,
//! plus the single-slot buffer the capture thread writes into.

pub mod camera;
pub mod frame;
pub mod mjpeg;
pub mod slot;
pub mod source;

pub use camera::{Camera, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use slot::{spawn_capture, FrameSlot, SlotClosed};
pub use source::{open_source, CaptureError, FrameSource, SourceKind};
