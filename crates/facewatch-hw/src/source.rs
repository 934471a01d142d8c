//! Frame sources and selection from a configured source string.

use crate::camera::Camera;
use crate::frame::Frame;
use crate::mjpeg::MjpegSource;
use std::ops::ControlFlow;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("stream request failed: {0}")]
    Http(String),
    #[error("source ended")]
    EndOfStream,
}

/// A continuously producing video source.
pub trait FrameSource: Send {
    fn describe(&self) -> String;

    /// Deliver frames to `on_frame` until it breaks or the source fails.
    ///
    /// Returns `Ok(())` only when the callback asked to stop. A source that
    /// runs dry returns [`CaptureError::EndOfStream`].
    fn run(
        &mut self,
        on_frame: &mut dyn FnMut(Frame) -> ControlFlow<()>,
    ) -> Result<(), CaptureError>;
}

/// Where frames come from, parsed from the `camera.source` setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    V4l2 { path: String },
    Mjpeg { url: String },
}

impl SourceKind {
    pub fn parse(source: &str) -> Self {
        let lower = source.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            Self::Mjpeg {
                url: source.to_string(),
            }
        } else {
            Self::V4l2 {
                path: source.to_string(),
            }
        }
    }
}

/// Open the source named by `source`. V4L2 devices are opened eagerly so a
/// missing camera fails at startup; HTTP sources connect when run.
pub fn open_source(
    source: &str,
    width: u32,
    height: u32,
) -> Result<Box<dyn FrameSource>, CaptureError> {
    match SourceKind::parse(source) {
        SourceKind::V4l2 { path } => Ok(Box::new(Camera::open(&path, width, height)?)),
        SourceKind::Mjpeg { url } => Ok(Box::new(MjpegSource::new(&url, Duration::from_secs(10)))),
    }
}
