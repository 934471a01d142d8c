//! facewatch-core — face localization, FaceNet embeddings and gallery matching.
//!
//! All inference runs through one [`accelerator::SharedSession`]. The ONNX
//! Runtime backend in [`onnx`] provides the devices.

pub mod accelerator;
pub mod batch;
pub mod config;
pub mod detector;
pub mod events;
pub mod extractor;
pub mod gallery;
pub mod images;
pub mod onnx;
pub mod types;

pub use accelerator::{AcceleratorError, AcceleratorSession, SessionState, SharedSession};
pub use batch::{BatchClassifier, BatchSummary, EventMode};
pub use config::Settings;
pub use detector::{FaceLocalizer, ScrfdLocalizer};
pub use events::{AlertEvent, AlertKind, EventSink, QueuedSink};
pub use extractor::{EmbeddingExtractor, ExtractorOptions};
pub use gallery::Gallery;
pub use types::{CropRect, Embedding, FaceRegion, GalleryEntry, MatchResult};
