//! FaceNet embedding extractor.
//!
//! Resizes a face crop to the graph's square input, whitens it per image,
//! runs it on the shared accelerator session and L2-normalizes the output.

use crate::accelerator::{AcceleratorError, SharedSession};
use crate::types::{CropRect, Embedding};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const FACENET_INPUT_SIZE: u32 = 160;

/// Memory layout the embedding graph expects for its input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `[1, H, W, 3]`, as exported from TensorFlow FaceNet checkpoints.
    #[default]
    Nhwc,
    /// `[1, 3, H, W]`.
    Nchw,
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("degenerate face region {width}x{height}")]
    Preprocess { width: u32, height: u32 },
    #[error("expected {expected}-dim embedding, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error(transparent)]
    Accelerator(#[from] AcceleratorError),
}

impl ExtractError {
    /// True when the input itself was unusable and no inference was attempted.
    pub fn is_degenerate(&self) -> bool {
        matches!(self, Self::Preprocess { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ExtractorOptions {
    pub input_size: u32,
    pub layout: TensorLayout,
    /// Reject graphs whose output length differs from this.
    pub embedding_dim: Option<usize>,
}

impl Default for ExtractorOptions {
    fn default() -> Self {
        Self {
            input_size: FACENET_INPUT_SIZE,
            layout: TensorLayout::Nhwc,
            embedding_dim: None,
        }
    }
}

/// Turns face crops into embeddings on the shared accelerator.
#[derive(Clone)]
pub struct EmbeddingExtractor {
    session: SharedSession,
    options: ExtractorOptions,
}

impl EmbeddingExtractor {
    pub fn new(session: SharedSession, options: ExtractorOptions) -> Self {
        Self { session, options }
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    /// Extract an embedding from a whole image (a reference photo or a crop).
    pub fn extract(&self, face: &RgbImage) -> Result<Embedding, ExtractError> {
        let (width, height) = face.dimensions();
        if width == 0 || height == 0 {
            return Err(ExtractError::Preprocess { width, height });
        }

        let input = preprocess(face, self.options.input_size, self.options.layout);
        let raw = self.session.infer(input.view())?;

        if let Some(expected) = self.options.embedding_dim {
            if raw.values.len() != expected {
                return Err(ExtractError::DimensionMismatch {
                    expected,
                    actual: raw.values.len(),
                });
            }
        }

        Ok(Embedding {
            values: l2_normalize(raw.values),
            model_version: raw.model_version,
        })
    }

    /// Extract an embedding from the `crop` rectangle of `frame`.
    pub fn extract_region(&self, frame: &RgbImage, crop: CropRect) -> Result<Embedding, ExtractError> {
        if crop.is_empty() {
            return Err(ExtractError::Preprocess {
                width: crop.width(),
                height: crop.height(),
            });
        }
        let face = image::imageops::crop_imm(frame, crop.left, crop.top, crop.width(), crop.height())
            .to_image();
        self.extract(&face)
    }
}

/// Resize to `size`×`size` (aspect ratio not preserved) and whiten.
fn preprocess(face: &RgbImage, size: u32, layout: TensorLayout) -> Array4<f32> {
    let resized = image::imageops::resize(face, size, size, FilterType::Triangle);
    let (mean, scale) = whitening(resized.as_raw());

    let s = size as usize;
    let mut tensor = match layout {
        TensorLayout::Nhwc => Array4::<f32>::zeros((1, s, s, 3)),
        TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, s, s)),
    };

    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            let v = (pixel[c] as f32 - mean) * scale;
            match layout {
                TensorLayout::Nhwc => tensor[[0, y, x, c]] = v,
                TensorLayout::Nchw => tensor[[0, c, y, x]] = v,
            }
        }
    }

    tensor
}

/// Mean and inverse adjusted standard deviation over every channel value.
///
/// The standard deviation is floored at `1/sqrt(n)` so flat images do not
/// blow up.
fn whitening(values: &[u8]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 1.0);
    }
    let n = values.len() as f32;
    let mean = values.iter().map(|&v| v as f32).sum::<f32>() / n;
    let variance = values.iter().map(|&v| (v as f32 - mean).powi(2)).sum::<f32>() / n;
    let std_adjusted = variance.sqrt().max(1.0 / n.sqrt());
    (mean, 1.0 / std_adjusted)
}

fn l2_normalize(values: Vec<f32>) -> Vec<f32> {
    let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.into_iter().map(|x| x / norm).collect()
    } else {
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::testing::fake_session;
    use image::Rgb;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 255 / width.max(1)) as u8, (y * 255 / height.max(1)) as u8, 64])
        })
    }

    #[test]
    fn test_preprocess_shapes() {
        let face = gradient(37, 51);
        assert_eq!(preprocess(&face, 160, TensorLayout::Nhwc).shape(), &[1, 160, 160, 3]);
        assert_eq!(preprocess(&face, 160, TensorLayout::Nchw).shape(), &[1, 3, 160, 160]);
    }

    #[test]
    fn test_preprocess_is_whitened() {
        let tensor = preprocess(&gradient(200, 120), 160, TensorLayout::Nhwc);
        let n = tensor.len() as f32;
        let mean = tensor.sum() / n;
        let var = tensor.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        assert!(mean.abs() < 1e-3, "mean {mean}");
        assert!((var.sqrt() - 1.0).abs() < 1e-2, "std {}", var.sqrt());
    }

    #[test]
    fn test_flat_image_whitens_to_zero() {
        let flat = RgbImage::from_pixel(20, 20, Rgb([90, 90, 90]));
        let tensor = preprocess(&flat, 16, TensorLayout::Nchw);
        assert!(tensor.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_layouts_hold_same_values() {
        let face = gradient(64, 64);
        let nhwc = preprocess(&face, 32, TensorLayout::Nhwc);
        let nchw = preprocess(&face, 32, TensorLayout::Nchw);
        assert_eq!(nhwc[[0, 5, 7, 2]], nchw[[0, 2, 5, 7]]);
    }

    #[test]
    fn test_extract_is_deterministic_and_normalized() {
        let extractor = EmbeddingExtractor::new(fake_session(), ExtractorOptions::default());
        let face = gradient(90, 110);
        let a = extractor.extract(&face).unwrap();
        let b = extractor.extract(&face).unwrap();
        assert_eq!(a.distance(&b), 0.0);
        let norm: f32 = a.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        assert!(a.model_version.is_some());
    }

    #[test]
    fn test_zero_area_crop_is_preprocess_error() {
        let extractor = EmbeddingExtractor::new(fake_session(), ExtractorOptions::default());
        let frame = gradient(64, 48);
        let crop = CropRect { top: 48, left: 10, bottom: 48, right: 30 };
        let err = extractor.extract_region(&frame, crop).unwrap_err();
        assert!(err.is_degenerate());
    }

    #[test]
    fn test_extract_region_matches_manual_crop() {
        let extractor = EmbeddingExtractor::new(fake_session(), ExtractorOptions::default());
        let frame = gradient(64, 48);
        let crop = CropRect { top: 4, left: 8, bottom: 40, right: 50 };
        let via_region = extractor.extract_region(&frame, crop).unwrap();
        let manual = image::imageops::crop_imm(&frame, 8, 4, 42, 36).to_image();
        let direct = extractor.extract(&manual).unwrap();
        assert_eq!(via_region.distance(&direct), 0.0);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let options = ExtractorOptions {
            embedding_dim: Some(128),
            ..ExtractorOptions::default()
        };
        let extractor = EmbeddingExtractor::new(fake_session(), options);
        let err = extractor.extract(&gradient(32, 32)).unwrap_err();
        assert!(matches!(err, ExtractError::DimensionMismatch { expected: 128, actual: 12 }));
        assert!(!err.is_degenerate());
    }

    #[test]
    fn test_closed_session_surfaces_accelerator_error() {
        let session = fake_session();
        let extractor = EmbeddingExtractor::new(session.clone(), ExtractorOptions::default());
        session.close();
        let err = extractor.extract(&gradient(32, 32)).unwrap_err();
        assert!(matches!(err, ExtractError::Accelerator(AcceleratorError::SessionClosed)));
    }
}
