//! Gallery of known identities and the first-match-wins matcher.
//!
//! The gallery is built once per run from a directory of reference photos,
//! each assumed to hold a single centred face, so no localization is applied.
//! Matching walks entries in file-name order and stops at the first entry
//! closer than the threshold. It is not a nearest-neighbour search.

use crate::accelerator::AcceleratorError;
use crate::extractor::{EmbeddingExtractor, ExtractError};
use crate::images;
use crate::types::{Embedding, GalleryEntry, MatchResult};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Euclidean distance below which two FaceNet embeddings are the same person.
/// Square root of the 1.3 squared-distance cutoff used by the FaceNet reference.
pub const DEFAULT_THRESHOLD: f32 = 1.14;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("cannot read gallery directory {dir}: {source}")]
    Unreadable {
        dir: PathBuf,
        source: std::io::Error,
    },
    #[error("accelerator unusable while building gallery: {0}")]
    Accelerator(#[from] AcceleratorError),
}

/// Outcome of comparing a probe against one gallery entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub index: usize,
    pub label: String,
    pub distance: f32,
    pub matched: bool,
}

#[derive(Debug, Clone)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
    threshold: f32,
}

impl Gallery {
    pub fn new(entries: Vec<GalleryEntry>, threshold: f32) -> Self {
        Self { entries, threshold }
    }

    /// Build a gallery from every image file in `dir`.
    ///
    /// Files that cannot be decoded or embedded are skipped with a warning.
    /// Only an unreadable directory or a dead accelerator session is fatal.
    pub fn build(
        dir: &Path,
        extractor: &EmbeddingExtractor,
        threshold: f32,
    ) -> Result<Self, GalleryError> {
        let files = images::list_images(dir).map_err(|source| GalleryError::Unreadable {
            dir: dir.to_path_buf(),
            source,
        })?;

        let mut entries = Vec::with_capacity(files.len());
        let mut seen = HashSet::new();

        for path in files {
            let label = images::label_for(&path);
            if seen.contains(&label) {
                tracing::warn!(path = %path.display(), label = %label, "duplicate gallery label; skipping");
                continue;
            }

            let image = match images::load_rgb(&path) {
                Ok(img) => img,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "unreadable gallery image; skipping");
                    continue;
                }
            };

            match extractor.extract(&image) {
                Ok(embedding) => {
                    tracing::debug!(label = %label, dim = embedding.values.len(), "gallery entry embedded");
                    seen.insert(label.clone());
                    entries.push(GalleryEntry {
                        label,
                        embedding,
                        source: path,
                    });
                }
                Err(ExtractError::Accelerator(e)) if e.is_lifecycle() => {
                    return Err(GalleryError::Accelerator(e));
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "gallery image failed to embed; skipping");
                }
            }
        }

        if entries.is_empty() {
            tracing::warn!(dir = %dir.display(), "gallery is empty; every face will be reported as an intruder");
        } else {
            tracing::info!(dir = %dir.display(), entries = entries.len(), threshold, "gallery built");
        }

        Ok(Self { entries, threshold })
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Compare `probe` against entries in order, up to and including the
    /// first match.
    pub fn comparisons<'a>(&'a self, probe: &'a Embedding) -> Comparisons<'a> {
        Comparisons {
            entries: self.entries.iter().enumerate(),
            probe,
            threshold: self.threshold,
            done: false,
        }
    }

    /// First-match-wins verdict for `probe`.
    pub fn match_probe(&self, probe: &Embedding) -> MatchResult {
        let mut closest = f32::INFINITY;
        for cmp in self.comparisons(probe) {
            if cmp.matched {
                return MatchResult {
                    matched: true,
                    identity: Some(cmp.label),
                    distance: cmp.distance,
                };
            }
            closest = closest.min(cmp.distance);
        }
        MatchResult::no_match(closest)
    }
}

/// Iterator returned by [`Gallery::comparisons`].
pub struct Comparisons<'a> {
    entries: std::iter::Enumerate<std::slice::Iter<'a, GalleryEntry>>,
    probe: &'a Embedding,
    threshold: f32,
    done: bool,
}

impl Iterator for Comparisons<'_> {
    type Item = Comparison;

    fn next(&mut self) -> Option<Comparison> {
        if self.done {
            return None;
        }
        let (index, entry) = self.entries.next()?;
        let distance = self.probe.distance(&entry.embedding);
        let matched = distance < self.threshold;
        self.done = matched;
        Some(Comparison {
            index,
            label: entry.label.clone(),
            distance,
            matched,
        })
    }
}
