//! Static-directory classifier: every test image is embedded once and
//! compared against the precomputed gallery.

use crate::accelerator::AcceleratorError;
use crate::events::{publish_best_effort, AlertEvent, EventSink};
use crate::extractor::{EmbeddingExtractor, ExtractError};
use crate::gallery::Gallery;
use crate::images;
use crate::types::MatchResult;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Which alerts a batch run emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventMode {
    /// One INTRUDER per non-matching comparison before the verdict, then
    /// RECOGNISED on the match.
    #[default]
    PerComparison,
    /// One alert per test image.
    Verdict,
}

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("cannot read test directory {dir}: {source}")]
    Unreadable {
        dir: PathBuf,
        source: std::io::Error,
    },
    #[error("accelerator unusable during batch: {0}")]
    Accelerator(#[from] AcceleratorError),
}

#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub file: PathBuf,
    pub result: MatchResult,
}

#[derive(Debug, Clone)]
pub struct BatchSummary {
    /// Test images successfully embedded and compared.
    pub tested: usize,
    pub identified: usize,
    /// Test images that could not be decoded or embedded.
    pub failed: usize,
    pub started: DateTime<Local>,
    pub ended: DateTime<Local>,
    pub elapsed: Duration,
    pub outcomes: Vec<TestOutcome>,
}

pub struct BatchClassifier<'a> {
    extractor: &'a EmbeddingExtractor,
    gallery: &'a Gallery,
    sink: &'a dyn EventSink,
    camera_id: &'a str,
    mode: EventMode,
}

impl<'a> BatchClassifier<'a> {
    pub fn new(
        extractor: &'a EmbeddingExtractor,
        gallery: &'a Gallery,
        sink: &'a dyn EventSink,
        camera_id: &'a str,
        mode: EventMode,
    ) -> Self {
        Self {
            extractor,
            gallery,
            sink,
            camera_id,
            mode,
        }
    }

    /// Classify every image in `test_dir`.
    ///
    /// Per-image failures are counted and skipped; only an unreadable
    /// directory or a closed accelerator session ends the run early.
    pub fn run(&self, test_dir: &Path) -> Result<BatchSummary, BatchError> {
        let started = Local::now();
        let clock = Instant::now();
        tracing::info!(dir = %test_dir.display(), gallery = self.gallery.len(), mode = ?self.mode, "batch classification starting");

        let files = images::list_images(test_dir).map_err(|source| BatchError::Unreadable {
            dir: test_dir.to_path_buf(),
            source,
        })?;

        let mut tested = 0usize;
        let mut identified = 0usize;
        let mut failed = 0usize;
        let mut outcomes = Vec::with_capacity(files.len());

        for file in files {
            let image = match images::load_rgb(&file) {
                Ok(img) => img,
                Err(e) => {
                    tracing::warn!(path = %file.display(), error = %e, "unreadable test image; skipping");
                    failed += 1;
                    continue;
                }
            };

            let probe = match self.extractor.extract(&image) {
                Ok(p) => p,
                Err(ExtractError::Accelerator(e)) if e.is_lifecycle() => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(path = %file.display(), error = %e, "test image failed to embed; skipping");
                    failed += 1;
                    continue;
                }
            };
            tested += 1;

            let result = match self.mode {
                EventMode::PerComparison => self.compare_each(&file, &probe),
                EventMode::Verdict => {
                    let result = self.gallery.match_probe(&probe);
                    publish_best_effort(self.sink, &AlertEvent::for_match(self.camera_id, &result));
                    result
                }
            };

            if result.matched {
                identified += 1;
                tracing::info!(
                    file = %file.display(),
                    identity = result.identity.as_deref().unwrap_or_default(),
                    distance = result.distance,
                    "match"
                );
            } else {
                tracing::info!(file = %file.display(), distance = result.distance, "no match");
            }
            outcomes.push(TestOutcome { file, result });
        }

        let summary = BatchSummary {
            tested,
            identified,
            failed,
            started,
            ended: Local::now(),
            elapsed: clock.elapsed(),
            outcomes,
        };
        tracing::info!(
            tested = summary.tested,
            identified = summary.identified,
            failed = summary.failed,
            elapsed_secs = summary.elapsed.as_secs_f64(),
            "batch classification finished"
        );
        Ok(summary)
    }

    /// Emit one alert per comparison, walking the gallery up to the first match.
    fn compare_each(&self, file: &Path, probe: &crate::types::Embedding) -> MatchResult {
        let mut closest = f32::INFINITY;
        for cmp in self.gallery.comparisons(probe) {
            tracing::debug!(file = %file.display(), against = %cmp.label, distance = cmp.distance, matched = cmp.matched, "comparison");
            if cmp.matched {
                publish_best_effort(self.sink, &AlertEvent::recognised(self.camera_id, &cmp.label));
                return MatchResult {
                    matched: true,
                    identity: Some(cmp.label),
                    distance: cmp.distance,
                };
            }
            publish_best_effort(self.sink, &AlertEvent::intruder(self.camera_id));
            closest = closest.min(cmp.distance);
        }
        MatchResult::no_match(closest)
    }
}
