//! Live pipeline consumer: takes the newest captured frame, localizes faces,
//! matches each against the gallery, publishes alerts and hands an annotated
//! JPEG to the stream.
//!
//! Runs on a dedicated OS thread because every step is blocking; the async
//! side only sees the `watch` channel and a completion `oneshot`.

use crate::annotate;
use axum::body::Bytes;
use facewatch_core::accelerator::AcceleratorError;
use facewatch_core::events::{publish_best_effort, AlertEvent, EventSink};
use facewatch_core::extractor::ExtractError;
use facewatch_core::{EmbeddingExtractor, FaceLocalizer, FaceRegion, Gallery, MatchResult};
use facewatch_hw::{Frame, FrameSlot, SlotClosed};
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

/// How long the consumer waits for a frame before re-checking the stop flag.
const FRAME_WAIT: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("capture lost: {0}")]
    CaptureLost(String),
    #[error(transparent)]
    Accelerator(#[from] AcceleratorError),
    #[error("pipeline thread exited without reporting")]
    ThreadGone,
}

/// Gallery shared with the reload handler; swapped whole, never mutated.
#[derive(Clone)]
pub struct GalleryHandle(Arc<RwLock<Arc<Gallery>>>);

impl GalleryHandle {
    pub fn new(gallery: Gallery) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(gallery))))
    }

    pub fn current(&self) -> Arc<Gallery> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn replace(&self, gallery: Gallery) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(gallery);
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub camera_id: String,
    pub margin: u32,
    pub mirror: bool,
    pub jpeg_quality: u8,
}

/// Outcome for one detected face.
#[derive(Debug, Clone)]
pub struct FaceOutcome {
    pub region: FaceRegion,
    pub result: MatchResult,
}

pub struct FrameReport {
    pub annotated: RgbImage,
    pub faces: Vec<FaceOutcome>,
}

pub struct LivePipeline {
    localizer: Box<dyn FaceLocalizer>,
    extractor: EmbeddingExtractor,
    gallery: GalleryHandle,
    sink: Arc<dyn EventSink>,
    options: PipelineOptions,
}

impl LivePipeline {
    pub fn new(
        localizer: Box<dyn FaceLocalizer>,
        extractor: EmbeddingExtractor,
        gallery: GalleryHandle,
        sink: Arc<dyn EventSink>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            localizer,
            extractor,
            gallery,
            sink,
            options,
        }
    }

    /// Detect, match, alert and annotate one frame.
    ///
    /// Per-face failures never abort the frame. Only a closed or
    /// unallocated accelerator session is returned as an error.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<FrameReport, PipelineError> {
        let image: &RgbImage = &frame.image;
        let mut annotated = image.clone();

        let regions = match self.localizer.detect(image) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(seq = frame.sequence, error = %e, "face detection failed; frame passed through");
                Vec::new()
            }
        };

        let gallery = self.gallery.current();
        let mut faces = Vec::with_capacity(regions.len());

        for region in regions {
            let crop = region.expanded(self.options.margin, image.width(), image.height());
            let result = match self.extractor.extract_region(image, crop) {
                Ok(probe) => gallery.match_probe(&probe),
                Err(e) if e.is_degenerate() => {
                    tracing::debug!(seq = frame.sequence, ?region, "degenerate face crop skipped");
                    continue;
                }
                Err(ExtractError::Accelerator(e)) if e.is_lifecycle() => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(seq = frame.sequence, error = %e, "embedding failed; treating face as unmatched");
                    MatchResult::no_match(f32::INFINITY)
                }
            };

            if result.matched {
                tracing::info!(
                    seq = frame.sequence,
                    identity = result.identity.as_deref().unwrap_or_default(),
                    distance = result.distance,
                    "face recognised"
                );
            } else {
                tracing::debug!(seq = frame.sequence, distance = result.distance, "intruder");
            }

            publish_best_effort(
                self.sink.as_ref(),
                &AlertEvent::for_match(&self.options.camera_id, &result),
            );
            annotate::draw_face(&mut annotated, &region, result.matched);
            faces.push(FaceOutcome { region, result });
        }

        Ok(FrameReport { annotated, faces })
    }

    /// Consume frames from `slot` until stopped, the capture ends, or the
    /// accelerator session is closed underneath us.
    pub fn run(
        &mut self,
        slot: &FrameSlot,
        frames: &watch::Sender<Option<Bytes>>,
        stop: &AtomicBool,
    ) -> Result<(), PipelineError> {
        let mut processed = 0u64;
        loop {
            if stop.load(Ordering::Relaxed) {
                tracing::info!(processed, "pipeline stop requested");
                return Ok(());
            }

            let frame = match slot.take(FRAME_WAIT) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(SlotClosed::Stopped) => {
                    tracing::info!(processed, "capture stopped; pipeline exiting");
                    return Ok(());
                }
                Err(SlotClosed::Failed(reason)) => return Err(PipelineError::CaptureLost(reason)),
            };

            let report = match self.process_frame(&frame) {
                Ok(report) => report,
                Err(PipelineError::Accelerator(AcceleratorError::SessionClosed))
                    if stop.load(Ordering::Relaxed) =>
                {
                    tracing::info!(processed, "session closed during shutdown");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            processed += 1;
            let faces = report.faces.len();

            match annotate::encode_frame(
                report.annotated,
                self.options.mirror,
                self.options.jpeg_quality,
            ) {
                Ok(jpeg) => {
                    frames.send_replace(Some(Bytes::from(jpeg)));
                    tracing::trace!(
                        seq = frame.sequence,
                        faces,
                        latency_ms = frame.age().as_millis() as u64,
                        "frame published"
                    );
                }
                Err(e) => tracing::warn!(seq = frame.sequence, error = %e, "frame encode failed"),
            }
        }
    }
}

/// Spawn the consumer on a dedicated OS thread. The receiver resolves when
/// the loop exits.
pub fn spawn_pipeline(
    mut pipeline: LivePipeline,
    slot: Arc<FrameSlot>,
    frames: watch::Sender<Option<Bytes>>,
    stop: Arc<AtomicBool>,
) -> oneshot::Receiver<Result<(), PipelineError>> {
    let (done_tx, done_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("facewatch-pipeline".into())
        .spawn(move || {
            tracing::info!("pipeline thread started");
            let result = pipeline.run(&slot, &frames, &stop);
            if let Err(e) = &result {
                tracing::error!(error = %e, "pipeline stopped");
            }
            let _ = done_tx.send(result);
        })
        .expect("failed to spawn pipeline thread");

    done_rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use facewatch_core::accelerator::{AcceleratorSession, Device, Graph};
    use facewatch_core::detector::DetectorError;
    use facewatch_core::events::EventPublishError;
    use facewatch_core::extractor::ExtractorOptions;
    use facewatch_core::{AlertKind, GalleryEntry, QueuedSink, SharedSession};
    use image::Rgb;
    use ndarray::ArrayView4;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Embedding = mean of each input channel.
    struct ChannelMeanGraph {
        fail: bool,
    }

    impl Graph for ChannelMeanGraph {
        fn infer(&mut self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, AcceleratorError> {
            if self.fail {
                return Err(AcceleratorError::Inference("device timeout".into()));
            }
            let (_, h, w, c) = input.dim();
            let mut out = vec![0.0f32; c];
            for ((_, _, _, ch), v) in input.indexed_iter() {
                out[ch] += *v;
            }
            let n = (h * w) as f32;
            Ok(out.into_iter().map(|s| s / n).collect())
        }
    }

    struct TestDevice {
        fail: bool,
    }

    impl Device for TestDevice {
        fn name(&self) -> &str {
            "test0"
        }

        fn allocate(&mut self, _graph: &[u8]) -> Result<Box<dyn Graph>, AcceleratorError> {
            Ok(Box::new(ChannelMeanGraph { fail: self.fail }))
        }
    }

    fn session(fail: bool) -> SharedSession {
        let mut s = AcceleratorSession::open(vec![Box::new(TestDevice { fail })]).unwrap();
        s.load_graph(b"channel-mean").unwrap();
        SharedSession::new(s, Duration::from_secs(5))
    }

    struct FixedLocalizer {
        regions: Vec<FaceRegion>,
        fail: bool,
    }

    impl FaceLocalizer for FixedLocalizer {
        fn detect(&mut self, _frame: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError> {
            if self.fail {
                return Err(DetectorError::InferenceFailed("boom".into()));
            }
            Ok(self.regions.clone())
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<AlertEvent>>);

    impl Recorder {
        fn events(&self) -> Vec<AlertEvent> {
            self.0.lock().unwrap().clone()
        }
    }

    impl EventSink for Recorder {
        fn publish(&self, event: &AlertEvent) -> Result<(), EventPublishError> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    const RED: Rgb<u8> = Rgb([220, 20, 20]);
    const BLUE: Rgb<u8> = Rgb([20, 20, 220]);

    fn square(top: i32, left: i32, size: i32) -> FaceRegion {
        FaceRegion {
            top,
            left,
            bottom: top + size,
            right: left + size,
            confidence: 0.99,
            landmarks: None,
        }
    }

    /// 64×64 black frame with a coloured 20px face at (10, 10).
    fn frame_with_face(colour: Rgb<u8>, seq: u64) -> Frame {
        let mut img = RgbImage::new(64, 64);
        for y in 10..30 {
            for x in 10..30 {
                img.put_pixel(x, y, colour);
            }
        }
        Frame::new(img, seq)
    }

    struct Harness {
        pipeline: LivePipeline,
        sink: Arc<Recorder>,
        gallery: GalleryHandle,
        extractor: EmbeddingExtractor,
    }

    fn harness(regions: Vec<FaceRegion>, detect_fail: bool, infer_fail: bool) -> Harness {
        let extractor = EmbeddingExtractor::new(session(false), ExtractorOptions::default());
        let alice = extractor
            .extract(&RgbImage::from_pixel(20, 20, RED))
            .unwrap();
        let gallery = GalleryHandle::new(Gallery::new(
            vec![GalleryEntry {
                label: "alice".into(),
                embedding: alice,
                source: "alice.png".into(),
            }],
            0.5,
        ));

        let probe_extractor = if infer_fail {
            EmbeddingExtractor::new(session(true), ExtractorOptions::default())
        } else {
            extractor.clone()
        };
        let sink = Arc::new(Recorder::default());
        let pipeline = LivePipeline::new(
            Box::new(FixedLocalizer {
                regions,
                fail: detect_fail,
            }),
            probe_extractor,
            gallery.clone(),
            sink.clone(),
            PipelineOptions {
                camera_id: "front-door".into(),
                margin: 0,
                mirror: false,
                jpeg_quality: 80,
            },
        );
        Harness {
            pipeline,
            sink,
            gallery,
            extractor,
        }
    }

    #[test]
    fn test_no_faces_emits_no_events() {
        let mut h = harness(Vec::new(), false, false);
        let frame = frame_with_face(RED, 1);
        let report = h.pipeline.process_frame(&frame).unwrap();
        assert!(report.faces.is_empty());
        assert!(h.sink.events().is_empty());
        assert_eq!(report.annotated, *frame.image);
    }

    #[test]
    fn test_known_face_recognised_with_green_box() {
        let mut h = harness(vec![square(10, 10, 20)], false, false);
        let report = h.pipeline.process_frame(&frame_with_face(RED, 1)).unwrap();

        assert_eq!(report.faces.len(), 1);
        assert_eq!(report.faces[0].result.identity.as_deref(), Some("alice"));
        let events = h.sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AlertKind::Recognised);
        assert_eq!(events[0].message, "alice Detected");
        assert_eq!(events[0].origin, "front-door");
        assert_eq!(report.annotated.get_pixel(10, 10), &annotate::RECOGNISED_COLOUR);
    }

    #[test]
    fn test_unknown_face_is_intruder_with_red_box() {
        let mut h = harness(vec![square(10, 10, 20)], false, false);
        let report = h.pipeline.process_frame(&frame_with_face(BLUE, 1)).unwrap();

        assert!(!report.faces[0].result.matched);
        let events = h.sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AlertKind::Intruder);
        assert_eq!(report.annotated.get_pixel(29, 29), &annotate::INTRUDER_COLOUR);
    }

    #[test]
    fn test_each_face_in_frame_processed() {
        let mut h = harness(vec![square(10, 10, 20), square(100, 100, 10)], false, false);
        let report = h.pipeline.process_frame(&frame_with_face(RED, 1)).unwrap();
        // The second box lies wholly outside the 64×64 frame and is skipped.
        assert_eq!(report.faces.len(), 1);
        assert_eq!(h.sink.events().len(), 1);
    }

    /// Takes `delay` to accept each event.
    struct SlowSink {
        delay: Duration,
        delivered: Recorder,
    }

    impl EventSink for SlowSink {
        fn publish(&self, event: &AlertEvent) -> Result<(), EventPublishError> {
            std::thread::sleep(self.delay);
            self.delivered.publish(event)
        }
    }

    #[test]
    fn test_slow_alert_sink_does_not_hold_up_frame() {
        let mut h = harness(vec![square(10, 10, 20), square(35, 35, 20)], false, false);
        let slow = Arc::new(SlowSink {
            delay: Duration::from_millis(500),
            delivered: Recorder::default(),
        });
        h.pipeline.sink = Arc::new(QueuedSink::spawn(slow.clone(), 8));

        let started = Instant::now();
        let report = h.pipeline.process_frame(&frame_with_face(RED, 1)).unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(report.faces.len(), 2);

        let deadline = Instant::now() + Duration::from_secs(5);
        while slow.delivered.events().len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        let kinds: Vec<_> = slow.delivered.events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![AlertKind::Recognised, AlertKind::Intruder]);
    }

    #[test]
    fn test_detection_failure_passes_frame_through() {
        let mut h = harness(vec![square(10, 10, 20)], true, false);
        let report = h.pipeline.process_frame(&frame_with_face(RED, 1)).unwrap();
        assert!(report.faces.is_empty());
        assert!(h.sink.events().is_empty());
    }

    #[test]
    fn test_inference_fault_reports_intruder() {
        let mut h = harness(vec![square(10, 10, 20)], false, true);
        let report = h.pipeline.process_frame(&frame_with_face(RED, 1)).unwrap();
        assert!(!report.faces[0].result.matched);
        assert!(report.faces[0].result.distance.is_infinite());
        assert_eq!(h.sink.events()[0].kind, AlertKind::Intruder);
    }

    #[test]
    fn test_closed_session_is_fatal() {
        let mut h = harness(vec![square(10, 10, 20)], false, false);
        h.extractor.session().close();
        let err = h.pipeline.process_frame(&frame_with_face(RED, 1)).err().unwrap();
        assert!(matches!(
            err,
            PipelineError::Accelerator(AcceleratorError::SessionClosed)
        ));
        assert!(h.sink.events().is_empty());
    }

    #[test]
    fn test_gallery_reload_applies_to_next_frame() {
        let mut h = harness(vec![square(10, 10, 20)], false, false);
        let bob = h
            .extractor
            .extract(&RgbImage::from_pixel(20, 20, BLUE))
            .unwrap();
        h.gallery.replace(Gallery::new(
            vec![GalleryEntry {
                label: "bob".into(),
                embedding: bob,
                source: "bob.png".into(),
            }],
            0.5,
        ));
        let report = h.pipeline.process_frame(&frame_with_face(BLUE, 1)).unwrap();
        assert_eq!(report.faces[0].result.identity.as_deref(), Some("bob"));
    }

    #[test]
    fn test_run_streams_frames_until_capture_lost() {
        let mut h = harness(vec![square(10, 10, 20)], false, false);
        let slot = FrameSlot::new();
        slot.publish(frame_with_face(RED, 1));
        slot.close(SlotClosed::Failed("unplugged".into()));

        let (tx, rx) = watch::channel(None);
        let stop = AtomicBool::new(false);
        let err = h.pipeline.run(&slot, &tx, &stop).unwrap_err();

        assert!(matches!(err, PipelineError::CaptureLost(ref m) if m == "unplugged"));
        let jpeg = rx.borrow().clone().unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(h.sink.events().len(), 1);
    }

    #[test]
    fn test_run_returns_when_stopped() {
        let mut h = harness(Vec::new(), false, false);
        let slot = FrameSlot::new();
        let (tx, _rx) = watch::channel(None);
        let stop = AtomicBool::new(true);
        assert!(h.pipeline.run(&slot, &tx, &stop).is_ok());
    }

    #[tokio::test]
    async fn test_spawned_pipeline_reports_completion() {
        let h = harness(Vec::new(), false, false);
        let slot = Arc::new(FrameSlot::new());
        let (tx, _rx) = watch::channel(None);
        let stop = Arc::new(AtomicBool::new(false));
        let done = spawn_pipeline(h.pipeline, slot.clone(), tx, stop);
        slot.close(SlotClosed::Stopped);
        assert!(done.await.unwrap().is_ok());
    }
}
