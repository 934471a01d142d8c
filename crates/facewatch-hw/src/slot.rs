//! Single-slot "latest frame" buffer between the capture thread and the
//! consumer. The producer overwrites; the consumer always takes the newest
//! frame. Stale frames are dropped, never queued.

use crate::frame::Frame;
use crate::source::FrameSource;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

/// Why the slot will never deliver another frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlotClosed {
    #[error("capture stopped")]
    Stopped,
    #[error("capture failed: {0}")]
    Failed(String),
}

#[derive(Default)]
struct SlotState {
    latest: Option<Frame>,
    closed: Option<SlotClosed>,
    dropped: u64,
}

#[derive(Default)]
pub struct FrameSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current frame. Returns false once the slot is closed.
    pub fn publish(&self, frame: Frame) -> bool {
        let mut state = self.lock();
        if state.closed.is_some() {
            return false;
        }
        if state.latest.replace(frame).is_some() {
            state.dropped += 1;
        }
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Take the newest frame, waiting up to `timeout` for one to arrive.
    ///
    /// `Ok(None)` means the wait timed out. A frame published before the slot
    /// was closed is still delivered before the close reason.
    pub fn take(&self, timeout: Duration) -> Result<Option<Frame>, SlotClosed> {
        let state = self.lock();
        let (mut state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |s| s.latest.is_none() && s.closed.is_none())
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(frame) = state.latest.take() {
            return Ok(Some(frame));
        }
        match &state.closed {
            Some(reason) => Err(reason.clone()),
            None => Ok(None),
        }
    }

    /// Mark the slot closed; the first close reason wins.
    pub fn close(&self, reason: SlotClosed) {
        let mut state = self.lock();
        if state.closed.is_none() {
            state.closed = Some(reason);
        }
        drop(state);
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// Frames overwritten before the consumer took them.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run `source` on a dedicated OS thread, publishing every frame to `slot`.
///
/// The thread exits when `stop` is set (checked per frame) or the slot is
/// closed; a source error closes the slot with [`SlotClosed::Failed`].
pub fn spawn_capture(
    mut source: Box<dyn FrameSource>,
    slot: Arc<FrameSlot>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("facewatch-capture".into())
        .spawn(move || {
            let name = source.describe();
            tracing::info!(source = %name, "capture thread started");

            let result = source.run(&mut |frame: Frame| {
                if stop.load(Ordering::Relaxed) || !slot.publish(frame) {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            });

            match result {
                Ok(()) => {
                    tracing::info!(source = %name, dropped = slot.dropped(), "capture thread stopping");
                    slot.close(SlotClosed::Stopped);
                }
                Err(e) => {
                    tracing::error!(source = %name, error = %e, "capture lost");
                    slot.close(SlotClosed::Failed(e.to_string()));
                }
            }
        })
        .expect("failed to spawn capture thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::CaptureError;
    use image::RgbImage;
    use std::time::Instant;

    fn frame(seq: u64) -> Frame {
        Frame::new(RgbImage::new(2, 2), seq)
    }

    #[test]
    fn test_latest_frame_overwrites() {
        let slot = FrameSlot::new();
        slot.publish(frame(1));
        slot.publish(frame(2));
        slot.publish(frame(3));
        let got = slot.take(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(got.sequence, 3);
        assert_eq!(slot.dropped(), 2);
        assert!(slot.take(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn test_take_times_out_without_frames() {
        let slot = FrameSlot::new();
        let start = Instant::now();
        assert!(slot.take(Duration::from_millis(30)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_pending_frame_delivered_before_close() {
        let slot = FrameSlot::new();
        slot.publish(frame(7));
        slot.close(SlotClosed::Failed("unplugged".into()));
        assert!(!slot.publish(frame(8)));
        assert_eq!(slot.take(Duration::ZERO).unwrap().unwrap().sequence, 7);
        assert_eq!(
            slot.take(Duration::ZERO).unwrap_err(),
            SlotClosed::Failed("unplugged".into())
        );
    }

    #[test]
    fn test_close_wakes_waiting_consumer() {
        let slot = Arc::new(FrameSlot::new());
        let waiter = {
            let slot = slot.clone();
            std::thread::spawn(move || slot.take(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        slot.close(SlotClosed::Stopped);
        assert_eq!(waiter.join().unwrap().unwrap_err(), SlotClosed::Stopped);
    }

    struct Scripted {
        frames: u64,
        fail: bool,
    }

    impl FrameSource for Scripted {
        fn describe(&self) -> String {
            "scripted".into()
        }

        fn run(
            &mut self,
            on_frame: &mut dyn FnMut(Frame) -> ControlFlow<()>,
        ) -> Result<(), CaptureError> {
            for seq in 1..=self.frames {
                if on_frame(frame(seq)).is_break() {
                    return Ok(());
                }
            }
            if self.fail {
                Err(CaptureError::CaptureFailed("unplugged".into()))
            } else {
                Err(CaptureError::EndOfStream)
            }
        }
    }

    #[test]
    fn test_capture_thread_closes_slot_on_source_loss() {
        let slot = Arc::new(FrameSlot::new());
        let stop = Arc::new(AtomicBool::new(false));
        spawn_capture(Box::new(Scripted { frames: 3, fail: true }), slot.clone(), stop)
            .join()
            .unwrap();

        assert_eq!(slot.take(Duration::ZERO).unwrap().unwrap().sequence, 3);
        let err = slot.take(Duration::ZERO).unwrap_err();
        assert!(matches!(err, SlotClosed::Failed(msg) if msg.contains("unplugged")));
    }

    #[test]
    fn test_capture_thread_honours_stop_flag() {
        let slot = Arc::new(FrameSlot::new());
        let stop = Arc::new(AtomicBool::new(true));
        spawn_capture(Box::new(Scripted { frames: 100, fail: false }), slot.clone(), stop)
            .join()
            .unwrap();
        assert!(slot.is_closed());
        assert_eq!(slot.take(Duration::ZERO).unwrap_err(), SlotClosed::Stopped);
    }
}
