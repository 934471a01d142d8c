//! HTTP MJPEG camera source (IP cameras, `mjpg-streamer`, another facewatchd).

use crate::frame::{self, Frame};
use crate::source::{CaptureError, FrameSource};
use std::io::Read;
use std::ops::ControlFlow;
use std::time::Duration;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// A single JPEG larger than this is treated as garbage and discarded.
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Splits a byte stream into complete JPEG images by their start/end markers,
/// ignoring any multipart framing in between.
#[derive(Default)]
pub struct JpegScanner {
    buf: Vec<u8>,
}

impl JpegScanner {
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete JPEG in the buffered data, if one has fully arrived.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let Some(start) = find(&self.buf, &SOI) else {
            // Keep a trailing 0xFF: it may be the first half of a marker.
            let keep = usize::from(self.buf.last() == Some(&0xFF));
            let cut = self.buf.len() - keep;
            self.buf.drain(..cut);
            return None;
        };
        self.buf.drain(..start);

        let found = skip_app_segments(&self.buf)
            .and_then(|body| find(&self.buf[body..], &EOI).map(|eoi| body + eoi));
        let Some(eoi) = found else {
            if self.buf.len() > MAX_FRAME_BYTES {
                tracing::warn!(bytes = self.buf.len(), "no JPEG end marker; discarding buffer");
                self.buf.clear();
            }
            return None;
        };
        let end = eoi + EOI.len();
        Some(self.buf.drain(..end).collect())
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Offset of the first byte after the SOI and the APPn segments that follow
/// it. APPn payloads (EXIF thumbnails) can carry a whole JPEG with its own
/// EOI. `None` while a segment is still arriving.
fn skip_app_segments(buf: &[u8]) -> Option<usize> {
    let mut pos = SOI.len();
    while buf.len() >= pos + 2 && buf[pos] == 0xFF && (0xE0..=0xEF).contains(&buf[pos + 1]) {
        let len_at = pos + 2;
        let len_bytes = buf.get(len_at..len_at + 2)?;
        // The length field counts itself but not the marker.
        pos = len_at + usize::from(u16::from_be_bytes([len_bytes[0], len_bytes[1]])).max(2);
        if pos > buf.len() {
            return None;
        }
    }
    Some(pos)
}

fn find(haystack: &[u8], needle: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == needle)
}

pub struct MjpegSource {
    url: String,
    agent: ureq::Agent,
}

impl MjpegSource {
    /// `stall` bounds both connecting and the wait for the next bytes.
    pub fn new(url: &str, stall: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(stall)
            .timeout_read(stall)
            .build();
        Self {
            url: url.to_string(),
            agent,
        }
    }
}

impl FrameSource for MjpegSource {
    fn describe(&self) -> String {
        format!("mjpeg:{}", self.url)
    }

    fn run(
        &mut self,
        on_frame: &mut dyn FnMut(Frame) -> ControlFlow<()>,
    ) -> Result<(), CaptureError> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .map_err(|e| CaptureError::Http(e.to_string()))?;
        tracing::info!(
            url = %self.url,
            content_type = response.content_type(),
            "connected to MJPEG stream"
        );

        let mut reader = response.into_reader();
        let mut scanner = JpegScanner::default();
        let mut chunk = vec![0u8; 64 * 1024];
        let mut sequence = 0u64;

        loop {
            let n = reader
                .read(&mut chunk)
                .map_err(|e| CaptureError::CaptureFailed(format!("stream read failed: {e}")))?;
            if n == 0 {
                return Err(CaptureError::EndOfStream);
            }
            scanner.push(&chunk[..n]);

            while let Some(jpeg) = scanner.next_frame() {
                let image = match frame::decode_jpeg(&jpeg) {
                    Ok(img) => img,
                    Err(e) => {
                        tracing::warn!(bytes = jpeg.len(), error = %e, "dropping undecodable MJPEG frame");
                        continue;
                    }
                };
                sequence += 1;
                if on_frame(Frame::new(image, sequence)).is_break() {
                    return Ok(());
                }
            }
        }
    }
}
