//! MJPEG streaming surface.
//!
//! `GET <anything>.mjpg` streams annotated frames as
//! `multipart/x-mixed-replace`; `GET <anything>.html` returns a page that
//! embeds that stream. Each connection is its own task reading the newest
//! frame from the `watch` channel, so a slow viewer only skips frames.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::Router;
use futures::Stream;
use std::convert::Infallible;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub const BOUNDARY: &str = "jpgboundary";
const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=jpgboundary";

#[derive(Clone)]
struct StreamState {
    frames: watch::Receiver<Option<Bytes>>,
}

pub fn router(frames: watch::Receiver<Option<Bytes>>) -> Router {
    Router::new()
        .fallback(handle)
        .with_state(StreamState { frames })
}

/// Serve the stream on an already-bound listener until the task is dropped.
pub async fn serve(
    listener: TcpListener,
    frames: watch::Receiver<Option<Bytes>>,
) -> std::io::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "stream listening");
    axum::serve(listener, router(frames)).await
}

async fn handle(State(state): State<StreamState>, method: Method, uri: Uri) -> Response {
    if method != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let path = uri.path();
    if path.ends_with(".mjpg") {
        tracing::debug!(path, "stream viewer connected");
        (
            [
                (header::CONTENT_TYPE, MJPEG_CONTENT_TYPE),
                (header::CACHE_CONTROL, "no-cache, private"),
            ],
            Body::from_stream(parts(state.frames.clone())),
        )
            .into_response()
    } else if path.ends_with(".html") {
        Html(html_page(path)).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

/// One multipart part per new frame, starting with the current one. Ends
/// when the pipeline drops its sender.
fn parts(
    mut frames: watch::Receiver<Option<Bytes>>,
) -> impl Stream<Item = Result<Bytes, Infallible>> {
    frames.mark_changed();
    futures::stream::unfold(frames, |mut frames| async move {
        loop {
            frames.changed().await.ok()?;
            let latest = frames.borrow_and_update().clone();
            if let Some(jpeg) = latest {
                return Some((Ok(encode_part(&jpeg)), frames));
            }
        }
    })
}

pub fn encode_part(jpeg: &[u8]) -> Bytes {
    let mut part = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    )
    .into_bytes();
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

/// Page embedding the `.mjpg` sibling of `path`.
pub fn html_page(path: &str) -> String {
    let stem = path.strip_suffix(".html").unwrap_or(path);
    format!("<html><head></head><body><img src=\"{stem}.mjpg\"/></body></html>")
}
