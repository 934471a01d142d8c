use anyhow::{Context, Result};
use facewatch_core::events;
use facewatch_core::onnx;
use facewatch_core::{
    AcceleratorSession, EmbeddingExtractor, Gallery, QueuedSink, ScrfdLocalizer, Settings,
    SharedSession,
};
use facewatch_hw::{spawn_capture, FrameSlot, SlotClosed};
use pipeline::{GalleryHandle, LivePipeline, PipelineError, PipelineOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod annotate;
mod pipeline;
mod stream;

/// How long shutdown waits for the consumer to finish its current frame.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("FACEWATCH_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::var_os("FACEWATCH_CONFIG").map(PathBuf::from);
    let settings = Settings::load(config_path.as_deref()).context("loading configuration")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        camera = %settings.camera.id,
        "facewatchd starting"
    );

    let devices = onnx::enumerate_devices(
        settings.accelerator.device,
        settings.accelerator.intra_threads,
    );
    let mut session = AcceleratorSession::open(devices).context("opening accelerator")?;
    session
        .load_graph_file(&settings.accelerator.graph)
        .with_context(|| format!("loading graph {}", settings.accelerator.graph.display()))?;
    let session = SharedSession::new(session, settings.slow_infer());
    let extractor = EmbeddingExtractor::new(session.clone(), settings.extractor_options());

    let localizer = ScrfdLocalizer::load(&settings.detector.model, settings.detector.confidence)
        .with_context(|| format!("loading detector {}", settings.detector.model.display()))?;

    let gallery = Gallery::build(&settings.gallery.dir, &extractor, settings.gallery.threshold)
        .context("building gallery")?;
    let gallery = GalleryHandle::new(gallery);

    let sink = QueuedSink::spawn(
        events::build_sink(settings.events.webhook.as_deref(), settings.event_timeout()),
        events::DEFAULT_QUEUE_CAPACITY,
    );

    let source = facewatch_hw::open_source(
        &settings.camera.source,
        settings.camera.width,
        settings.camera.height,
    )
    .with_context(|| format!("opening camera source {}", settings.camera.source))?;

    let listener = TcpListener::bind(&settings.stream.bind)
        .await
        .with_context(|| format!("binding stream on {}", settings.stream.bind))?;

    let slot = Arc::new(FrameSlot::new());
    let stop = Arc::new(AtomicBool::new(false));
    let (frames_tx, frames_rx) = watch::channel(None);

    spawn_capture(source, slot.clone(), stop.clone());

    let pipeline = LivePipeline::new(
        Box::new(localizer),
        extractor.clone(),
        gallery.clone(),
        Arc::new(sink),
        PipelineOptions {
            camera_id: settings.camera.id.clone(),
            margin: settings.camera.margin,
            mirror: settings.camera.mirror,
            jpeg_quality: settings.stream.jpeg_quality,
        },
    );
    let mut done = pipeline::spawn_pipeline(pipeline, slot.clone(), frames_tx, stop.clone());
    let server = tokio::spawn(stream::serve(listener, frames_rx));

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;

    tracing::info!("facewatchd ready");

    let exit = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                break None;
            }
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received");
                break None;
            }
            _ = sighup.recv() => {
                reload_gallery(&settings, &extractor, &gallery).await;
            }
            result = &mut done => {
                break Some(result.unwrap_or(Err(PipelineError::ThreadGone)));
            }
        }
    };

    tracing::info!("facewatchd shutting down");
    stop.store(true, Ordering::Relaxed);
    slot.close(SlotClosed::Stopped);
    // Waits for any in-flight inference; the consumer then sees SessionClosed.
    let closing = session.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || closing.close()).await {
        tracing::warn!(error = %e, "accelerator close task failed");
    }

    let exit = match exit {
        Some(result) => result,
        None => match tokio::time::timeout(SHUTDOWN_GRACE, done).await {
            Ok(result) => result.unwrap_or(Err(PipelineError::ThreadGone)),
            Err(_) => {
                tracing::warn!("pipeline did not stop in time");
                Ok(())
            }
        },
    };
    server.abort();

    exit.context("live pipeline failed")?;
    tracing::info!("facewatchd stopped");
    Ok(())
}

/// Rebuild the gallery from disk and swap it in. On failure the current
/// gallery stays active.
async fn reload_gallery(settings: &Settings, extractor: &EmbeddingExtractor, gallery: &GalleryHandle) {
    tracing::info!(dir = %settings.gallery.dir.display(), "SIGHUP: reloading gallery");
    let dir = settings.gallery.dir.clone();
    let threshold = settings.gallery.threshold;
    let extractor = extractor.clone();

    let rebuilt = tokio::task::spawn_blocking(move || Gallery::build(&dir, &extractor, threshold)).await;
    match rebuilt {
        Ok(Ok(fresh)) => {
            tracing::info!(entries = fresh.len(), "gallery reloaded");
            gallery.replace(fresh);
        }
        Ok(Err(e)) => tracing::warn!(error = %e, "gallery reload failed; keeping current gallery"),
        Err(e) => tracing::warn!(error = %e, "gallery reload task panicked"),
    }
}
