use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facewatch_core::accelerator::Device;
use facewatch_core::batch::BatchSummary;
use facewatch_core::events;
use facewatch_core::onnx;
use facewatch_core::{
    AcceleratorSession, BatchClassifier, EmbeddingExtractor, EventMode, Gallery, Settings,
    SharedSession,
};
use facewatch_hw::Camera;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "facewatch", version, about = "facewatch face-matching CLI")]
struct Cli {
    /// Configuration file (default: ./facewatch.toml when present)
    #[arg(long, global = true, env = "FACEWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify every image in a test directory against the gallery
    Classify {
        /// Directory of images to classify
        #[arg(long)]
        test_dir: Option<PathBuf>,
        /// Directory of known-identity images
        #[arg(long)]
        gallery_dir: Option<PathBuf>,
        /// Euclidean distance below which two faces match
        #[arg(long)]
        threshold: Option<f32>,
        /// Emit one alert per test image instead of one per comparison
        #[arg(long)]
        verdict_only: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Open the accelerator, load the graph and run one inference
    Probe,
    /// List V4L2 capture devices
    Devices,
    /// Build the gallery and list its identities
    Gallery,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("FACEWATCH_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Classify {
            test_dir,
            gallery_dir,
            threshold,
            verdict_only,
            json,
        } => {
            if let Some(dir) = test_dir {
                settings.batch.test_dir = dir;
            }
            if let Some(dir) = gallery_dir {
                settings.gallery.dir = dir;
            }
            if let Some(t) = threshold {
                settings.gallery.threshold = t;
            }
            if verdict_only {
                settings.batch.events = EventMode::Verdict;
            }
            settings.validate().context("invalid options")?;
            classify(&settings, json)
        }
        Commands::Probe => probe(&settings),
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} (driver: {}, bus: {})", d.path, d.name, d.driver, d.bus);
            }
            Ok(())
        }
        Commands::Gallery => {
            let extractor = open_extractor(&settings)?;
            let gallery = build_gallery(&settings, &extractor)?;
            println!(
                "{} identities in {} (threshold {})",
                gallery.len(),
                settings.gallery.dir.display(),
                gallery.threshold()
            );
            for entry in gallery.entries() {
                println!(
                    "  {:<24} dim={} file={}",
                    entry.label,
                    entry.embedding.values.len(),
                    entry.source.display()
                );
            }
            extractor.session().close();
            Ok(())
        }
    }
}

fn open_extractor(settings: &Settings) -> Result<EmbeddingExtractor> {
    let devices = onnx::enumerate_devices(
        settings.accelerator.device,
        settings.accelerator.intra_threads,
    );
    let mut session = AcceleratorSession::open(devices).context("opening accelerator")?;
    let version = session
        .load_graph_file(&settings.accelerator.graph)
        .with_context(|| format!("loading graph {}", settings.accelerator.graph.display()))?;
    tracing::debug!(device = session.device_name(), %version, "accelerator ready");
    let session = SharedSession::new(session, settings.slow_infer());
    Ok(EmbeddingExtractor::new(session, settings.extractor_options()))
}

fn build_gallery(settings: &Settings, extractor: &EmbeddingExtractor) -> Result<Gallery> {
    Gallery::build(&settings.gallery.dir, extractor, settings.gallery.threshold)
        .with_context(|| format!("building gallery from {}", settings.gallery.dir.display()))
}

fn classify(settings: &Settings, json: bool) -> Result<()> {
    let extractor = open_extractor(settings)?;
    let gallery = build_gallery(settings, &extractor)?;
    let sink = events::build_sink(settings.events.webhook.as_deref(), settings.event_timeout());

    if !json {
        println!("-- FACEWATCH TEST MODE STARTING");
    }
    let summary = BatchClassifier::new(
        &extractor,
        &gallery,
        sink.as_ref(),
        &settings.camera.id,
        settings.batch.events,
    )
    .run(&settings.batch.test_dir)
    .with_context(|| format!("classifying {}", settings.batch.test_dir.display()))?;
    extractor.session().close();

    if json {
        println!("{}", serde_json::to_string_pretty(&report_json(&summary))?);
    } else {
        print_report(&summary);
    }
    Ok(())
}

fn print_report(summary: &BatchSummary) {
    println!("-- STARTED: {}", summary.started.format("%Y-%m-%d %H:%M:%S"));
    println!();
    for outcome in &summary.outcomes {
        let name = outcome.file.display();
        match &outcome.result.identity {
            Some(label) if outcome.result.matched => {
                println!("-- MATCH {name} -> {label} (distance {:.4})", outcome.result.distance)
            }
            _ => println!("-- NO MATCH {name}"),
        }
    }
    println!();
    println!("-- FACEWATCH TEST MODE ENDING");
    println!("-- ENDED: {}", summary.ended.format("%Y-%m-%d %H:%M:%S"));
    println!("-- TESTED: {}", summary.tested);
    println!("-- IDENTIFIED: {}", summary.identified);
    if summary.failed > 0 {
        println!("-- FAILED: {}", summary.failed);
    }
    println!("-- TIME(secs): {:.3}", summary.elapsed.as_secs_f64());
}

fn report_json(summary: &BatchSummary) -> serde_json::Value {
    let results: Vec<serde_json::Value> = summary
        .outcomes
        .iter()
        .map(|o| {
            serde_json::json!({
                "file": o.file.display().to_string(),
                "matched": o.result.matched,
                "identity": o.result.identity,
                "distance": o.result.distance.is_finite().then_some(o.result.distance),
            })
        })
        .collect();
    serde_json::json!({
        "started": summary.started.to_rfc3339(),
        "ended": summary.ended.to_rfc3339(),
        "tested": summary.tested,
        "identified": summary.identified,
        "failed": summary.failed,
        "seconds": summary.elapsed.as_secs_f64(),
        "results": results,
    })
}

fn probe(settings: &Settings) -> Result<()> {
    let devices = onnx::enumerate_devices(
        settings.accelerator.device,
        settings.accelerator.intra_threads,
    );
    println!("Enumerated devices:");
    for d in &devices {
        println!("  {}", d.name());
    }

    let mut session = AcceleratorSession::open(devices).context("opening accelerator")?;
    println!("Opened: {}", session.device_name());

    let version = session
        .load_graph_file(&settings.accelerator.graph)
        .with_context(|| format!("loading graph {}", settings.accelerator.graph.display()))?;
    println!("Graph: {} (version {version})", settings.accelerator.graph.display());

    let extractor = EmbeddingExtractor::new(
        SharedSession::new(session, settings.slow_infer()),
        settings.extractor_options(),
    );
    let size = settings.accelerator.input_size;
    let blank = image::RgbImage::from_pixel(size, size, image::Rgb([128, 128, 128]));
    let started = std::time::Instant::now();
    let embedding = extractor.extract(&blank).context("test inference")?;
    println!(
        "Inference OK: {}-dim embedding in {:.1} ms",
        embedding.values.len(),
        started.elapsed().as_secs_f64() * 1000.0
    );

    extractor.session().close();
    println!("Session: {:?}", extractor.session().state());
    Ok(())
}
