mod opencv_flow;
mod opencv_source;

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use pitch_vision::{AttackDirection, FrameResult, JsonLinesDetector, PipelineConfig, SessionRegistry};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::opencv_flow::OpenCvFlow;
use crate::opencv_source::VideoFileSource;

#[derive(Parser)]
#[command(
    name = "match_tester",
    version,
    about = "Runs the pitch_vision engine over a match video and prints one result per frame",
    long_about = None
)]
struct Cli {
    /// Input video path
    input: PathBuf,

    /// Recorded detections: one JSON array of [x1, y1, x2, y2, cls, conf] rows per frame
    detections: PathBuf,

    /// Side of the frame team 1 attacks in the first half
    #[arg(long, default_value = "right")]
    direction: AttackDirection,

    /// YAML pipeline configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run detection every N frames (overrides the config file)
    #[arg(long)]
    detect_every: Option<u64>,

    /// Toggle halftime right after this frame, so the next one is the first affected; repeatable
    #[arg(long = "halftime-at")]
    halftime_at: Vec<u64>,

    /// Emit Server-Sent Events frames instead of JSON lines
    #[arg(long)]
    sse: bool,

    /// Follow a lost ball with OpenCV's optical flow instead of the built-in one
    #[arg(long)]
    opencv_flow: bool,

    /// Output path (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(every) = cli.detect_every {
        config.detect_every = every;
        config.validate()?;
    }

    let detector = JsonLinesDetector::load(&cli.detections)
        .with_context(|| format!("reading detections from {}", cli.detections.display()))?;
    info!(frames = detector.len(), "recorded detections loaded");

    let source = VideoFileSource::open(&cli.input)?;
    let mut registry = SessionRegistry::new();
    let (session, processor) = registry.create_session(source, detector, cli.direction, config)?;
    let processor = if cli.opencv_flow {
        processor.with_point_flow(Box::new(OpenCvFlow::default()))
    } else {
        processor
    };

    // The engine pulls frames on a blocking thread; a one-slot channel keeps it
    // at most one frame ahead of the writer. Halftime is queued on that thread
    // too, so it lands on the frame right after the scheduled one.
    let control = processor.control_handle();
    let mut halftime_at: BTreeSet<u64> = cli.halftime_at.iter().copied().collect();
    let (tx, mut rx) = mpsc::channel::<FrameResult>(1);
    let worker = tokio::task::spawn_blocking(move || {
        for result in processor {
            let frame_id = result.frame_id;
            if tx.blocking_send(result).is_err() {
                break;
            }
            if halftime_at.remove(&frame_id) && !control.toggle_halftime() {
                warn!(frame = frame_id, "could not toggle halftime");
            }
        }
    });

    let mut out: Box<dyn Write> = match &cli.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => Box::new(io::stdout().lock()),
    };

    let (mut frames, mut events) = (0u64, 0u64);
    while let Some(result) = rx.recv().await {
        frames += 1;
        if let Some(text) = &result.event_text {
            events += 1;
            info!(frame = result.frame_id, event = ?result.event, %text, "match event");
        }

        let message = if cli.sse {
            result.to_sse()?
        } else {
            format!("{}\n", result.to_json()?)
        };
        out.write_all(message.as_bytes())?;
    }
    out.flush()?;

    worker.await.context("processing thread panicked")?;
    registry.close(session);
    info!(frames, events, "processing complete");
    Ok(())
}
