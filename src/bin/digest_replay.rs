//! digest_replay - batch recorded webhook bodies offline
//!
//! Reads one webhook JSON body per line (from a file or stdin), feeds the
//! detections through the batch scheduler and prints every resulting
//! summary as a JSON line on stdout.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use stream_digest::transport::parse_webhook;
use stream_digest::{config::DigestConfig, now_epoch_ms, BatchScheduler, CollectingSink};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Newline-delimited webhook bodies; reads stdin when omitted.
    #[arg(long)]
    input: Option<PathBuf>,
    /// JSON config file supplying batch settings.
    #[arg(long, env = "DIGEST_CONFIG")]
    config: Option<PathBuf>,
    /// Override the maximum detections per window.
    #[arg(long)]
    max_batch_size: Option<usize>,
    /// Override the IoU threshold used for track matching.
    #[arg(long)]
    iou_threshold: Option<f64>,
    /// Print the human-readable line instead of JSON.
    #[arg(long)]
    text: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let mut batch = DigestConfig::load_from(args.config.clone())?.batch;
    if let Some(size) = args.max_batch_size.filter(|size| *size > 0) {
        batch.max_batch_size = size;
    }
    if let Some(threshold) = args.iou_threshold.filter(|t| (0.0..=1.0).contains(t)) {
        batch.iou_threshold = threshold;
    }
    // Replay is not paced in real time; only the size guard and the final
    // drain close windows.
    batch.window = Duration::from_secs(24 * 60 * 60);

    let sink = Arc::new(CollectingSink::new());
    let scheduler = BatchScheduler::new(batch, sink.clone());

    let reader: Box<dyn BufRead> = match &args.input {
        Some(path) => Box::new(BufReader::new(
            std::fs::File::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(std::io::stdin())),
    };

    let mut submitted = 0u64;
    for (idx, line) in reader.lines().enumerate() {
        let line = line.context("failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed = match parse_webhook(line.as_bytes(), now_epoch_ms()) {
            Ok(parsed) => parsed,
            Err(err) => {
                log::warn!("line {}: {}", idx + 1, err);
                continue;
            }
        };
        for detection in parsed.detections {
            scheduler.submit(detection)?;
            submitted += 1;
        }
    }
    scheduler.shutdown()?;
    log::info!("replayed {} detection(s)", submitted);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for summary in sink.take() {
        if args.text {
            writeln!(out, "{}", summary)?;
        } else {
            writeln!(out, "{}", serde_json::to_string(&summary)?)?;
        }
    }
    Ok(())
}
