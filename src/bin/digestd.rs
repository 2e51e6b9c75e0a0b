//! digestd - webhook-driven detection digest service
//!
//! This daemon:
//! 1. Loads batch settings from a JSON file and the environment
//! 2. Accepts streaming-server webhooks on `/webhook`
//! 3. Batches detections per stream and posts one summary per window
//!
//! Summaries go to Slack when a webhook URL is configured (feature `slack`),
//! otherwise to the log.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use stream_digest::{
    api::WebhookServer, config::DigestConfig, BatchScheduler, BatchSummary, ChannelSink, LogSink,
    SummarySink,
};

#[derive(Parser, Debug)]
#[command(
    name = "digestd",
    about = "Batches AI detection webhooks into periodic per-stream summaries"
)]
struct Args {
    /// JSON config file (falls back to ./config.json when present)
    #[arg(long, env = "DIGEST_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding config and PORT
    #[arg(long)]
    listen: Option<String>,

    /// Log summaries instead of posting them, even when Slack is configured
    #[arg(long)]
    log_only: bool,
}

fn init_logging() {
    // RUST_LOG wins; LOG_LEVEL is the container-friendly fallback.
    let fallback = std::env::var("LOG_LEVEL")
        .map(|level| level.trim().to_lowercase())
        .ok()
        .filter(|level| !level.is_empty())
        .unwrap_or_else(|| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(fallback)).init();
}

fn delivery_sink(config: &DigestConfig, log_only: bool) -> Box<dyn SummarySink> {
    match (&config.slack_webhook_url, log_only) {
        (Some(url), false) => slack_sink(url),
        (Some(_), true) => {
            log::info!("--log-only set; slack delivery disabled");
            Box::new(LogSink)
        }
        (None, _) => {
            log::warn!("no slack webhook configured; summaries go to the log");
            Box::new(LogSink)
        }
    }
}

#[cfg(feature = "slack")]
fn slack_sink(url: &str) -> Box<dyn SummarySink> {
    log::info!("delivering summaries to slack");
    Box::new(stream_digest::SlackSink::new(url))
}

#[cfg(not(feature = "slack"))]
fn slack_sink(_url: &str) -> Box<dyn SummarySink> {
    log::warn!("slack webhook configured but built without the `slack` feature; using the log");
    Box::new(LogSink)
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let mut config = DigestConfig::load_from(args.config.clone())?;
    if let Some(addr) = args.listen.clone() {
        config.listen_addr = addr;
    }
    log::info!(
        "digestd starting: window={:.1}s max_batch_size={} track_expiry={} iou_threshold={}",
        config.batch.window.as_secs_f64(),
        config.batch.max_batch_size,
        config.batch.track_expiry,
        config.batch.iou_threshold
    );

    let (summary_tx, summary_rx) = mpsc::channel::<BatchSummary>();
    let sink = delivery_sink(&config, args.log_only);
    let delivery = std::thread::Builder::new()
        .name("digest-delivery".to_string())
        .spawn(move || {
            for summary in summary_rx {
                let key = summary.stream_key.clone();
                if let Err(err) = sink.on_batch_flushed(summary) {
                    log::error!("delivery for {} failed: {}", key, err);
                }
            }
            log::debug!("delivery channel closed");
        })
        .map_err(|e| anyhow!("failed to spawn delivery thread: {}", e))?;

    let scheduler = Arc::new(BatchScheduler::new(
        config.batch.clone(),
        Arc::new(ChannelSink::new(summary_tx)),
    ));
    let listener = WebhookServer::new(config.listen_addr.clone(), scheduler.clone()).spawn()?;
    log::info!("digestd listening on {}", listener.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("digestd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping listener...");
    listener.stop()?;

    let flushed = scheduler.shutdown()?;
    log::info!("flushed {} pending window(s)", flushed);

    // Dropping the last scheduler handle drops the channel sender, which
    // ends the delivery loop once queued summaries are sent.
    drop(scheduler);
    if delivery.join().is_err() {
        log::error!("delivery thread panicked");
    }
    log::info!("digestd stopped");
    Ok(())
}
