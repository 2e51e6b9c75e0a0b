//! Outbound delivery of flushed batch summaries.
//!
//! The scheduler calls `on_batch_flushed` after the window has left its map
//! and the lock is released, but still on the flushing thread (a producer, the
//! timer thread or the shutdown path). Sinks that do network I/O should sit
//! behind a `ChannelSink` so that thread is never blocked on delivery.

use anyhow::{anyhow, Result};
use std::sync::mpsc::Sender;
use std::sync::Mutex;

use crate::BatchSummary;

#[cfg(feature = "slack")]
mod slack;

#[cfg(feature = "slack")]
pub use slack::SlackSink;

pub trait SummarySink: Send + Sync {
    fn on_batch_flushed(&self, summary: BatchSummary) -> Result<()>;
}

/// Writes each summary to the log at info level.
#[derive(Debug, Default)]
pub struct LogSink;

impl SummarySink for LogSink {
    fn on_batch_flushed(&self, summary: BatchSummary) -> Result<()> {
        log::info!("{}", summary);
        Ok(())
    }
}

/// Keeps every summary in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    summaries: Mutex<Vec<BatchSummary>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summaries(&self) -> Vec<BatchSummary> {
        self.summaries
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.summaries.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take(&self) -> Vec<BatchSummary> {
        self.summaries
            .lock()
            .map(|mut s| std::mem::take(&mut *s))
            .unwrap_or_default()
    }
}

impl SummarySink for CollectingSink {
    fn on_batch_flushed(&self, summary: BatchSummary) -> Result<()> {
        self.summaries
            .lock()
            .map_err(|_| anyhow!("collecting sink lock poisoned"))?
            .push(summary);
        Ok(())
    }
}

/// Forwards summaries to a delivery thread.
pub struct ChannelSink {
    tx: Mutex<Sender<BatchSummary>>,
}

impl ChannelSink {
    pub fn new(tx: Sender<BatchSummary>) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

impl SummarySink for ChannelSink {
    fn on_batch_flushed(&self, summary: BatchSummary) -> Result<()> {
        self.tx
            .lock()
            .map_err(|_| anyhow!("channel sink lock poisoned"))?
            .send(summary)
            .map_err(|_| anyhow!("summary delivery channel closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BatchConfig, BatchWindow, FlushReason, StreamKey};
    use std::sync::mpsc;

    fn empty_summary() -> BatchSummary {
        BatchWindow::new(
            StreamKey::new("live", "lobby", "_defaultVHost_"),
            0,
            &BatchConfig::default(),
        )
        .summarize(1_000, FlushReason::Manual)
    }

    #[test]
    fn collecting_sink_keeps_order() {
        let sink = CollectingSink::new();
        sink.on_batch_flushed(empty_summary()).unwrap();
        sink.on_batch_flushed(empty_summary()).unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.take().len(), 2);
        assert!(sink.is_empty());
    }

    #[test]
    fn channel_sink_reports_closed_receiver() {
        let (tx, rx) = mpsc::channel();
        let sink = ChannelSink::new(tx);
        sink.on_batch_flushed(empty_summary()).unwrap();
        assert_eq!(rx.recv().unwrap().stream_key.stream, "lobby");
        drop(rx);
        let err = sink.on_batch_flushed(empty_summary()).unwrap_err();
        assert!(err.to_string().contains("closed"));
    }
}
