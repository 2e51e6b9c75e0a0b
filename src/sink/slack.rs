//! Slack incoming-webhook delivery.

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::time::Duration;

use super::SummarySink;
use crate::BatchSummary;

/// Posts summaries to a Slack incoming webhook.
///
/// Block Kit is tried first; if Slack rejects it (older workspaces, legacy
/// webhooks) the same summary is re-sent as plain text.
pub struct SlackSink {
    webhook_url: String,
    agent: ureq::Agent,
}

impl SlackSink {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(10))
            .build();
        Self {
            webhook_url: webhook_url.into(),
            agent,
        }
    }

    fn post(&self, body: &Value) -> Result<()> {
        match self.agent.post(&self.webhook_url).send_json(body.clone()) {
            Ok(resp) if resp.status() == 200 => Ok(()),
            Ok(resp) => Err(anyhow!("slack returned status {}", resp.status())),
            Err(ureq::Error::Status(code, resp)) => Err(anyhow!(
                "slack returned status {}: {}",
                code,
                resp.into_string().unwrap_or_default()
            )),
            Err(e) => Err(anyhow!("slack request failed: {}", e)),
        }
    }
}

fn summary_blocks(summary: &BatchSummary) -> Value {
    let mut details = vec![
        format!("*Stream:* `{}`", summary.stream_key.stream),
        format!("*App:* `{}`", summary.stream_key.app),
        format!("*VHost:* `{}`", summary.stream_key.vhost),
        format!(
            "*Detections:* {} over {:.1}s ({:.2}/s)",
            summary.total_detections,
            summary.duration_secs(),
            summary.detections_per_second
        ),
        format!(
            "*Unique objects:* {} (peak {} in view)",
            summary.unique_track_count, summary.peak_occupancy
        ),
    ];
    details.extend(summary.class_lines().into_iter().map(|l| format!("• {}", l)));
    if summary.skipped_detections > 0 {
        details.push(format!(
            "*Malformed skipped:* {}",
            summary.skipped_detections
        ));
    }
    json!([
        { "type": "section", "text": { "type": "mrkdwn", "text": format!(":mag: *{}*", summary.title()) } },
        { "type": "section", "text": { "type": "mrkdwn", "text": details.join("\n") } },
    ])
}

impl SummarySink for SlackSink {
    fn on_batch_flushed(&self, summary: BatchSummary) -> Result<()> {
        let text = summary.to_string();
        let with_blocks = json!({ "text": text, "blocks": summary_blocks(&summary) });
        match self.post(&with_blocks) {
            Ok(()) => {
                log::info!("slack blocks message sent for {}", summary.stream_key);
                return Ok(());
            }
            Err(e) => {
                log::warn!("slack blocks send failed ({}); falling back to plain text", e);
            }
        }
        self.post(&json!({ "text": text }))?;
        log::info!("slack plain text message sent for {}", summary.stream_key);
        Ok(())
    }
}
