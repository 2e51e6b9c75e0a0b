//! Inbound payload parsing.
//!
//! Streaming servers announce stream lifecycle and AI detection events as
//! webhook JSON. This module maps those bodies onto `Detection`s.

pub mod webhook;

pub use webhook::{
    is_detection_event, parse_bbox, parse_timestamp_ms, parse_webhook, ParsedWebhook,
    WebhookContext, WebhookData, WebhookPayload,
};
