//! Streaming-server webhook parsing.
//!
//! Turns a webhook JSON body into the stream key it refers to and the
//! detections it carries. Lifecycle events (stream, recording, connection)
//! parse fine but carry no detections.

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::{BoundingBox, BoxFormat, Detection, StreamKey};

const MISSING: &str = "N/A";

/// Epoch values above this are milliseconds, below it seconds.
const MILLIS_CUTOFF: f64 = 1e12;

const NAIVE_ISO_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Top-level webhook body.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    /// Event name, e.g. "stream.started" or "ai.detection"
    pub name: Option<String>,

    /// Older servers send the name here instead
    #[serde(rename = "eventType")]
    pub event_type: Option<String>,

    /// Servers may send an explicit `null` here
    pub context: Option<WebhookContext>,

    pub data: Option<WebhookData>,

    pub timestamp: Option<Value>,
    pub time: Option<Value>,
    #[serde(rename = "eventTime")]
    pub event_time: Option<Value>,
}

/// Where the event happened.
#[derive(Debug, Deserialize, Default)]
pub struct WebhookContext {
    pub app: Option<String>,
    pub stream: Option<String>,
    pub name: Option<String>,
    pub vhost: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct WebhookData {
    /// Kept as raw values so one bad entry does not reject the whole body
    #[serde(default)]
    pub detections: Vec<Value>,

    pub stream: Option<String>,
}

/// Parsed webhook ready for the batch scheduler.
#[derive(Debug, Clone)]
pub struct ParsedWebhook {
    pub event_name: String,
    pub stream_key: StreamKey,
    pub detections: Vec<Detection>,
}

impl ParsedWebhook {
    pub fn is_detection_event(&self) -> bool {
        is_detection_event(&self.event_name)
    }
}

pub fn is_detection_event(event_name: &str) -> bool {
    event_name.contains("detection")
}

/// Parses a webhook body. `received_ms` stands in for missing timestamps.
///
/// Returns an error only for bodies that are not a JSON object. Individual
/// detections with missing fields are still returned (as malformed
/// detections) so they are counted downstream.
pub fn parse_webhook(payload: &[u8], received_ms: u64) -> Result<ParsedWebhook> {
    if payload.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(anyhow!("empty payload"));
    }
    let body: WebhookPayload =
        serde_json::from_slice(payload).map_err(|e| anyhow!("parse error: {}", e))?;

    let context = body.context.unwrap_or_default();
    let data = body.data.unwrap_or_default();
    let event_name = body
        .name
        .as_deref()
        .or(body.event_type.as_deref())
        .unwrap_or("unknown")
        .to_lowercase();

    let stream = context
        .stream
        .or(context.name)
        .or(data.stream)
        .unwrap_or_else(|| MISSING.to_string());
    let stream_key = StreamKey::new(
        context.app.unwrap_or_else(|| MISSING.to_string()),
        stream,
        context.vhost.unwrap_or_else(|| MISSING.to_string()),
    );

    let event_ms = [&body.timestamp, &body.time, &body.event_time]
        .into_iter()
        .flatten()
        .find_map(parse_timestamp_ms)
        .unwrap_or(received_ms);

    let detections = if is_detection_event(&event_name) {
        data.detections
            .iter()
            .map(|item| parse_detection(item, &stream_key, event_ms))
            .collect()
    } else {
        Vec::new()
    };

    Ok(ParsedWebhook {
        event_name,
        stream_key,
        detections,
    })
}

fn parse_detection(item: &Value, stream_key: &StreamKey, event_ms: u64) -> Detection {
    let class = item
        .get("class")
        .or_else(|| item.get("label"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let bbox = item
        .get("bbox")
        .or_else(|| item.get("box"))
        .and_then(parse_bbox)
        .map(BoxFormat::normalize)
        .unwrap_or(BoundingBox::from_corners(0.0, 0.0, 0.0, 0.0));
    let confidence = item
        .get("confidence")
        .or_else(|| item.get("score"))
        .and_then(Value::as_f64)
        .unwrap_or(f64::NAN);
    let frame_ts_ms = item
        .get("frameTimestamp")
        .and_then(parse_timestamp_ms)
        .unwrap_or(event_ms);

    Detection::new(stream_key.clone(), class, bbox, confidence, frame_ts_ms)
}

/// Accepts `[x1, y1, x2, y2]`, `{x1, y1, x2, y2}` or `{x, y, width, height}`.
pub fn parse_bbox(value: &Value) -> Option<BoxFormat> {
    let num = |v: &Value, key: &str| v.get(key).and_then(Value::as_f64);
    match value {
        Value::Array(items) if items.len() == 4 => {
            let mut coords = [0.0; 4];
            for (slot, item) in coords.iter_mut().zip(items) {
                *slot = item.as_f64()?;
            }
            Some(BoxFormat::Corners(coords))
        }
        Value::Object(_) => {
            if let (Some(x1), Some(y1), Some(x2), Some(y2)) =
                (num(value, "x1"), num(value, "y1"), num(value, "x2"), num(value, "y2"))
            {
                return Some(BoxFormat::Corners([x1, y1, x2, y2]));
            }
            let (x, y) = (num(value, "x")?, num(value, "y")?);
            let w = num(value, "width").or_else(|| num(value, "w"))?;
            let h = num(value, "height").or_else(|| num(value, "h"))?;
            Some(BoxFormat::OriginSize([x, y, w, h]))
        }
        _ => None,
    }
}

/// Epoch seconds or milliseconds (as a number or a numeric string), or an
/// ISO-8601 string. ISO values without an offset are taken as UTC.
pub fn parse_timestamp_ms(value: &Value) -> Option<u64> {
    let raw = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(raw) => raw,
            Err(_) => return parse_iso_ms(s.trim()),
        },
        _ => return None,
    };
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    let ms = if raw > MILLIS_CUTOFF { raw } else { raw * 1000.0 };
    Some(ms.round() as u64)
}

fn parse_iso_ms(raw: &str) -> Option<u64> {
    let utc = match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => dt.with_timezone(&Utc),
        Err(_) => NAIVE_ISO_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .or_else(|| {
                NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            })?
            .and_utc(),
    };
    u64::try_from(utc.timestamp_millis()).ok()
}
