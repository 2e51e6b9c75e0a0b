use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::batch::{
    BatchConfig, DEFAULT_IOU_THRESHOLD, DEFAULT_MAX_BATCH_SIZE, DEFAULT_TRACK_EXPIRY,
    DEFAULT_WINDOW_SECS,
};

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_CONFIG_FILE: &str = "config.json";

#[derive(Debug, Deserialize, Default)]
struct DigestConfigFile {
    batch: Option<BatchConfigFile>,
    listen_addr: Option<String>,
    slack_webhook_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct BatchConfigFile {
    window_seconds: Option<f64>,
    max_batch_size: Option<u64>,
    track_expiry: Option<u32>,
    iou_threshold: Option<f64>,
}

/// Raw engine settings before validation. Env values stay strings so a bad
/// one can fall back instead of failing the load.
#[derive(Debug, Default)]
struct BatchDraft {
    window_seconds: Option<String>,
    max_batch_size: Option<String>,
    track_expiry: Option<String>,
    iou_threshold: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DigestConfig {
    pub batch: BatchConfig,
    pub listen_addr: String,
    pub slack_webhook_url: Option<String>,
    /// File the settings were read from, if any.
    pub source: Option<PathBuf>,
}

impl DigestConfig {
    /// Loads `DIGEST_CONFIG` (or `./config.json` when present), then applies
    /// environment overrides. Bad engine values fall back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(env_value("DIGEST_CONFIG").map(PathBuf::from))
    }

    /// Like `load`, but with an explicit config file. `None` still picks up
    /// `./config.json` when present.
    pub fn load_from(path: Option<PathBuf>) -> Result<Self> {
        let path = path.or_else(|| {
            let local = PathBuf::from(DEFAULT_CONFIG_FILE);
            local.exists().then_some(local)
        });
        let file_cfg = match path.as_deref() {
            Some(path) => {
                let cfg = read_config_file(path)?;
                log::info!("loaded config from {}", path.display());
                cfg
            }
            None => DigestConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg, path);
        cfg.apply_env();
        Ok(cfg)
    }

    fn from_file(file: DigestConfigFile, source: Option<PathBuf>) -> Self {
        let batch = file.batch.unwrap_or_default();
        let draft = BatchDraft {
            window_seconds: batch.window_seconds.map(|v| v.to_string()),
            max_batch_size: batch.max_batch_size.map(|v| v.to_string()),
            track_expiry: batch.track_expiry.map(|v| v.to_string()),
            iou_threshold: batch.iou_threshold.map(|v| v.to_string()),
        };
        Self {
            batch: draft.resolve(),
            listen_addr: file
                .listen_addr
                .filter(|addr| !addr.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
            slack_webhook_url: file.slack_webhook_url.filter(|url| !url.trim().is_empty()),
            source,
        }
    }

    fn apply_env(&mut self) {
        let draft = BatchDraft {
            window_seconds: env_value("BATCH_WINDOW_SECONDS"),
            max_batch_size: env_value("MAX_BATCH_SIZE"),
            track_expiry: env_value("TRACK_EXPIRY"),
            iou_threshold: env_value("IOU_THRESHOLD"),
        };
        self.batch = draft.overlay(self.batch.clone());

        if let Some(addr) = env_value("DIGEST_LISTEN_ADDR") {
            self.listen_addr = addr;
        } else if let Some(port) = env_value("PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.listen_addr = format!("0.0.0.0:{}", port),
                Err(_) => log::warn!("PORT '{}' is not a valid port; keeping {}", port, self.listen_addr),
            }
        }
        // The config file wins for the webhook URL; env only fills a gap.
        if self.slack_webhook_url.is_none() {
            self.slack_webhook_url = env_value("SLACK_WEBHOOK_URL");
        }
    }
}

impl BatchDraft {
    fn resolve(self) -> BatchConfig {
        self.overlay(BatchConfig::default())
    }

    /// Replaces fields of `base` with every value present in the draft,
    /// falling back to the built-in default when a value is invalid.
    fn overlay(self, mut base: BatchConfig) -> BatchConfig {
        if let Some(raw) = self.window_seconds {
            base.window = Duration::from_secs_f64(parse_window_secs("BATCH_WINDOW_SECONDS", &raw));
        }
        if let Some(raw) = self.max_batch_size {
            base.max_batch_size = parse_max_batch_size("MAX_BATCH_SIZE", &raw);
        }
        if let Some(raw) = self.track_expiry {
            base.track_expiry = parse_or_default("TRACK_EXPIRY", &raw, DEFAULT_TRACK_EXPIRY);
        }
        if let Some(raw) = self.iou_threshold {
            base.iou_threshold = parse_iou_threshold("IOU_THRESHOLD", &raw);
        }
        base
    }
}

fn parse_window_secs(name: &str, raw: &str) -> f64 {
    match raw.trim().parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs > 0.0 => secs,
        _ => {
            log::warn!(
                "{} '{}' must be a positive number; using {}",
                name,
                raw,
                DEFAULT_WINDOW_SECS
            );
            DEFAULT_WINDOW_SECS
        }
    }
}

fn parse_max_batch_size(name: &str, raw: &str) -> usize {
    match raw.trim().parse::<usize>() {
        Ok(size) if size > 0 => size,
        _ => {
            log::warn!(
                "{} '{}' must be a positive integer; using {}",
                name,
                raw,
                DEFAULT_MAX_BATCH_SIZE
            );
            DEFAULT_MAX_BATCH_SIZE
        }
    }
}

fn parse_iou_threshold(name: &str, raw: &str) -> f64 {
    match raw.trim().parse::<f64>() {
        Ok(t) if (0.0..=1.0).contains(&t) => t,
        _ => {
            log::warn!(
                "{} '{}' must be within [0, 1]; using {}",
                name,
                raw,
                DEFAULT_IOU_THRESHOLD
            );
            DEFAULT_IOU_THRESHOLD
        }
    }
}

fn parse_or_default<T: std::str::FromStr + std::fmt::Display>(name: &str, raw: &str, default: T) -> T {
    raw.trim().parse().unwrap_or_else(|_| {
        log::warn!("{} '{}' is not valid; using {}", name, raw, default);
        default
    })
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn read_config_file(path: &Path) -> Result<DigestConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    // Editors on Windows may prepend a UTF-8 BOM.
    let raw = raw.trim_start_matches('\u{feff}');
    let cfg = serde_json::from_str(raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_must_be_positive_and_finite() {
        assert_eq!(parse_window_secs("W", "2.5"), 2.5);
        assert_eq!(parse_window_secs("W", "0"), DEFAULT_WINDOW_SECS);
        assert_eq!(parse_window_secs("W", "-4"), DEFAULT_WINDOW_SECS);
        assert_eq!(parse_window_secs("W", "inf"), DEFAULT_WINDOW_SECS);
        assert_eq!(parse_window_secs("W", "soon"), DEFAULT_WINDOW_SECS);
    }

    #[test]
    fn iou_threshold_must_be_unit_interval() {
        assert_eq!(parse_iou_threshold("T", "0.5"), 0.5);
        assert_eq!(parse_iou_threshold("T", "1.5"), DEFAULT_IOU_THRESHOLD);
        assert_eq!(parse_iou_threshold("T", "NaN"), DEFAULT_IOU_THRESHOLD);
    }

    #[test]
    fn zero_batch_size_falls_back() {
        assert_eq!(parse_max_batch_size("M", "0"), DEFAULT_MAX_BATCH_SIZE);
        assert_eq!(parse_max_batch_size("M", "250"), 250);
    }

    #[test]
    fn file_values_are_validated_too() {
        let file: DigestConfigFile = serde_json::from_str(
            r#"{"batch": {"window_seconds": -1, "max_batch_size": 50, "iou_threshold": 2.0}}"#,
        )
        .unwrap();
        let cfg = DigestConfig::from_file(file, None);
        assert_eq!(cfg.batch.window, Duration::from_secs(10));
        assert_eq!(cfg.batch.max_batch_size, 50);
        assert_eq!(cfg.batch.track_expiry, DEFAULT_TRACK_EXPIRY);
        assert_eq!(cfg.batch.iou_threshold, DEFAULT_IOU_THRESHOLD);
        assert_eq!(cfg.listen_addr, DEFAULT_LISTEN_ADDR);
    }
}
