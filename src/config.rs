//! Store configuration.
//!
//! Every field has a default, so an empty document (or `StoreConfig::default()`)
//! is a working configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::payload::Mode;
use crate::writer::WriterConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// How long the writer waits to fill a batch.
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    /// Maximum transactions per group commit.
    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,

    /// Change-sets buffered per stream subscriber before the oldest is dropped.
    #[serde(default = "default_change_buffer_capacity")]
    pub change_buffer_capacity: usize,

    /// Reader threads. `None` uses the CPU count clamped to 1..=16.
    #[serde(default)]
    pub reader_threads: Option<usize>,

    /// Running mode reported when no RunningMode record is active.
    #[serde(default = "default_running_mode")]
    pub default_running_mode: Mode,

    /// Tick width used when expanding spread carbs.
    #[serde(default = "default_carbs_tick_minutes")]
    pub carbs_tick_minutes: u32,
}

fn default_batch_timeout_ms() -> u64 {
    10
}

fn default_batch_max_size() -> usize {
    1000
}

fn default_change_buffer_capacity() -> usize {
    64
}

fn default_running_mode() -> Mode {
    Mode::ClosedLoop
}

fn default_carbs_tick_minutes() -> u32 {
    15
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            batch_timeout_ms: default_batch_timeout_ms(),
            batch_max_size: default_batch_max_size(),
            change_buffer_capacity: default_change_buffer_capacity(),
            reader_threads: None,
            default_running_mode: default_running_mode(),
            carbs_tick_minutes: default_carbs_tick_minutes(),
        }
    }
}

impl StoreConfig {
    /// Parses a JSON document, filling in defaults for missing fields.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Writer settings derived from this configuration.
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
            batch_max_size: self.batch_max_size.max(1),
        }
    }

    /// Number of reader threads to spawn.
    pub fn reader_count(&self) -> usize {
        let n = self.reader_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        });
        n.clamp(1, 16)
    }

    /// Carbs tick width in milliseconds.
    pub fn carbs_tick_ms(&self) -> i64 {
        i64::from(self.carbs_tick_minutes.max(1)) * crate::types::MINUTE_MS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.batch_timeout_ms, 10);
        assert_eq!(config.batch_max_size, 1000);
        assert_eq!(config.change_buffer_capacity, 64);
        assert_eq!(config.default_running_mode, Mode::ClosedLoop);
        assert_eq!(config.carbs_tick_ms(), 15 * 60 * 1000);
        assert!((1..=16).contains(&config.reader_count()));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            StoreConfig::from_json(r#"{"reader_threads": 2, "default_running_mode": "open_loop"}"#)
                .unwrap();
        assert_eq!(config.reader_count(), 2);
        assert_eq!(config.default_running_mode, Mode::OpenLoop);
        assert_eq!(config.batch_max_size, 1000);
        assert_eq!(config.writer_config().batch_timeout, Duration::from_millis(10));
    }

    #[test]
    fn test_reader_threads_clamped() {
        let config = StoreConfig {
            reader_threads: Some(100),
            ..StoreConfig::default()
        };
        assert_eq!(config.reader_count(), 16);
    }
}
