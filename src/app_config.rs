use crate::storage::FileFormat;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApplicationConfig {
    pub output_directory: String,
    pub file_format: FileFormat,
    pub filename_timestamp_format: String, // strftime format string
    pub log_level: Option<String>, // Making it optional to potentially use CLI or env var as primary
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        ApplicationConfig {
            output_directory: "./output".to_string(),
            file_format: FileFormat::Npz,
            filename_timestamp_format: "%Yy%mm%dd%Hh%Mm%Ss".to_string(),
            log_level: Some("info".to_string()),
        }
    }
}

/// Queue sizes and timeouts of the acquisition pipeline.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub frame_channel_capacity: usize,
    pub file_queue_capacity: usize,
    pub command_channel_capacity: usize,
    pub status_channel_capacity: usize,
    pub backpressure_timeout_ms: u64,
    pub backpressure_retries: u32,
    pub grab_timeout_ms: u64,
    pub acquisition_stop_timeout_ms: u64,
    pub temperature_interval_ms: u64,
    pub sink_retry_attempts: u32,
    pub sink_retry_backoff_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            frame_channel_capacity: 64,
            file_queue_capacity: 256,
            command_channel_capacity: 16,
            status_channel_capacity: 1024,
            backpressure_timeout_ms: 100,
            backpressure_retries: 3,
            grab_timeout_ms: 500,
            acquisition_stop_timeout_ms: 5000,
            temperature_interval_ms: 1000,
            sink_retry_attempts: 3,
            sink_retry_backoff_ms: 20,
        }
    }
}

impl PipelineConfig {
    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.backpressure_timeout_ms)
    }

    pub fn grab_timeout(&self) -> Duration {
        Duration::from_millis(self.grab_timeout_ms)
    }

    pub fn acquisition_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.acquisition_stop_timeout_ms)
    }

    pub fn temperature_interval(&self) -> Duration {
        Duration::from_millis(self.temperature_interval_ms)
    }

    pub fn sink_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.sink_retry_backoff_ms)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SocketConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
    pub max_line_bytes: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            port: 50010,
            max_line_bytes: 4096,
        }
    }
}
