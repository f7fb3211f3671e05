use crate::app_config::{ApplicationConfig, PipelineConfig, SocketConfig};
use crate::camera_config::CameraConfig;
use crate::core::run::ShotPlan;
use anyhow::{bail, Context, Result};
use log::{debug, info};
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::time::Instant;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MasterConfig {
    #[serde(rename = "application", default)]
    pub app_settings: ApplicationConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    /// Default shot grouping for recordings.
    #[serde(default)]
    pub acquisition: ShotPlan,
}

pub fn load_config(path: &str) -> Result<MasterConfig> {
    debug!("📄 Attempting to load config from: {}", path);
    let start_time = Instant::now();

    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file '{}'. 📖", path))?;
    debug!("Read config file in {:?}", start_time.elapsed());

    let config = parse_config(&config_str).with_context(|| format!("Invalid configuration in '{}'", path))?;

    info!("✅ Successfully loaded and validated configuration from '{}' in {:?}", path, start_time.elapsed());
    Ok(config)
}

pub fn parse_config(config_str: &str) -> Result<MasterConfig> {
    let parse_start_time = Instant::now();
    let config: MasterConfig = serde_yaml::from_str(config_str)
        .context("Failed to parse YAML configuration. 💔")?;
    debug!("Parsed YAML in {:?}", parse_start_time.elapsed());

    validate_master_config(&config).context("Master configuration validation failed 👎")?;
    Ok(config)
}

pub fn validate_master_config(config: &MasterConfig) -> Result<()> {
    debug!("🕵️ Validating master configuration...");
    let validation_start_time = Instant::now();

    if config.app_settings.output_directory.trim().is_empty() {
        bail!("❌ Application output_directory cannot be empty.");
    }
    if config.app_settings.filename_timestamp_format.trim().is_empty() {
        bail!("❌ Application filename_timestamp_format cannot be empty.");
    }

    let pipeline = &config.pipeline;
    let capacities = [
        ("frame_channel_capacity", pipeline.frame_channel_capacity),
        ("file_queue_capacity", pipeline.file_queue_capacity),
        ("command_channel_capacity", pipeline.command_channel_capacity),
        ("status_channel_capacity", pipeline.status_channel_capacity),
    ];
    for (name, capacity) in capacities {
        if capacity == 0 {
            bail!("❌ Pipeline {} must be greater than zero.", name);
        }
    }
    if pipeline.backpressure_timeout_ms == 0 {
        bail!("❌ Pipeline backpressure_timeout_ms must be greater than zero.");
    }
    if pipeline.backpressure_retries == 0 {
        bail!("❌ Pipeline backpressure_retries must be at least 1.");
    }
    if pipeline.grab_timeout_ms == 0 {
        bail!("❌ Pipeline grab_timeout_ms must be greater than zero.");
    }
    if pipeline.sink_retry_attempts == 0 {
        bail!("❌ Pipeline sink_retry_attempts must be at least 1.");
    }

    if config.socket.enabled {
        if config.socket.bind_address.parse::<IpAddr>().is_err() {
            bail!("❌ Invalid socket bind_address '{}'.", config.socket.bind_address);
        }
        if config.socket.max_line_bytes < 64 {
            bail!("❌ Socket max_line_bytes must be at least 64, got {}.", config.socket.max_line_bytes);
        }
    }

    config
        .acquisition
        .validate()
        .context("❌ Acquisition shot grouping is invalid")?;

    let camera = &config.camera;
    if camera.name.trim().is_empty() {
        bail!("❌ Camera name cannot be empty.");
    }
    if camera.limits.exposure_ms_min > camera.limits.exposure_ms_max {
        bail!("❌ Camera exposure limits are inverted for '{}'.", camera.name);
    }
    if camera.limits.temperature_min > camera.limits.temperature_max {
        bail!("❌ Camera temperature limits are inverted for '{}'.", camera.name);
    }
    camera
        .defaults
        .validate(&camera.limits)
        .with_context(|| format!("❌ Default parameters for camera '{}' are outside its limits", camera.name))?;

    info!("👍 Master configuration validated successfully in {:?}.", validation_start_time.elapsed());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileFormat;

    #[test]
    fn empty_document_uses_defaults() {
        let config = parse_config("{}").unwrap();
        assert_eq!(config.pipeline, PipelineConfig::default());
        assert_eq!(config.app_settings.file_format, FileFormat::Npz);
        assert!(config.socket.enabled);
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let yaml = r#"
application:
  output_directory: /tmp/acq
  file_format: stream
pipeline:
  frame_channel_capacity: 8
camera:
  name: ixon-888
  defaults:
    exposure_ms: 25.0
    em_gain: 100
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.app_settings.file_format, FileFormat::Stream);
        assert_eq!(config.pipeline.frame_channel_capacity, 8);
        assert_eq!(config.pipeline.file_queue_capacity, PipelineConfig::default().file_queue_capacity);
        assert_eq!(config.camera.defaults.exposure_ms, 25.0);
        assert_eq!(config.camera.defaults.em_gain, 100);
    }

    #[test]
    fn rejects_zero_capacity() {
        let err = parse_config("pipeline:\n  file_queue_capacity: 0\n").unwrap_err();
        assert!(format!("{:#}", err).contains("file_queue_capacity"));
    }

    #[test]
    fn rejects_defaults_outside_limits() {
        let yaml = "camera:\n  name: cam\n  defaults:\n    em_gain: 5000\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn shipped_config_is_valid() {
        let config = parse_config(include_str!("../config/acqsync.yaml")).unwrap();
        assert_eq!(config.socket.port, 50010);
        assert_eq!(config.camera.defaults.roi.width, 512);
    }

    #[test]
    fn acquisition_grouping_is_optional_and_validated() {
        assert_eq!(parse_config("{}").unwrap().acquisition, ShotPlan::default());
        let config = parse_config("acquisition:\n  frames_per_shot: 4\n  shots_per_group: 10\n").unwrap();
        assert_eq!(config.acquisition.frames_per_group(), Some(40));
        assert!(parse_config("acquisition:\n  shots_per_group: 0\n").is_err());
    }

    #[test]
    fn rejects_bad_bind_address() {
        assert!(parse_config("socket:\n  bind_address: not-an-ip\n").is_err());
    }
}
