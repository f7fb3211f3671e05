use crate::core::parameters::CameraParameters;
use serde::Deserialize;

/// Declared hardware-supported ranges. Parameters outside these are rejected
/// before they reach the device.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HardwareLimits {
    pub sensor_width: u32,
    pub sensor_height: u32,
    pub max_binning: u32,
    pub exposure_ms_min: f64,
    pub exposure_ms_max: f64,
    pub em_gain_max: u32,
    pub high_em_gain_max: u32, // Ceiling when high EM gain mode is enabled
    pub temperature_min: f64,
    pub temperature_max: f64,
    pub hs_speed_count: u32,
    pub vs_speed_count: u32,
    pub preamp_gain_count: u32,
}

impl Default for HardwareLimits {
    fn default() -> Self {
        HardwareLimits {
            sensor_width: 1024,
            sensor_height: 1024,
            max_binning: 16,
            exposure_ms_min: 0.01,
            exposure_ms_max: 10_000.0,
            em_gain_max: 300,
            high_em_gain_max: 1000,
            temperature_min: -100.0,
            temperature_max: 30.0,
            hs_speed_count: 3,
            vs_speed_count: 5,
            preamp_gain_count: 3,
        }
    }
}

/// Behaviour of the simulated camera used when no driver is linked in.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    pub frame_interval_ms: u64,
    pub max_frames: Option<u64>, // Stop producing after this many frames (grab then times out)
    pub fail_after_frames: Option<u64>, // Inject a hardware fault after this many frames
    pub ambient_temperature: f64,
    pub cooling_step: f64, // Degrees per temperature read towards the target
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            frame_interval_ms: 10,
            max_frames: None,
            fail_after_frames: None,
            ambient_temperature: 20.0,
            cooling_step: 5.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CameraConfig {
    pub name: String,
    #[serde(default)]
    pub limits: HardwareLimits,
    #[serde(default)]
    pub defaults: CameraParameters,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl Default for CameraConfig {
    fn default() -> Self {
        CameraConfig {
            name: "simulated-emccd".to_string(),
            limits: HardwareLimits::default(),
            defaults: CameraParameters::default(),
            simulation: SimulationConfig::default(),
        }
    }
}
