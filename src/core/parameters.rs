//! Camera parameters, versioned parameter sets and single-parameter updates.
//!
//! The Controller holds the canonical [`ParameterSet`]; workers only ever see
//! `Arc` snapshots of it. Every change goes through [`CameraParameters::with_change`]
//! followed by [`CameraParameters::validate`] so a rejected update leaves the
//! previous set untouched.

use crate::camera_config::HardwareLimits;
use crate::core::frame::{FrameLayout, PixelDtype};
use crate::errors::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    Internal,
    External,
    ExternalExposure,
}

impl FromStr for TriggerMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "internal" | "int" => Ok(TriggerMode::Internal),
            "external" | "ext" => Ok(TriggerMode::External),
            "external_exposure" | "external exposure" | "ext_exp" => Ok(TriggerMode::ExternalExposure),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Amplifier {
    ElectronMultiplying,
    Conventional,
}

impl FromStr for Amplifier {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "electron_multiplying" | "em" | "emccd" => Ok(Amplifier::ElectronMultiplying),
            "conventional" | "conv" | "ccd" => Ok(Amplifier::Conventional),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutterMode {
    Auto,
    Open,
    Closed,
}

impl FromStr for ShutterMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(ShutterMode::Auto),
            "open" => Ok(ShutterMode::Open),
            "closed" | "close" => Ok(ShutterMode::Closed),
            _ => Err(()),
        }
    }
}

/// Sensor cooling fan speed. Slower fans cool more slowly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanMode {
    Full,
    Low,
    Off,
}

impl FanMode {
    /// Share of the full cooling rate this fan speed achieves.
    pub fn cooling_factor(&self) -> f64 {
        match self {
            FanMode::Full => 1.0,
            FanMode::Low => 0.5,
            FanMode::Off => 0.25,
        }
    }
}

impl FromStr for FanMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "full" | "high" | "on" => Ok(FanMode::Full),
            "low" => Ok(FanMode::Low),
            "off" => Ok(FanMode::Off),
            _ => Err(()),
        }
    }
}

fn default_binning() -> u32 {
    1
}

/// Region of interest in unbinned sensor pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_binning")]
    pub x_bin: u32,
    #[serde(default = "default_binning")]
    pub y_bin: u32,
}

impl Roi {
    pub fn full(width: u32, height: u32) -> Self {
        Roi {
            x: 0,
            y: 0,
            width,
            height,
            x_bin: 1,
            y_bin: 1,
        }
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}+{}+{} (bin {}x{})",
            self.width, self.height, self.x, self.y, self.x_bin, self.y_bin
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterName {
    TriggerMode,
    ExposureTime,
    EmGain,
    HighEmGain,
    Amplifier,
    HsSpeed,
    VsSpeed,
    PreampGain,
    ShutterMode,
    FanMode,
    TargetTemperature,
    Roi,
}

impl ParameterName {
    pub const ALL: [ParameterName; 12] = [
        ParameterName::TriggerMode,
        ParameterName::ExposureTime,
        ParameterName::EmGain,
        ParameterName::HighEmGain,
        ParameterName::Amplifier,
        ParameterName::HsSpeed,
        ParameterName::VsSpeed,
        ParameterName::PreampGain,
        ParameterName::ShutterMode,
        ParameterName::FanMode,
        ParameterName::TargetTemperature,
        ParameterName::Roi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterName::TriggerMode => "trigger_mode",
            ParameterName::ExposureTime => "exposure_time",
            ParameterName::EmGain => "em_gain",
            ParameterName::HighEmGain => "high_em_gain",
            ParameterName::Amplifier => "amplifier",
            ParameterName::HsSpeed => "hs_speed",
            ParameterName::VsSpeed => "vs_speed",
            ParameterName::PreampGain => "preamp_gain",
            ParameterName::ShutterMode => "shutter_mode",
            ParameterName::FanMode => "fan_mode",
            ParameterName::TargetTemperature => "target_temperature",
            ParameterName::Roi => "roi",
        }
    }

    /// Whether the parameter may change while frames are being acquired.
    /// The ROI fixes the frame shape of a run, so it is start-only.
    pub fn is_live(&self) -> bool {
        !matches!(self, ParameterName::Roi)
    }
}

impl fmt::Display for ParameterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParameterName {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace([' ', '-'], "_");
        ParameterName::ALL
            .iter()
            .copied()
            .find(|name| name.as_str() == normalized)
            .or(match normalized.as_str() {
                "exposure" | "exposure_ms" | "exposure_time_(ms)" => Some(ParameterName::ExposureTime),
                "temperature" | "temperature_(c)" => Some(ParameterName::TargetTemperature),
                _ => None,
            })
            .ok_or_else(|| ConfigurationError::UnknownParameter(s.to_string()))
    }
}

/// A typed parameter value as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Roi(Roi),
}

impl ParameterValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Integer(v) => Some(*v as f64),
            ParameterValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    fn as_u32(&self, name: ParameterName) -> Result<u32, ConfigurationError> {
        let mismatch = ConfigurationError::TypeMismatch {
            name,
            expected: "a non-negative integer",
        };
        match self {
            ParameterValue::Integer(v) => u32::try_from(*v).map_err(|_| mismatch),
            ParameterValue::Float(v) if v.fract() == 0.0 && *v >= 0.0 && *v <= u32::MAX as f64 => Ok(*v as u32),
            _ => Err(mismatch),
        }
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            ParameterValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(v) => write!(f, "{}", v),
            ParameterValue::Integer(v) => write!(f, "{}", v),
            ParameterValue::Float(v) => write!(f, "{}", v),
            ParameterValue::Text(v) => write!(f, "{}", v),
            ParameterValue::Roi(v) => write!(f, "{}", v),
        }
    }
}

fn parse_enum<T: FromStr>(name: ParameterName, value: &ParameterValue, expected: &'static str) -> Result<T, ConfigurationError> {
    let text = value
        .as_text()
        .ok_or(ConfigurationError::TypeMismatch { name, expected })?;
    text.parse::<T>().map_err(|_| ConfigurationError::Unsupported {
        name,
        value: text.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraParameters {
    pub trigger_mode: TriggerMode,
    pub exposure_ms: f64,
    pub em_gain: u32,
    pub high_em_gain: bool,
    pub amplifier: Amplifier,
    pub hs_speed_index: u32,
    pub vs_speed_index: u32,
    pub preamp_gain_index: u32,
    pub shutter_mode: ShutterMode,
    pub fan_mode: FanMode,
    pub target_temperature: f64,
    pub roi: Roi,
}

impl Default for CameraParameters {
    fn default() -> Self {
        CameraParameters {
            trigger_mode: TriggerMode::Internal,
            exposure_ms: 10.0,
            em_gain: 1,
            high_em_gain: false,
            amplifier: Amplifier::ElectronMultiplying,
            hs_speed_index: 0,
            vs_speed_index: 0,
            preamp_gain_index: 0,
            shutter_mode: ShutterMode::Auto,
            fan_mode: FanMode::Full,
            target_temperature: -60.0,
            roi: Roi::full(512, 512),
        }
    }
}

impl CameraParameters {
    pub fn get(&self, name: ParameterName) -> ParameterValue {
        match name {
            ParameterName::TriggerMode => ParameterValue::Text(enum_text(&self.trigger_mode)),
            ParameterName::ExposureTime => ParameterValue::Float(self.exposure_ms),
            ParameterName::EmGain => ParameterValue::Integer(self.em_gain as i64),
            ParameterName::HighEmGain => ParameterValue::Bool(self.high_em_gain),
            ParameterName::Amplifier => ParameterValue::Text(enum_text(&self.amplifier)),
            ParameterName::HsSpeed => ParameterValue::Integer(self.hs_speed_index as i64),
            ParameterName::VsSpeed => ParameterValue::Integer(self.vs_speed_index as i64),
            ParameterName::PreampGain => ParameterValue::Integer(self.preamp_gain_index as i64),
            ParameterName::ShutterMode => ParameterValue::Text(enum_text(&self.shutter_mode)),
            ParameterName::FanMode => ParameterValue::Text(enum_text(&self.fan_mode)),
            ParameterName::TargetTemperature => ParameterValue::Float(self.target_temperature),
            ParameterName::Roi => ParameterValue::Roi(self.roi),
        }
    }

    /// Returns a copy with one parameter replaced. Only checks the value's
    /// type; ranges are checked by [`CameraParameters::validate`].
    pub fn with_change(&self, name: ParameterName, value: &ParameterValue) -> Result<CameraParameters, ConfigurationError> {
        let mut next = self.clone();
        match name {
            ParameterName::TriggerMode => {
                next.trigger_mode = parse_enum(name, value, "one of internal, external, external_exposure")?
            }
            ParameterName::ExposureTime => {
                next.exposure_ms = value.as_f64().ok_or(ConfigurationError::TypeMismatch {
                    name,
                    expected: "a number of milliseconds",
                })?
            }
            ParameterName::EmGain => next.em_gain = value.as_u32(name)?,
            ParameterName::HighEmGain => {
                next.high_em_gain = match value {
                    ParameterValue::Bool(b) => *b,
                    _ => {
                        return Err(ConfigurationError::TypeMismatch {
                            name,
                            expected: "a boolean",
                        })
                    }
                }
            }
            ParameterName::Amplifier => {
                next.amplifier = parse_enum(name, value, "one of electron_multiplying, conventional")?
            }
            ParameterName::HsSpeed => next.hs_speed_index = value.as_u32(name)?,
            ParameterName::VsSpeed => next.vs_speed_index = value.as_u32(name)?,
            ParameterName::PreampGain => next.preamp_gain_index = value.as_u32(name)?,
            ParameterName::ShutterMode => next.shutter_mode = parse_enum(name, value, "one of auto, open, closed")?,
            ParameterName::FanMode => next.fan_mode = parse_enum(name, value, "one of full, low, off")?,
            ParameterName::TargetTemperature => {
                next.target_temperature = value.as_f64().ok_or(ConfigurationError::TypeMismatch {
                    name,
                    expected: "a temperature in degrees Celsius",
                })?
            }
            ParameterName::Roi => {
                next.roi = match value {
                    ParameterValue::Roi(roi) => *roi,
                    _ => {
                        return Err(ConfigurationError::TypeMismatch {
                            name,
                            expected: "an object {x, y, width, height, x_bin, y_bin}",
                        })
                    }
                }
            }
        }
        Ok(next)
    }

    /// Checks every value against the declared hardware limits.
    pub fn validate(&self, limits: &HardwareLimits) -> Result<(), ConfigurationError> {
        check_range(ParameterName::ExposureTime, self.exposure_ms, limits.exposure_ms_min, limits.exposure_ms_max)?;
        if !self.exposure_ms.is_finite() {
            return Err(ConfigurationError::Unsupported {
                name: ParameterName::ExposureTime,
                value: self.exposure_ms.to_string(),
            });
        }
        let gain_max = if self.high_em_gain {
            limits.high_em_gain_max
        } else {
            limits.em_gain_max
        };
        check_range(ParameterName::EmGain, self.em_gain as f64, 0.0, gain_max as f64)?;
        check_index(ParameterName::HsSpeed, self.hs_speed_index, limits.hs_speed_count)?;
        check_index(ParameterName::VsSpeed, self.vs_speed_index, limits.vs_speed_count)?;
        check_index(ParameterName::PreampGain, self.preamp_gain_index, limits.preamp_gain_count)?;
        check_range(
            ParameterName::TargetTemperature,
            self.target_temperature,
            limits.temperature_min,
            limits.temperature_max,
        )?;
        validate_roi(&self.roi, limits)
    }

    /// Shape of the frames produced with these parameters.
    pub fn layout(&self) -> FrameLayout {
        FrameLayout {
            width: self.roi.width / self.roi.x_bin.max(1),
            height: self.roi.height / self.roi.y_bin.max(1),
            dtype: PixelDtype::U16,
        }
    }
}

fn enum_text<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

fn check_range(name: ParameterName, value: f64, min: f64, max: f64) -> Result<(), ConfigurationError> {
    if value.is_nan() || value < min || value > max {
        return Err(ConfigurationError::OutOfRange { name, value, min, max });
    }
    Ok(())
}

fn check_index(name: ParameterName, index: u32, count: u32) -> Result<(), ConfigurationError> {
    if index >= count {
        return Err(ConfigurationError::OutOfRange {
            name,
            value: index as f64,
            min: 0.0,
            max: count.saturating_sub(1) as f64,
        });
    }
    Ok(())
}

fn validate_roi(roi: &Roi, limits: &HardwareLimits) -> Result<(), ConfigurationError> {
    if roi.width == 0 || roi.height == 0 {
        return Err(ConfigurationError::InvalidRoi(format!("{} has an empty area", roi)));
    }
    if roi.x_bin == 0 || roi.y_bin == 0 || roi.x_bin > limits.max_binning || roi.y_bin > limits.max_binning {
        return Err(ConfigurationError::InvalidRoi(format!(
            "binning {}x{} must be between 1 and {}",
            roi.x_bin, roi.y_bin, limits.max_binning
        )));
    }
    if roi.width % roi.x_bin != 0 || roi.height % roi.y_bin != 0 {
        return Err(ConfigurationError::InvalidRoi(format!(
            "{} is not divisible by its binning",
            roi
        )));
    }
    let right = roi.x as u64 + roi.width as u64;
    let bottom = roi.y as u64 + roi.height as u64;
    if right > limits.sensor_width as u64 || bottom > limits.sensor_height as u64 {
        return Err(ConfigurationError::InvalidRoi(format!(
            "{} exceeds the {}x{} sensor",
            roi, limits.sensor_width, limits.sensor_height
        )));
    }
    Ok(())
}

/// Versioned parameter bundle. The version increases by exactly one per
/// accepted change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub version: u64,
    pub parameters: CameraParameters,
}

impl ParameterSet {
    pub fn initial(parameters: CameraParameters) -> Self {
        ParameterSet { version: 0, parameters }
    }

    /// The successor of this set carrying `parameters`.
    pub fn successor(&self, parameters: CameraParameters) -> Self {
        ParameterSet {
            version: self.version + 1,
            parameters,
        }
    }
}

/// A single-parameter change requested by an external peer.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterUpdate {
    pub version: u64,
    pub name: ParameterName,
    pub value: ParameterValue,
}

impl ParameterUpdate {
    pub fn new(version: u64, name: ParameterName, value: ParameterValue) -> Self {
        ParameterUpdate { version, name, value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> HardwareLimits {
        HardwareLimits::default()
    }

    #[test]
    fn defaults_are_within_default_limits() {
        CameraParameters::default().validate(&limits()).unwrap();
    }

    #[test]
    fn parameter_names_parse_from_wire_and_legacy_spellings() {
        assert_eq!("exposure_time".parse::<ParameterName>().unwrap(), ParameterName::ExposureTime);
        assert_eq!("Exposure time (ms)".parse::<ParameterName>().unwrap(), ParameterName::ExposureTime);
        assert_eq!("EM gain".parse::<ParameterName>().unwrap(), ParameterName::EmGain);
        assert!(matches!(
            "focus".parse::<ParameterName>(),
            Err(ConfigurationError::UnknownParameter(_))
        ));
    }

    #[test]
    fn with_change_coerces_numbers_and_checks_types() {
        let base = CameraParameters::default();
        let changed = base
            .with_change(ParameterName::ExposureTime, &ParameterValue::Integer(25))
            .unwrap();
        assert_eq!(changed.exposure_ms, 25.0);
        assert_eq!(base.exposure_ms, 10.0);

        let err = base
            .with_change(ParameterName::EmGain, &ParameterValue::Text("lots".into()))
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::TypeMismatch { name: ParameterName::EmGain, .. }));

        let err = base
            .with_change(ParameterName::ShutterMode, &ParameterValue::Text("half".into()))
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::Unsupported { .. }));

        let ext = base
            .with_change(ParameterName::TriggerMode, &ParameterValue::Text("ext_exp".into()))
            .unwrap();
        assert_eq!(ext.trigger_mode, TriggerMode::ExternalExposure);
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut params = CameraParameters::default();
        params.em_gain = 10_000;
        assert!(matches!(
            params.validate(&limits()),
            Err(ConfigurationError::OutOfRange { name: ParameterName::EmGain, .. })
        ));

        let mut params = CameraParameters::default();
        params.hs_speed_index = limits().hs_speed_count;
        assert!(params.validate(&limits()).is_err());

        let mut params = CameraParameters::default();
        params.exposure_ms = 0.0;
        assert!(params.validate(&limits()).is_err());
    }

    #[test]
    fn high_em_gain_raises_the_gain_ceiling() {
        let mut params = CameraParameters::default();
        params.em_gain = limits().em_gain_max + 1;
        assert!(params.validate(&limits()).is_err());
        params.high_em_gain = true;
        params.validate(&limits()).unwrap();
    }

    #[test]
    fn roi_must_fit_sensor_and_binning() {
        let mut params = CameraParameters::default();
        params.roi = Roi {
            x: 1000,
            y: 0,
            width: 100,
            height: 100,
            x_bin: 1,
            y_bin: 1,
        };
        assert!(matches!(params.validate(&limits()), Err(ConfigurationError::InvalidRoi(_))));

        params.roi = Roi {
            x: 0,
            y: 0,
            width: 100,
            height: 100,
            x_bin: 3,
            y_bin: 1,
        };
        assert!(params.validate(&limits()).is_err());

        params.roi.x_bin = 2;
        params.roi.y_bin = 4;
        params.validate(&limits()).unwrap();
        let layout = params.layout();
        assert_eq!((layout.width, layout.height), (50, 25));
    }

    #[test]
    fn values_round_trip_through_json() {
        let v: ParameterValue = serde_json::from_str("12.5").unwrap();
        assert_eq!(v, ParameterValue::Float(12.5));
        let v: ParameterValue = serde_json::from_str("12").unwrap();
        assert_eq!(v, ParameterValue::Integer(12));
        let v: ParameterValue = serde_json::from_str(r#"{"x":0,"y":0,"width":8,"height":8}"#).unwrap();
        assert_eq!(v, ParameterValue::Roi(Roi::full(8, 8)));
    }

    #[test]
    fn fan_mode_is_a_live_text_parameter() {
        assert_eq!("fan mode".parse::<ParameterName>().unwrap(), ParameterName::FanMode);
        assert!(ParameterName::FanMode.is_live());

        let base = CameraParameters::default();
        assert_eq!(base.get(ParameterName::FanMode), ParameterValue::Text("full".into()));
        let quiet = base
            .with_change(ParameterName::FanMode, &ParameterValue::Text("Low".into()))
            .unwrap();
        assert_eq!(quiet.fan_mode, FanMode::Low);
        quiet.validate(&limits()).unwrap();

        assert!(matches!(
            base.with_change(ParameterName::FanMode, &ParameterValue::Text("turbo".into())),
            Err(ConfigurationError::Unsupported { name: ParameterName::FanMode, .. })
        ));
        assert!(matches!(
            base.with_change(ParameterName::FanMode, &ParameterValue::Integer(1)),
            Err(ConfigurationError::TypeMismatch { name: ParameterName::FanMode, .. })
        ));
    }

    #[test]
    fn get_reflects_current_values() {
        let params = CameraParameters::default();
        assert_eq!(params.get(ParameterName::TriggerMode), ParameterValue::Text("internal".into()));
        assert_eq!(params.get(ParameterName::EmGain), ParameterValue::Integer(1));
    }
}
