use crate::core::parameters::ParameterName;
use crate::core::run::RunId;
use thiserror::Error;

/// Top-level error of the CLI operations.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("File I/O Error: {0}")]
    Io(String),

    #[error("Acquisition Error: {0}")]
    Acquisition(#[from] ControllerError),

    #[error("Storage Error: {0}")]
    Storage(#[from] SinkError),
}

// Allow conversion from std::io::Error to AppError::Io
impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err.to_string())
    }
}

/// Invalid parameter value or range. Always raised before any state change.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("parameter '{name}' expects {expected}")]
    TypeMismatch {
        name: ParameterName,
        expected: &'static str,
    },

    #[error("parameter '{name}' = {value} is outside the supported range [{min}, {max}]")]
    OutOfRange {
        name: ParameterName,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("parameter '{name}' does not support value '{value}'")]
    Unsupported { name: ParameterName, value: String },

    #[error("invalid region of interest: {0}")]
    InvalidRoi(String),

    #[error("parameter '{0}' cannot change while a run is active")]
    NotLive(ParameterName),

    #[error("invalid shot plan: {0}")]
    InvalidShotPlan(String),
}

/// Malformed or out-of-order network update.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("stale version {received}: current version is {current}")]
    StaleVersion { received: u64, current: u64 },

    #[error("version gap: received {received}, expected {expected}")]
    VersionGap { received: u64, expected: u64 },

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("request line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
}

/// Device communication failure. Fatal to the current run.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("camera '{camera}' failed during {operation}: {details}")]
pub struct CameraFault {
    pub camera: String,
    pub operation: &'static str,
    pub details: String,
}

impl CameraFault {
    pub fn new(camera: impl Into<String>, operation: &'static str, details: impl Into<String>) -> Self {
        CameraFault {
            camera: camera.into(),
            operation,
            details: details.into(),
        }
    }
}

/// Sink open/append/close failure.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("frame {sequence} does not match the recording layout: {details}")]
    LayoutMismatch { sequence: u64, details: String },

    #[error("encoding error: {0}")]
    Encode(String),

    #[error("decoding error: {0}")]
    Decode(String),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("sink is already closed")]
    Closed,

    /// A failed write could not be undone; the sink refuses further frames.
    #[error("sink is unusable: {0}")]
    Poisoned(String),
}

impl SinkError {
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        SinkError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Errors worth retrying: interrupted, blocked or timed-out I/O.
    pub fn is_transient(&self) -> bool {
        match self {
            SinkError::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// No later frame can be stored: the medium is gone (unmounted, deleted,
    /// read-only) or the sink is poisoned.
    pub fn is_medium_unavailable(&self) -> bool {
        match self {
            SinkError::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::ReadOnlyFilesystem
            ),
            SinkError::Poisoned(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        SinkError::Encode(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("run {0} is already active")]
    AlreadyRunning(RunId),

    #[error("invalid parameters: {0}")]
    InvalidParameters(#[from] ConfigurationError),

    #[error("camera is unavailable: {0}")]
    HardwareUnavailable(String),

    #[error("failed to open sink: {0}")]
    Persistence(#[from] SinkError),

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("controller is not running")]
    ControllerUnavailable,
}

/// Typed rejection of a parameter update; the update had no effect.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpdateRejection {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("acquisition worker is not accepting commands")]
    WorkerUnavailable,

    #[error("controller is not running")]
    ControllerUnavailable,
}
