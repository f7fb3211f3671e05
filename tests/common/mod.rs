// Shared helpers for the integration tests: in-memory sinks, fast pipeline
// settings and a simulated camera sized for tests.
#![allow(dead_code)]

use acqsync::app_config::PipelineConfig;
use acqsync::camera::simulated_camera::{SimulatedCamera, SimulationTally};
use acqsync::camera_config::{HardwareLimits, SimulationConfig};
use acqsync::core::capture_source::HardwareCamera;
use acqsync::core::controller::{Controller, ControllerConfig, ControllerHandle};
use acqsync::core::frame::{Frame, FrameLayout, PixelBuffer};
use acqsync::core::parameters::{CameraParameters, Roi};
use acqsync::errors::{CameraFault, SinkError};
use acqsync::storage::{FileFormat, FrameSink, SinkOpener, SinkTarget};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Fails the test instead of hanging when `fut` does not finish in time.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, fut)
        .await
        .expect("operation did not finish in time")
}

/// What a [`MemorySink`] received.
#[derive(Debug, Default, Clone)]
pub struct MemoryRecording {
    pub sequences: Vec<u64>,
    pub versions: Vec<u64>,
    pub exposures: Vec<f64>,
    pub layout: Option<FrameLayout>,
    /// Frames stored at each checkpoint.
    pub checkpoints: Vec<usize>,
    pub closed: bool,
}

pub struct MemorySink {
    path: PathBuf,
    recording: Arc<Mutex<MemoryRecording>>,
    write_delay: Duration,
    failure: Option<io::ErrorKind>,
}

impl FrameSink for MemorySink {
    fn append(&mut self, frame: &Frame) -> Result<(), SinkError> {
        if !self.write_delay.is_zero() {
            thread::sleep(self.write_delay);
        }
        if let Some(kind) = self.failure {
            return Err(SinkError::io(&self.path, io::Error::new(kind, "injected sink failure")));
        }
        let mut recording = self.recording.lock().unwrap();
        if recording.closed {
            return Err(SinkError::Closed);
        }
        recording.sequences.push(frame.sequence());
        recording.versions.push(frame.parameters().version);
        recording.exposures.push(frame.parameters().parameters.exposure_ms);
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<(), SinkError> {
        let mut recording = self.recording.lock().unwrap();
        let stored = recording.sequences.len();
        recording.checkpoints.push(stored);
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.recording.lock().unwrap().closed = true;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.recording.lock().unwrap().sequences.len() as u64
    }

    fn location(&self) -> &Path {
        &self.path
    }
}

/// Opens [`MemorySink`]s and keeps every recording for inspection.
#[derive(Default)]
pub struct MemorySinkOpener {
    recordings: Mutex<Vec<Arc<Mutex<MemoryRecording>>>>,
    write_delay: Duration,
    failure: Option<io::ErrorKind>,
}

impl MemorySinkOpener {
    pub fn new() -> Arc<Self> {
        Arc::new(MemorySinkOpener::default())
    }

    /// Every append takes `delay`.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(MemorySinkOpener {
            write_delay: delay,
            ..MemorySinkOpener::default()
        })
    }

    /// Every append fails with `kind`.
    pub fn failing(kind: io::ErrorKind) -> Arc<Self> {
        Arc::new(MemorySinkOpener {
            failure: Some(kind),
            ..MemorySinkOpener::default()
        })
    }

    pub fn opened(&self) -> usize {
        self.recordings.lock().unwrap().len()
    }

    pub fn recording(&self, index: usize) -> MemoryRecording {
        self.recordings.lock().unwrap()[index].lock().unwrap().clone()
    }

    pub fn last(&self) -> MemoryRecording {
        let recordings = self.recordings.lock().unwrap();
        let last = recordings.last().expect("no sink was opened");
        let recording = last.lock().unwrap().clone();
        recording
    }
}

impl SinkOpener for MemorySinkOpener {
    fn open(&self, target: &SinkTarget, layout: FrameLayout) -> Result<Box<dyn FrameSink>, SinkError> {
        let recording = Arc::new(Mutex::new(MemoryRecording {
            layout: Some(layout),
            ..MemoryRecording::default()
        }));
        self.recordings.lock().unwrap().push(Arc::clone(&recording));
        Ok(Box::new(MemorySink {
            path: target.path.clone(),
            recording,
            write_delay: self.write_delay,
            failure: self.failure,
        }))
    }
}

/// Default parameters with a 16x8 ROI.
pub fn small_parameters() -> CameraParameters {
    CameraParameters {
        roi: Roi::full(16, 8),
        ..CameraParameters::default()
    }
}

/// Short timeouts so failure paths resolve quickly.
pub fn fast_pipeline() -> PipelineConfig {
    PipelineConfig {
        backpressure_timeout_ms: 5,
        backpressure_retries: 1,
        grab_timeout_ms: 20,
        acquisition_stop_timeout_ms: 5_000,
        temperature_interval_ms: 25,
        sink_retry_attempts: 2,
        sink_retry_backoff_ms: 1,
        ..PipelineConfig::default()
    }
}

pub fn controller_config() -> ControllerConfig {
    ControllerConfig {
        pipeline: fast_pipeline(),
        limits: HardwareLimits::default(),
        initial_parameters: small_parameters(),
    }
}

pub fn simulated_camera(frame_interval_ms: u64) -> SimulatedCamera {
    SimulatedCamera::new(
        "test-camera",
        SimulationConfig {
            frame_interval_ms,
            ..SimulationConfig::default()
        },
    )
}

pub fn memory_target(name: &str) -> SinkTarget {
    SinkTarget::new(FileFormat::Stream, PathBuf::from("memory").join(name))
}

/// A Controller over a simulated camera writing into `opener`.
pub fn spawn_controller(
    camera: SimulatedCamera,
    opener: Arc<MemorySinkOpener>,
    config: ControllerConfig,
) -> (ControllerHandle, Arc<SimulationTally>) {
    let tally = camera.tally();
    let controller = Controller::spawn(Box::new(camera), opener as Arc<dyn SinkOpener>, config);
    (controller, tally)
}

/// Camera whose `grab_frame` blocks, ignoring its timeout, until released.
pub struct StuckCamera {
    released: Arc<AtomicBool>,
    closes: Arc<AtomicU64>,
}

/// A [`StuckCamera`], its release switch and its close counter.
pub fn stuck_camera() -> (StuckCamera, Arc<AtomicBool>, Arc<AtomicU64>) {
    let released = Arc::new(AtomicBool::new(false));
    let closes = Arc::new(AtomicU64::new(0));
    let camera = StuckCamera {
        released: Arc::clone(&released),
        closes: Arc::clone(&closes),
    };
    (camera, released, closes)
}

impl HardwareCamera for StuckCamera {
    fn name(&self) -> &str {
        "stuck-camera"
    }

    fn open(&mut self) -> Result<(), CameraFault> {
        Ok(())
    }

    fn configure(&mut self, _parameters: &CameraParameters) -> Result<(), CameraFault> {
        Ok(())
    }

    fn start(&mut self) -> Result<(), CameraFault> {
        Ok(())
    }

    fn grab_frame(&mut self, _timeout: Duration) -> Result<Option<PixelBuffer>, CameraFault> {
        while !self.released.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }
        Ok(None)
    }

    fn stop(&mut self) -> Result<(), CameraFault> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), CameraFault> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_temperature(&mut self) -> Result<f64, CameraFault> {
        Ok(-60.0)
    }
}
