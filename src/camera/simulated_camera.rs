//! Deterministic stand-in for an EMCCD camera.
//!
//! Frames are synthetic but reproducible: the value of every pixel is a pure
//! function of the frame index, its position and the configured parameters,
//! so recordings can be verified sample by sample. A shared
//! [`SimulationTally`] lets tests and diagnostics observe how the handle was
//! driven.

use crate::camera_config::SimulationConfig;
use crate::core::capture_source::HardwareCamera;
use crate::core::frame::PixelBuffer;
use crate::core::parameters::{CameraParameters, FanMode};
use crate::errors::CameraFault;
use log::{debug, info};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Counters shared between a [`SimulatedCamera`] and whoever observes it.
#[derive(Debug, Default)]
pub struct SimulationTally {
    opens: AtomicU64,
    closes: AtomicU64,
    configures: AtomicU64,
    starts: AtomicU64,
    stops: AtomicU64,
    frames_emitted: AtomicU64,
    in_call: AtomicBool,
    concurrent_access: AtomicBool,
    pending_fault: AtomicBool,
    threads: Mutex<BTreeSet<String>>,
}

impl SimulationTally {
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn configures(&self) -> u64 {
        self.configures.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u64 {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted.load(Ordering::SeqCst)
    }

    /// True if two calls ever overlapped on the handle.
    pub fn concurrent_access_detected(&self) -> bool {
        self.concurrent_access.load(Ordering::SeqCst)
    }

    /// Names of the threads that have driven the camera.
    pub fn threads(&self) -> Vec<String> {
        match self.threads.lock() {
            Ok(threads) => threads.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    /// Makes the next `grab_frame` fail with a hardware fault.
    pub fn inject_fault(&self) {
        self.pending_fault.store(true, Ordering::SeqCst);
    }

    fn enter(&self) -> CallGuard<'_> {
        if self.in_call.swap(true, Ordering::SeqCst) {
            self.concurrent_access.store(true, Ordering::SeqCst);
        }
        let name = thread::current().name().unwrap_or("unnamed").to_string();
        if let Ok(mut threads) = self.threads.lock() {
            threads.insert(name);
        }
        CallGuard { tally: self }
    }
}

struct CallGuard<'a> {
    tally: &'a SimulationTally,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.tally.in_call.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Closed,
    Opened,
    Acquiring,
}

pub struct SimulatedCamera {
    name: String,
    simulation: SimulationConfig,
    tally: Arc<SimulationTally>,
    phase: Phase,
    parameters: Option<CameraParameters>,
    temperature: f64,
    frames_this_session: u64,
    next_frame_at: Option<Instant>,
    fail_open: bool,
    fail_configure: bool,
}

impl SimulatedCamera {
    pub fn new(name: impl Into<String>, simulation: SimulationConfig) -> Self {
        let temperature = simulation.ambient_temperature;
        SimulatedCamera {
            name: name.into(),
            simulation,
            tally: Arc::new(SimulationTally::default()),
            phase: Phase::Closed,
            parameters: None,
            temperature,
            frames_this_session: 0,
            next_frame_at: None,
            fail_open: false,
            fail_configure: false,
        }
    }

    pub fn tally(&self) -> Arc<SimulationTally> {
        Arc::clone(&self.tally)
    }

    pub fn failing_on_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn failing_on_configure(mut self) -> Self {
        self.fail_configure = true;
        self
    }

    /// Pixel value of frame `index` at (`x`, `y`). Frame indices count from
    /// the last `open`.
    pub fn synthetic_pixel(index: u64, x: u32, y: u32, parameters: &CameraParameters) -> u16 {
        let pattern = (x as u64 * 7 + y as u64 * 13 + index * 31) % 4096;
        let signal = (parameters.exposure_ms.max(0.0) as u64).min(10_000) + parameters.em_gain as u64;
        (100 + pattern + signal).min(u16::MAX as u64) as u16
    }

    fn fault(&self, operation: &'static str, details: impl Into<String>) -> CameraFault {
        CameraFault::new(self.name.clone(), operation, details)
    }

    fn require(&self, phase: Phase, operation: &'static str) -> Result<(), CameraFault> {
        if self.phase != phase {
            return Err(self.fault(operation, format!("camera is {:?}, expected {:?}", self.phase, phase)));
        }
        Ok(())
    }

    fn render(&self, parameters: &CameraParameters) -> Option<PixelBuffer> {
        let layout = parameters.layout();
        let index = self.frames_this_session;
        let mut data = Vec::with_capacity(layout.pixel_count());
        for y in 0..layout.height {
            for x in 0..layout.width {
                data.push(Self::synthetic_pixel(index, x, y, parameters));
            }
        }
        PixelBuffer::new(layout.width, layout.height, data)
    }
}

impl HardwareCamera for SimulatedCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), CameraFault> {
        let _guard = self.tally.enter();
        self.require(Phase::Closed, "open")?;
        if self.fail_open {
            return Err(self.fault("open", "simulated driver refused the connection"));
        }
        self.phase = Phase::Opened;
        self.frames_this_session = 0;
        self.tally.opens.fetch_add(1, Ordering::SeqCst);
        info!("📷 Simulated camera '{}' opened.", self.name);
        Ok(())
    }

    fn configure(&mut self, parameters: &CameraParameters) -> Result<(), CameraFault> {
        let _guard = self.tally.enter();
        self.require(Phase::Opened, "configure")?;
        if self.fail_configure {
            return Err(self.fault("configure", "simulated driver rejected the parameters"));
        }
        self.parameters = Some(parameters.clone());
        self.tally.configures.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Simulated camera '{}' configured: exposure {} ms, gain {}, roi {}",
            self.name, parameters.exposure_ms, parameters.em_gain, parameters.roi
        );
        Ok(())
    }

    fn start(&mut self) -> Result<(), CameraFault> {
        let _guard = self.tally.enter();
        self.require(Phase::Opened, "start")?;
        if self.parameters.is_none() {
            return Err(self.fault("start", "acquisition started before configure"));
        }
        self.phase = Phase::Acquiring;
        self.next_frame_at = Some(Instant::now());
        self.tally.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn grab_frame(&mut self, timeout: Duration) -> Result<Option<PixelBuffer>, CameraFault> {
        let _guard = self.tally.enter();
        self.require(Phase::Acquiring, "grab_frame")?;
        if self.tally.pending_fault.swap(false, Ordering::SeqCst) {
            return Err(self.fault("grab_frame", "injected fault"));
        }
        if let Some(limit) = self.simulation.fail_after_frames {
            if self.frames_this_session >= limit {
                return Err(self.fault("grab_frame", format!("sensor lost after {} frames", limit)));
            }
        }
        if let Some(limit) = self.simulation.max_frames {
            if self.frames_this_session >= limit {
                // Out of exposures: behave like an external trigger that never fires.
                thread::sleep(timeout.min(Duration::from_millis(10)));
                return Ok(None);
            }
        }

        let now = Instant::now();
        let due = self.next_frame_at.unwrap_or(now);
        if due > now {
            let wait = due - now;
            if wait > timeout {
                thread::sleep(timeout);
                return Ok(None);
            }
            thread::sleep(wait);
        }

        let parameters = match &self.parameters {
            Some(p) => p,
            None => return Err(self.fault("grab_frame", "no parameters configured")),
        };
        let buffer = self
            .render(parameters)
            .ok_or_else(|| self.fault("grab_frame", "rendered frame does not match its layout"))?;
        self.frames_this_session += 1;
        self.next_frame_at = Some(due.max(now) + Duration::from_millis(self.simulation.frame_interval_ms));
        self.tally.frames_emitted.fetch_add(1, Ordering::SeqCst);
        Ok(Some(buffer))
    }

    fn stop(&mut self) -> Result<(), CameraFault> {
        let _guard = self.tally.enter();
        self.require(Phase::Acquiring, "stop")?;
        self.phase = Phase::Opened;
        self.next_frame_at = None;
        self.tally.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<(), CameraFault> {
        let _guard = self.tally.enter();
        if self.phase == Phase::Closed {
            return Err(self.fault("close", "camera is already closed"));
        }
        self.phase = Phase::Closed;
        self.tally.closes.fetch_add(1, Ordering::SeqCst);
        info!("📷 Simulated camera '{}' closed after {} frames.", self.name, self.frames_this_session);
        Ok(())
    }

    fn read_temperature(&mut self) -> Result<f64, CameraFault> {
        let _guard = self.tally.enter();
        if self.phase == Phase::Closed {
            return Err(self.fault("read_temperature", "camera is closed"));
        }
        let (target, fan) = self
            .parameters
            .as_ref()
            .map(|p| (p.target_temperature, p.fan_mode))
            .unwrap_or((self.simulation.ambient_temperature, FanMode::Full));
        let delta = target - self.temperature;
        let step = self.simulation.cooling_step.abs() * fan.cooling_factor();
        self.temperature = if delta.abs() <= step {
            target
        } else {
            self.temperature + step * delta.signum()
        };
        Ok(self.temperature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parameters::Roi;

    fn fast() -> SimulationConfig {
        SimulationConfig {
            frame_interval_ms: 0,
            ..SimulationConfig::default()
        }
    }

    fn small_parameters() -> CameraParameters {
        CameraParameters {
            roi: Roi::full(8, 4),
            ..CameraParameters::default()
        }
    }

    #[test]
    fn frames_follow_the_configured_roi_and_are_reproducible() {
        let mut camera = SimulatedCamera::new("sim", fast());
        let params = small_parameters();
        camera.open().unwrap();
        camera.configure(&params).unwrap();
        camera.start().unwrap();
        let first = camera.grab_frame(Duration::from_millis(50)).unwrap().unwrap();
        assert_eq!((first.width(), first.height()), (8, 4));
        assert_eq!(first.data()[9], SimulatedCamera::synthetic_pixel(0, 1, 1, &params));

        let second = camera.grab_frame(Duration::from_millis(50)).unwrap().unwrap();
        assert_ne!(first, second);
        camera.stop().unwrap();
        camera.close().unwrap();
        assert_eq!(camera.tally().frames_emitted(), 2);
    }

    #[test]
    fn out_of_order_calls_are_faults() {
        let mut camera = SimulatedCamera::new("sim", fast());
        assert!(camera.start().is_err());
        camera.open().unwrap();
        assert!(camera.start().is_err(), "start before configure");
        assert!(camera.grab_frame(Duration::from_millis(1)).is_err());
        camera.close().unwrap();
        assert!(camera.close().is_err());
    }

    #[test]
    fn max_frames_then_timeouts() {
        let mut camera = SimulatedCamera::new(
            "sim",
            SimulationConfig {
                max_frames: Some(2),
                ..fast()
            },
        );
        camera.open().unwrap();
        camera.configure(&small_parameters()).unwrap();
        camera.start().unwrap();
        assert!(camera.grab_frame(Duration::from_millis(5)).unwrap().is_some());
        assert!(camera.grab_frame(Duration::from_millis(5)).unwrap().is_some());
        assert!(camera.grab_frame(Duration::from_millis(5)).unwrap().is_none());
    }

    #[test]
    fn injected_fault_hits_the_next_grab_only() {
        let mut camera = SimulatedCamera::new("sim", fast());
        let tally = camera.tally();
        camera.open().unwrap();
        camera.configure(&small_parameters()).unwrap();
        camera.start().unwrap();
        tally.inject_fault();
        let fault = camera.grab_frame(Duration::from_millis(5)).unwrap_err();
        assert_eq!(fault.operation, "grab_frame");
        assert!(camera.grab_frame(Duration::from_millis(5)).unwrap().is_some());
    }

    #[test]
    fn temperature_converges_to_target() {
        let mut camera = SimulatedCamera::new("sim", fast());
        camera.open().unwrap();
        camera.configure(&small_parameters()).unwrap();
        let mut last = 0.0;
        for _ in 0..40 {
            last = camera.read_temperature().unwrap();
        }
        assert_eq!(last, small_parameters().target_temperature);
    }

    #[test]
    fn slower_fan_cools_more_slowly() {
        let mut full = SimulatedCamera::new("sim", fast());
        let mut quiet = SimulatedCamera::new("sim", fast());
        let mut params = small_parameters();
        full.open().unwrap();
        full.configure(&params).unwrap();
        params.fan_mode = FanMode::Off;
        quiet.open().unwrap();
        quiet.configure(&params).unwrap();

        let ambient = fast().ambient_temperature;
        let full_drop = ambient - full.read_temperature().unwrap();
        let quiet_drop = ambient - quiet.read_temperature().unwrap();
        assert!(quiet_drop > 0.0);
        assert!((quiet_drop - full_drop * FanMode::Off.cooling_factor()).abs() < 1e-9);
    }
}
