use crate::core::capture_source::HardwareCamera;
use crate::core::run::RunId;
use crate::errors::ControllerError;
use log::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraState {
    Available,
    InUse(RunId),
    /// The handle never came back from a run; nothing can use the camera.
    Lost { reason: String },
}

/// The Controller's slot for the camera handle. The handle is either parked
/// here or owned by exactly one acquisition worker.
pub struct CameraEntity {
    name: String,
    state: CameraState,
    handle: Option<Box<dyn HardwareCamera>>,
}

impl CameraEntity {
    pub fn new(camera: Box<dyn HardwareCamera>) -> Self {
        CameraEntity {
            name: camera.name().to_string(),
            state: CameraState::Available,
            handle: Some(camera),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &CameraState {
        &self.state
    }

    /// Checks that [`CameraEntity::lend`] would succeed without taking the handle.
    pub fn ensure_available(&self) -> Result<(), ControllerError> {
        match (&self.state, &self.handle) {
            (CameraState::Available, Some(_)) => Ok(()),
            (CameraState::InUse(run), _) => Err(ControllerError::HardwareUnavailable(format!(
                "camera '{}' is still owned by {}",
                self.name, run
            ))),
            (CameraState::Lost { reason }, _) => Err(ControllerError::HardwareUnavailable(format!(
                "camera '{}' was lost: {}",
                self.name, reason
            ))),
            (CameraState::Available, None) => Err(ControllerError::HardwareUnavailable(format!(
                "camera '{}' has no handle",
                self.name
            ))),
        }
    }

    pub fn lend(&mut self, run: RunId) -> Result<Box<dyn HardwareCamera>, ControllerError> {
        self.ensure_available()?;
        let handle = self
            .handle
            .take()
            .ok_or_else(|| ControllerError::HardwareUnavailable(format!("camera '{}' has no handle", self.name)))?;
        self.update_state(CameraState::InUse(run));
        Ok(handle)
    }

    pub fn give_back(&mut self, camera: Box<dyn HardwareCamera>) {
        self.handle = Some(camera);
        self.update_state(CameraState::Available);
    }

    pub fn mark_lost(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Camera '{}' is unavailable from now on: {}", self.name, reason);
        self.update_state(CameraState::Lost { reason });
    }

    fn update_state(&mut self, new_state: CameraState) {
        info!("Camera '{}' state changed from {:?} to {:?}", self.name, self.state, new_state);
        self.state = new_state;
    }
}
