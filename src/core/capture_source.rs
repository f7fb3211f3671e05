use crate::core::frame::PixelBuffer;
use crate::core::parameters::CameraParameters;
use crate::errors::CameraFault;
use std::time::Duration;

// --- The HardwareCamera Trait ---

/// Opaque, stateful handle to one camera. Every call may fail with a
/// [`CameraFault`], which is fatal to the run that made it.
///
/// A handle is owned by exactly one execution unit at a time; the methods take
/// `&mut self` and the trait only requires `Send`, so the handle moves between
/// threads instead of being shared.
pub trait HardwareCamera: Send {
    fn name(&self) -> &str;

    fn open(&mut self) -> Result<(), CameraFault>;

    /// Pushes a full parameter set to the device. Only valid while stopped.
    fn configure(&mut self, parameters: &CameraParameters) -> Result<(), CameraFault>;

    fn start(&mut self) -> Result<(), CameraFault>;

    /// Waits up to `timeout` for the next exposure. `Ok(None)` means nothing
    /// arrived in time, which is not a fault.
    fn grab_frame(&mut self, timeout: Duration) -> Result<Option<PixelBuffer>, CameraFault>;

    fn stop(&mut self) -> Result<(), CameraFault>;

    fn close(&mut self) -> Result<(), CameraFault>;

    /// Current sensor temperature in degrees Celsius.
    fn read_temperature(&mut self) -> Result<f64, CameraFault>;
}

impl<C: HardwareCamera + ?Sized> HardwareCamera for Box<C> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn open(&mut self) -> Result<(), CameraFault> {
        (**self).open()
    }

    fn configure(&mut self, parameters: &CameraParameters) -> Result<(), CameraFault> {
        (**self).configure(parameters)
    }

    fn start(&mut self) -> Result<(), CameraFault> {
        (**self).start()
    }

    fn grab_frame(&mut self, timeout: Duration) -> Result<Option<PixelBuffer>, CameraFault> {
        (**self).grab_frame(timeout)
    }

    fn stop(&mut self) -> Result<(), CameraFault> {
        (**self).stop()
    }

    fn close(&mut self) -> Result<(), CameraFault> {
        (**self).close()
    }

    fn read_temperature(&mut self) -> Result<f64, CameraFault> {
        (**self).read_temperature()
    }
}
