use crate::core::parameters::ParameterSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelDtype {
    U16,
}

impl PixelDtype {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelDtype::U16 => 2,
        }
    }
}

impl fmt::Display for PixelDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelDtype::U16 => f.write_str("u16"),
        }
    }
}

/// Shape and element type shared by every frame of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLayout {
    pub width: u32,
    pub height: u32,
    pub dtype: PixelDtype,
}

impl FrameLayout {
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn byte_len(&self) -> usize {
        self.pixel_count() * self.dtype.bytes_per_pixel()
    }
}

impl fmt::Display for FrameLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.dtype)
    }
}

/// Raw pixel payload as delivered by the camera, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u16>,
}

impl PixelBuffer {
    /// Returns `None` when `data` does not hold exactly `width * height` samples.
    pub fn new(width: u32, height: u32, data: Vec<u16>) -> Option<Self> {
        if data.len() != width as usize * height as usize {
            return None;
        }
        Some(PixelBuffer { width, height, data })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u16] {
        &self.data
    }

    pub fn layout(&self) -> FrameLayout {
        FrameLayout {
            width: self.width,
            height: self.height,
            dtype: PixelDtype::U16,
        }
    }
}

/// One captured image. Immutable after construction and intentionally not
/// `Clone`: a frame moves from the acquisition worker to exactly one consumer.
#[derive(Debug)]
pub struct Frame {
    sequence: u64,
    timestamp: DateTime<Utc>,
    pixels: PixelBuffer,
    parameters: Arc<ParameterSet>,
}

impl Frame {
    pub fn new(sequence: u64, timestamp: DateTime<Utc>, pixels: PixelBuffer, parameters: Arc<ParameterSet>) -> Self {
        Frame {
            sequence,
            timestamp,
            pixels,
            parameters,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn pixels(&self) -> &PixelBuffer {
        &self.pixels
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    pub fn metadata(&self) -> FrameMetadata {
        FrameMetadata {
            sequence: self.sequence,
            timestamp: self.timestamp,
            layout: self.pixels.layout(),
            parameters: (*self.parameters).clone(),
        }
    }
}

/// Everything about a frame except its pixels; what sinks store next to the
/// payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub layout: FrameLayout,
    pub parameters: ParameterSet,
}
