//! Frame persistence.
//!
//! The pipeline only knows the [`FrameSink`] capability and the
//! [`SinkOpener`] that produces one for a [`SinkTarget`]. Each on-disk format
//! lives in its own module together with its reader, so recordings can be
//! verified and inspected without going through the pipeline.

pub mod directory_format;
pub mod npz_format;
pub mod stream_format;

use crate::core::frame::{Frame, FrameLayout, FrameMetadata};
use crate::errors::SinkError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// Single append-only binary file (`.frames`).
    Stream,
    /// Zip archive of NumPy arrays plus JSON metadata (`.npz`).
    Npz,
    /// One raw payload and one JSON file per frame in a directory.
    Directory,
}

impl FileFormat {
    pub const ALL: [FileFormat; 3] = [FileFormat::Stream, FileFormat::Npz, FileFormat::Directory];

    pub fn extension(&self) -> Option<&'static str> {
        match self {
            FileFormat::Stream => Some("frames"),
            FileFormat::Npz => Some("npz"),
            FileFormat::Directory => None,
        }
    }

    /// Guesses the format of an existing recording.
    pub fn detect(path: &Path) -> Option<FileFormat> {
        if path.is_dir() {
            return Some(FileFormat::Directory);
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("frames") => Some(FileFormat::Stream),
            Some("npz") => Some(FileFormat::Npz),
            _ => None,
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileFormat::Stream => "stream",
            FileFormat::Npz => "npz",
            FileFormat::Directory => "directory",
        };
        f.write_str(s)
    }
}

impl FromStr for FileFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches('.').to_lowercase().as_str() {
            "stream" | "frames" => Ok(FileFormat::Stream),
            "npz" => Ok(FileFormat::Npz),
            "directory" | "dir" => Ok(FileFormat::Directory),
            other => Err(format!(
                "unknown file format '{}', expected one of stream, npz, directory",
                other
            )),
        }
    }
}

/// Where and how a run is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkTarget {
    pub format: FileFormat,
    pub path: PathBuf,
}

impl SinkTarget {
    pub fn new(format: FileFormat, path: impl Into<PathBuf>) -> Self {
        SinkTarget {
            format,
            path: path.into(),
        }
    }

    /// Target named `<base_name>[.ext]` inside `dir`.
    pub fn in_directory(format: FileFormat, dir: &Path, base_name: &str) -> Self {
        let file_name = match format.extension() {
            Some(ext) => format!("{}.{}", base_name, ext),
            None => base_name.to_string(),
        };
        SinkTarget::new(format, dir.join(file_name))
    }
}

/// Durable, append-only frame persistence. Owned by exactly one writer.
pub trait FrameSink: Send {
    fn append(&mut self, frame: &Frame) -> Result<(), SinkError>;

    /// Flushes and releases the underlying resources. Appending afterwards
    /// fails with [`SinkError::Closed`].
    fn close(&mut self) -> Result<(), SinkError>;

    /// Makes every frame appended so far durable. Formats that only become
    /// readable on close keep the default.
    fn checkpoint(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn frames_written(&self) -> u64;

    fn location(&self) -> &Path;
}

/// Produces a sink for a run; selected once at run start.
pub trait SinkOpener: Send + Sync {
    fn open(&self, target: &SinkTarget, layout: FrameLayout) -> Result<Box<dyn FrameSink>, SinkError>;
}

/// Opens the on-disk formats of this crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSinkOpener;

impl SinkOpener for FileSinkOpener {
    fn open(&self, target: &SinkTarget, layout: FrameLayout) -> Result<Box<dyn FrameSink>, SinkError> {
        if let Some(parent) = target.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| SinkError::io(parent, e))?;
            }
        }
        let sink: Box<dyn FrameSink> = match target.format {
            FileFormat::Stream => Box::new(stream_format::StreamSink::create(&target.path, layout)?),
            FileFormat::Npz => Box::new(npz_format::NpzSink::create(&target.path, layout)?),
            FileFormat::Directory => Box::new(directory_format::DirectorySink::create(&target.path, layout)?),
        };
        Ok(sink)
    }
}

/// A frame as read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFrame {
    pub metadata: FrameMetadata,
    pub pixels: Vec<u16>,
}

/// A complete recording read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub layout: FrameLayout,
    pub frames: Vec<StoredFrame>,
}

impl Recording {
    pub fn sequences(&self) -> Vec<u64> {
        self.frames.iter().map(|f| f.metadata.sequence).collect()
    }
}

pub fn read_recording(format: FileFormat, path: &Path) -> Result<Recording, SinkError> {
    match format {
        FileFormat::Stream => stream_format::read_all(path),
        FileFormat::Npz => npz_format::read_all(path),
        FileFormat::Directory => directory_format::read_all(path),
    }
}

/// Rejects frames whose shape differs from the one the sink was opened with.
pub(crate) fn check_layout(expected: &FrameLayout, frame: &Frame) -> Result<(), SinkError> {
    let actual = frame.pixels().layout();
    if actual != *expected {
        return Err(SinkError::LayoutMismatch {
            sequence: frame.sequence(),
            details: format!("expected {}, got {}", expected, actual),
        });
    }
    Ok(())
}

pub(crate) fn frame_stem(sequence: u64) -> String {
    format!("frame_{:06}", sequence)
}
