//! One file pair per frame inside a recording directory:
//! `layout.json`, then `frame_NNNNNN.raw` (u16 LE samples, row-major) and
//! `frame_NNNNNN.json` for each frame. Files appear atomically via rename.

use crate::core::frame::{Frame, FrameLayout, FrameMetadata};
use crate::errors::SinkError;
use crate::storage::{check_layout, frame_stem, FrameSink, Recording, StoredFrame};
use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

const LAYOUT_FILE: &str = "layout.json";

pub struct DirectorySink {
    root: PathBuf,
    layout: FrameLayout,
    closed: bool,
    frames_written: u64,
}

impl DirectorySink {
    pub fn create(path: &Path, layout: FrameLayout) -> Result<Self, SinkError> {
        fs::create_dir_all(path).map_err(|e| SinkError::io(path, e))?;
        write_atomically(&path.join(LAYOUT_FILE), &serde_json::to_vec_pretty(&layout)?)?;
        debug!("Directory sink created at '{}' for {}", path.display(), layout);
        Ok(DirectorySink {
            root: path.to_path_buf(),
            layout,
            closed: false,
            frames_written: 0,
        })
    }
}

impl FrameSink for DirectorySink {
    fn append(&mut self, frame: &Frame) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        check_layout(&self.layout, frame)?;
        let samples = frame.pixels().data();
        let mut raw = vec![0u8; samples.len() * 2];
        LittleEndian::write_u16_into(samples, &mut raw);
        let stem = frame_stem(frame.sequence());

        // Payload first: a metadata file is only ever visible next to a full payload.
        write_atomically(&self.root.join(format!("{}.raw", stem)), &raw)?;
        write_atomically(
            &self.root.join(format!("{}.json", stem)),
            &serde_json::to_vec_pretty(&frame.metadata())?,
        )?;
        self.frames_written += 1;
        Ok(())
    }

    /// Frame files are synced as they are written; this makes their renames
    /// durable too.
    fn checkpoint(&mut self) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        File::open(&self.root)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| SinkError::io(&self.root, e))
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if !self.closed {
            self.closed = true;
            debug!("Directory sink '{}' closed after {} frames", self.root.display(), self.frames_written);
        }
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames_written
    }

    fn location(&self) -> &Path {
        &self.root
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), SinkError> {
    let tmp = path.with_extension("part");
    let mut file = File::create(&tmp).map_err(|e| SinkError::io(&tmp, e))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| SinkError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| SinkError::io(path, e))
}

pub fn read_all(path: &Path) -> Result<Recording, SinkError> {
    let layout_bytes = fs::read(path.join(LAYOUT_FILE)).map_err(|e| SinkError::io(path, e))?;
    let layout: FrameLayout =
        serde_json::from_slice(&layout_bytes).map_err(|e| SinkError::Decode(e.to_string()))?;

    let mut stems = Vec::new();
    for entry in fs::read_dir(path).map_err(|e| SinkError::io(path, e))? {
        let entry = entry.map_err(|e| SinkError::io(path, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("frame_") && name.ends_with(".json") {
            stems.push(name.trim_end_matches(".json").to_string());
        }
    }
    stems.sort();

    let mut frames = Vec::with_capacity(stems.len());
    for stem in stems {
        let meta_path = path.join(format!("{}.json", stem));
        let raw_path = path.join(format!("{}.raw", stem));
        let metadata: FrameMetadata = serde_json::from_slice(&fs::read(&meta_path).map_err(|e| SinkError::io(&meta_path, e))?)
            .map_err(|e| SinkError::Decode(format!("{}: {}", meta_path.display(), e)))?;
        let raw = fs::read(&raw_path).map_err(|e| SinkError::io(&raw_path, e))?;
        if raw.len() != layout.byte_len() {
            return Err(SinkError::Decode(format!(
                "'{}' holds {} bytes, layout {} needs {}",
                raw_path.display(),
                raw.len(),
                layout,
                layout.byte_len()
            )));
        }
        let mut pixels = vec![0u16; layout.pixel_count()];
        LittleEndian::read_u16_into(&raw, &mut pixels);
        frames.push(StoredFrame { metadata, pixels });
    }
    Ok(Recording { layout, frames })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::{frame, layout};

    #[test]
    fn rewriting_a_frame_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("run");
        let mut sink = DirectorySink::create(&root, layout()).unwrap();
        let f = frame(7);
        sink.append(&f).unwrap();
        sink.append(&f).unwrap();
        sink.close().unwrap();

        let recording = read_all(&root).unwrap();
        assert_eq!(recording.sequences(), vec![7]);
        assert!(!root.join("frame_000007.part").exists());
    }

    #[test]
    fn removed_directory_is_reported_as_missing_medium() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("gone");
        let mut sink = DirectorySink::create(&root, layout()).unwrap();
        fs::remove_dir_all(&root).unwrap();
        let err = sink.append(&frame(0)).unwrap_err();
        assert!(err.is_medium_unavailable(), "unexpected error {:?}", err);
        let err = sink.checkpoint().unwrap_err();
        assert!(err.is_medium_unavailable(), "unexpected error {:?}", err);
    }
}
