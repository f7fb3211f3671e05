//! Compressed-array format: a deflate zip archive readable by `numpy.load`.
//!
//! Each frame becomes `frame_NNNNNN.npy` (a 2-D `u16` array, shape
//! `(height, width)`) next to `frame_NNNNNN.json` holding its metadata. The
//! archive index is only written on close.

use crate::core::frame::{Frame, FrameLayout, FrameMetadata};
use crate::errors::SinkError;
use crate::storage::{check_layout, frame_stem, FrameSink, Recording, StoredFrame};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";
const LAYOUT_ENTRY: &str = "layout.json";

pub struct NpzSink {
    path: PathBuf,
    layout: FrameLayout,
    archive: Option<ZipWriter<BufWriter<File>>>,
    frames_written: u64,
}

fn entry_options() -> FileOptions {
    FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true)
}

impl NpzSink {
    pub fn create(path: &Path, layout: FrameLayout) -> Result<Self, SinkError> {
        let file = File::create(path).map_err(|e| SinkError::io(path, e))?;
        let mut archive = ZipWriter::new(BufWriter::new(file));
        archive.start_file(LAYOUT_ENTRY, entry_options())?;
        archive
            .write_all(&serde_json::to_vec(&layout)?)
            .map_err(|e| SinkError::io(path, e))?;
        debug!("NPZ sink created at '{}' for {}", path.display(), layout);
        Ok(NpzSink {
            path: path.to_path_buf(),
            layout,
            archive: Some(archive),
            frames_written: 0,
        })
    }
}

impl FrameSink for NpzSink {
    fn append(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let archive = self.archive.as_mut().ok_or(SinkError::Closed)?;
        check_layout(&self.layout, frame)?;
        let array = encode_npy(&self.layout, frame.pixels().data())?;
        let metadata = serde_json::to_vec(&frame.metadata())?;
        let stem = frame_stem(frame.sequence());

        archive.start_file(format!("{}.npy", stem), entry_options())?;
        archive.write_all(&array).map_err(|e| SinkError::io(&self.path, e))?;
        archive.start_file(format!("{}.json", stem), entry_options())?;
        archive.write_all(&metadata).map_err(|e| SinkError::io(&self.path, e))?;
        self.frames_written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if let Some(mut archive) = self.archive.take() {
            let mut writer = archive.finish()?;
            writer.flush().map_err(|e| SinkError::io(&self.path, e))?;
            let file = writer.into_inner().map_err(|e| SinkError::io(&self.path, e.into_error()))?;
            file.sync_all().map_err(|e| SinkError::io(&self.path, e))?;
            debug!("NPZ sink '{}' closed after {} frames", self.path.display(), self.frames_written);
        }
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames_written
    }

    fn location(&self) -> &Path {
        &self.path
    }
}

fn native_descr() -> &'static str {
    if cfg!(target_endian = "little") {
        "<u2"
    } else {
        ">u2"
    }
}

/// NPY v1.0: magic, version, u16 LE header length, a Python dict literal
/// padded so the data starts on a 64-byte boundary, then the raw samples.
fn encode_npy(layout: &FrameLayout, samples: &[u16]) -> Result<Vec<u8>, SinkError> {
    let mut header = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': ({}, {}), }}",
        native_descr(),
        layout.height,
        layout.width
    );
    let unpadded = NPY_MAGIC.len() + 2 + 2 + header.len() + 1;
    header.push_str(&" ".repeat((64 - unpadded % 64) % 64));
    header.push('\n');

    let data: &[u8] = bytemuck::cast_slice(samples);
    let mut out = Vec::with_capacity(NPY_MAGIC.len() + 4 + header.len() + data.len());
    out.extend_from_slice(NPY_MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.write_u16::<LittleEndian>(header.len() as u16)
        .map_err(|e| SinkError::Encode(e.to_string()))?;
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(data);
    Ok(out)
}

fn decode_npy(bytes: &[u8]) -> Result<(usize, usize, Vec<u16>), SinkError> {
    let bad = |what: &str| SinkError::Decode(format!("invalid npy array: {}", what));
    if bytes.len() < 10 || &bytes[..6] != NPY_MAGIC {
        return Err(bad("missing magic"));
    }
    let mut cursor = &bytes[8..10];
    let header_len = cursor
        .read_u16::<LittleEndian>()
        .map_err(|e| SinkError::Decode(e.to_string()))? as usize;
    let data_start = 10 + header_len;
    let header = bytes
        .get(10..data_start)
        .and_then(|h| std::str::from_utf8(h).ok())
        .ok_or_else(|| bad("unreadable header"))?;

    let big_endian = if header.contains("'<u2'") {
        false
    } else if header.contains("'>u2'") {
        true
    } else {
        return Err(bad("dtype is not u16"));
    };
    let shape_start = header.find("'shape': (").ok_or_else(|| bad("missing shape"))? + "'shape': (".len();
    let shape_end = header[shape_start..].find(')').ok_or_else(|| bad("unterminated shape"))? + shape_start;
    let dims: Vec<usize> = header[shape_start..shape_end]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().map_err(|_| bad("non-numeric shape")))
        .collect::<Result<_, _>>()?;
    let (rows, cols) = match dims.as_slice() {
        [rows, cols] => (*rows, *cols),
        _ => return Err(bad("expected a 2-D array")),
    };

    let data = &bytes[data_start..];
    if data.len() != rows * cols * 2 {
        return Err(bad("payload length does not match shape"));
    }
    let mut samples: Vec<u16> = bytemuck::pod_collect_to_vec(data);
    if big_endian != cfg!(target_endian = "big") {
        for s in &mut samples {
            *s = s.swap_bytes();
        }
    }
    Ok((rows, cols, samples))
}

fn read_entry<R: Read + std::io::Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>, SinkError> {
    let mut entry = archive.by_name(name)?;
    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut buf)
        .map_err(|e| SinkError::Decode(format!("entry '{}': {}", name, e)))?;
    Ok(buf)
}

pub fn read_all(path: &Path) -> Result<Recording, SinkError> {
    let file = File::open(path).map_err(|e| SinkError::io(path, e))?;
    let mut archive = ZipArchive::new(file)?;
    let layout: FrameLayout = serde_json::from_slice(&read_entry(&mut archive, LAYOUT_ENTRY)?)
        .map_err(|e| SinkError::Decode(e.to_string()))?;

    let mut stems: Vec<String> = archive
        .file_names()
        .filter(|name| name.starts_with("frame_") && name.ends_with(".json"))
        .map(|name| name.trim_end_matches(".json").to_string())
        .collect();
    stems.sort();

    let mut frames = Vec::with_capacity(stems.len());
    for stem in stems {
        let metadata: FrameMetadata = serde_json::from_slice(&read_entry(&mut archive, &format!("{}.json", stem))?)
            .map_err(|e| SinkError::Decode(e.to_string()))?;
        let (rows, cols, pixels) = decode_npy(&read_entry(&mut archive, &format!("{}.npy", stem))?)?;
        if rows != layout.height as usize || cols != layout.width as usize {
            return Err(SinkError::Decode(format!(
                "{} has shape ({}, {}) but the recording is {}",
                stem, rows, cols, layout
            )));
        }
        frames.push(StoredFrame { metadata, pixels });
    }
    Ok(Recording { layout, frames })
}
