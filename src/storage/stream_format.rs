//! Append-only single-file format.
//!
//! ```text
//! magic "ACQSTRM1"
//! u32 LE layout length, layout JSON
//! repeated: u32 LE metadata length, metadata JSON,
//!           u32 LE sample count, samples as u16 LE
//! ```

use crate::core::frame::{Frame, FrameLayout, FrameMetadata};
use crate::errors::SinkError;
use crate::storage::{check_layout, FrameSink, Recording, StoredFrame};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, error, warn};
use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 8] = b"ACQSTRM1";

/// Storage behind a [`StreamSink`]: appendable, seekable and truncatable.
pub trait RecordFile: Write + Seek + Send {
    fn truncate(&mut self, len: u64) -> io::Result<()>;

    fn sync(&mut self) -> io::Result<()>;
}

impl RecordFile for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Each record is written with a single `write_all` of the encoded bytes. A
/// failed write is cut back to the previous record boundary, so the file only
/// ever holds whole records.
pub struct StreamSink<F: RecordFile = File> {
    path: PathBuf,
    layout: FrameLayout,
    file: Option<F>,
    frames_written: u64,
    poisoned: Option<String>,
}

impl StreamSink<File> {
    pub fn create(path: &Path, layout: FrameLayout) -> Result<Self, SinkError> {
        let file = File::create(path).map_err(|e| SinkError::io(path, e))?;
        StreamSink::with_file(path, file, layout)
    }
}

impl<F: RecordFile> StreamSink<F> {
    fn with_file(path: &Path, mut file: F, layout: FrameLayout) -> Result<Self, SinkError> {
        let layout_json = serde_json::to_vec(&layout)?;
        let mut header = Vec::with_capacity(MAGIC.len() + 4 + layout_json.len());
        header.extend_from_slice(MAGIC);
        header
            .write_u32::<LittleEndian>(layout_json.len() as u32)
            .map_err(|e| SinkError::Encode(e.to_string()))?;
        header.extend_from_slice(&layout_json);
        file.write_all(&header)
            .and_then(|_| file.flush())
            .map_err(|e| SinkError::io(path, e))?;
        debug!("Stream sink created at '{}' for {}", path.display(), layout);
        Ok(StreamSink {
            path: path.to_path_buf(),
            layout,
            file: Some(file),
            frames_written: 0,
            poisoned: None,
        })
    }
}

fn encode_record(frame: &Frame) -> Result<Vec<u8>, SinkError> {
    let metadata = serde_json::to_vec(&frame.metadata())?;
    let samples = frame.pixels().data();
    let mut record = Vec::with_capacity(8 + metadata.len() + samples.len() * 2);
    record
        .write_u32::<LittleEndian>(metadata.len() as u32)
        .and_then(|_| record.write_all(&metadata))
        .and_then(|_| record.write_u32::<LittleEndian>(samples.len() as u32))
        .map_err(|e| SinkError::Encode(e.to_string()))?;
    for &sample in samples {
        record
            .write_u16::<LittleEndian>(sample)
            .map_err(|e| SinkError::Encode(e.to_string()))?;
    }
    Ok(record)
}

fn roll_back<F: RecordFile>(file: &mut F, offset: u64) -> io::Result<()> {
    file.truncate(offset)?;
    file.seek(SeekFrom::Start(offset))?;
    Ok(())
}

impl<F: RecordFile> FrameSink for StreamSink<F> {
    fn append(&mut self, frame: &Frame) -> Result<(), SinkError> {
        if let Some(reason) = &self.poisoned {
            return Err(SinkError::Poisoned(reason.clone()));
        }
        let file = self.file.as_mut().ok_or(SinkError::Closed)?;
        check_layout(&self.layout, frame)?;
        let record = encode_record(frame)?;

        let offset = file.stream_position().map_err(|e| SinkError::io(&self.path, e))?;
        if let Err(write_error) = file.write_all(&record).and_then(|_| file.flush()) {
            if let Err(rollback_error) = roll_back(file, offset) {
                let reason = format!(
                    "'{}' may end in a partial record after byte {}: write failed ({}), truncate failed ({})",
                    self.path.display(),
                    offset,
                    write_error,
                    rollback_error
                );
                error!("❌ {}", reason);
                self.poisoned = Some(reason.clone());
                return Err(SinkError::Poisoned(reason));
            }
            warn!(
                "Frame {} not written to '{}'; rolled back to byte {}",
                frame.sequence(),
                self.path.display(),
                offset
            );
            return Err(SinkError::io(&self.path, write_error));
        }
        self.frames_written += 1;
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<(), SinkError> {
        if let Some(reason) = &self.poisoned {
            return Err(SinkError::Poisoned(reason.clone()));
        }
        let file = self.file.as_mut().ok_or(SinkError::Closed)?;
        file.flush()
            .and_then(|_| file.sync())
            .map_err(|e| SinkError::io(&self.path, e))
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .and_then(|_| file.sync())
                .map_err(|e| SinkError::io(&self.path, e))?;
            debug!("Stream sink '{}' closed after {} frames", self.path.display(), self.frames_written);
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

pub fn read_all(path: &Path) -> Result<Recording, SinkError> {
    let file = File::open(path).map_err(|e| SinkError::io(path, e))?;
    read_stream(BufReader::new(file), path)
}

/// Decodes a stream; `path` only labels errors.
fn read_stream<R: Read>(mut reader: R, path: &Path) -> Result<Recording, SinkError> {

    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic).map_err(|e| SinkError::io(path, e))?;
    if &magic != MAGIC {
        return Err(SinkError::Decode(format!("'{}' is not a frame stream", path.display())));
    }
    let header_len = reader.read_u32::<LittleEndian>().map_err(|e| SinkError::io(path, e))?;
    let header = read_block(&mut reader, header_len as usize).map_err(|e| SinkError::io(path, e))?;
    let layout: FrameLayout = serde_json::from_slice(&header).map_err(|e| SinkError::Decode(e.to_string()))?;

    let mut frames = Vec::new();
    loop {
        let metadata_len = match reader.read_u32::<LittleEndian>() {
            Ok(len) => len,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(SinkError::io(path, e)),
        };
        let metadata = read_block(&mut reader, metadata_len as usize).map_err(|e| SinkError::io(path, e))?;
        let metadata: FrameMetadata =
            serde_json::from_slice(&metadata).map_err(|e| SinkError::Decode(e.to_string()))?;
        let sample_count = reader.read_u32::<LittleEndian>().map_err(|e| SinkError::io(path, e))? as usize;
        if sample_count != layout.pixel_count() {
            return Err(SinkError::Decode(format!(
                "frame {} holds {} samples, layout {} needs {}",
                metadata.sequence,
                sample_count,
                layout,
                layout.pixel_count()
            )));
        }
        let mut pixels = vec![0u16; sample_count];
        reader
            .read_u16_into::<LittleEndian>(&mut pixels)
            .map_err(|e| SinkError::io(path, e))?;
        frames.push(StoredFrame { metadata, pixels });
    }
    Ok(Recording { layout, frames })
}

fn read_block<R: Read>(reader: &mut R, len: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}
