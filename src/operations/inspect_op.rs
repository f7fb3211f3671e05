use crate::common::{file_utils, timestamp_utils};
use crate::config_loader::MasterConfig;
use crate::operations::op_helper;
use crate::storage::{self, FileFormat, Recording, StoredFrame};
use anyhow::{anyhow, Context, Result};
use clap::ArgMatches;
use futures::future::join_all;
use image::{ImageBuffer, Luma};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;

pub async fn handle_inspect_cli(_master_config: &MasterConfig, args: &ArgMatches) -> Result<()> {
    let op_start_time = Instant::now();
    let path = PathBuf::from(args.get_one::<String>("path").context("A recording path is required")?);
    let format = match args.get_one::<String>("format") {
        Some(name) => name.parse::<FileFormat>().map_err(|e| anyhow!(e))?,
        None => FileFormat::detect(&path)
            .with_context(|| format!("Cannot tell the format of '{}'; pass --format", path.display()))?,
    };

    info!("🔍 Reading {} recording '{}'...", format, path.display());
    let read_start = Instant::now();
    let read_path = path.clone();
    let recording = tokio::task::spawn_blocking(move || storage::read_recording(format, &read_path))
        .await
        .context("Recording reader task failed")?
        .with_context(|| format!("Failed to read recording '{}'", path.display()))?;
    info!("Read {} frames of {} in {:?}", recording.frames.len(), recording.layout, read_start.elapsed());

    print_frames(&recording);
    report_continuity(&recording.sequences());

    if let Some(export_dir) = args.get_one::<String>("export-png") {
        let exported = export_pngs(recording, export_dir).await?;
        info!("🖼️ Exported {} PNG file(s) to '{}'", exported.len(), export_dir);
    }
    info!("🏁 Inspection of '{}' finished in {:?}.", path.display(), op_start_time.elapsed());
    Ok(())
}

fn print_frames(recording: &Recording) {
    println!("{:>8}  {:<36}  {:>7}  {:>10}  {:>6}  {:>7}  {:>7}", "sequence", "timestamp", "version", "exposure", "gain", "min", "max");
    for frame in &recording.frames {
        let metadata = &frame.metadata;
        let min = frame.pixels.iter().copied().min().unwrap_or(0);
        let max = frame.pixels.iter().copied().max().unwrap_or(0);
        println!(
            "{:>8}  {:<36}  {:>7}  {:>7.3} ms  {:>6}  {:>7}  {:>7}",
            metadata.sequence,
            timestamp_utils::format_frame_timestamp(&metadata.timestamp),
            metadata.parameters.version,
            metadata.parameters.parameters.exposure_ms,
            metadata.parameters.parameters.em_gain,
            min,
            max
        );
    }
}

/// Sequence ranges missing from `sequences`, which must be ascending.
pub fn missing_ranges(sequences: &[u64]) -> Vec<(u64, u64)> {
    let mut missing = Vec::new();
    let mut expected = 0;
    for &sequence in sequences {
        if sequence > expected {
            missing.push((expected, sequence - 1));
        }
        expected = sequence + 1;
    }
    missing
}

fn report_continuity(sequences: &[u64]) {
    let missing = missing_ranges(sequences);
    if missing.is_empty() {
        info!("✅ Sequences are contiguous ({} frames)", sequences.len());
        return;
    }
    for (first, last) in &missing {
        warn!("⚠️ Frames {}..={} are missing from the recording", first, last);
    }
}

async fn export_pngs(recording: Recording, export_dir: &str) -> Result<Vec<PathBuf>> {
    let export_start = Instant::now();
    let dir = file_utils::ensure_output_directory(export_dir)?;
    let width = recording.layout.width;
    let height = recording.layout.height;

    let tasks: Vec<_> = recording
        .frames
        .into_iter()
        .map(|frame| {
            let dir = dir.clone();
            tokio::task::spawn_blocking(move || write_png(&dir, width, height, frame))
        })
        .collect();
    debug!("Spawned {} PNG export tasks", tasks.len());

    let (paths, errors) = op_helper::collect_task_results(join_all(tasks).await, "PNG export");
    if errors > 0 {
        return Err(anyhow!("{} frame(s) could not be exported to '{}'", errors, dir.display()));
    }
    debug!("PNG export finished in {:?}", export_start.elapsed());
    Ok(paths)
}

fn write_png(dir: &Path, width: u32, height: u32, frame: StoredFrame) -> Result<PathBuf> {
    let sequence = frame.metadata.sequence;
    let image: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::from_raw(width, height, frame.pixels)
        .with_context(|| format!("Frame {} does not match its {}x{} layout", sequence, width, height))?;
    let path = dir.join(format!("frame_{:06}.png", sequence));
    image
        .save(&path)
        .with_context(|| format!("Failed to write '{}'", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::{frame, layout};
    use crate::storage::{FileSinkOpener, SinkOpener, SinkTarget};

    #[test]
    fn reports_missing_ranges() {
        assert!(missing_ranges(&[0, 1, 2]).is_empty());
        assert_eq!(missing_ranges(&[1, 2, 5, 6, 9]), vec![(0, 0), (3, 4), (7, 8)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exports_sixteen_bit_pngs() {
        let dir = tempfile::tempdir().unwrap();
        let target = SinkTarget::new(FileFormat::Stream, dir.path().join("rec.frames"));
        let mut sink = FileSinkOpener.open(&target, layout()).unwrap();
        for sequence in 0..3 {
            sink.append(&frame(sequence)).unwrap();
        }
        sink.close().unwrap();

        let recording = storage::read_recording(FileFormat::Stream, &target.path).unwrap();
        let expected = recording.frames[2].pixels.clone();
        let out = dir.path().join("png");
        let paths = export_pngs(recording, out.to_str().unwrap()).await.unwrap();
        assert_eq!(paths.len(), 3);

        let decoded = image::open(out.join("frame_000002.png")).unwrap().into_luma16();
        assert_eq!(decoded.dimensions(), (6, 4));
        assert_eq!(decoded.into_raw(), expected);
    }
}
