use crate::camera::simulated_camera::{SimulatedCamera, SimulationTally};
use crate::config_loader::MasterConfig;
use crate::core::controller::{Controller, ControllerConfig, ControllerHandle, RunRequest};
use crate::core::parameters::{CameraParameters, Roi};
use crate::core::run::{RunState, RunSummary};
use crate::storage::{self, FileFormat, FileSinkOpener, SinkTarget};
use crate::workers::connection_worker::{ConnectionWorker, ResponseStatus, UpdateResponse};
use anyhow::{anyhow, bail, Context, Result};
use clap::ArgMatches;
use log::{debug, error, info};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;

const DIAGNOSTIC_FRAMES: u64 = 12;
const DIAGNOSTIC_TIMEOUT: Duration = Duration::from_secs(30);

struct DiagnosticResult {
    test_name: String,
    success: bool,
    details: String,
}

impl DiagnosticResult {
    fn from_outcome(test_name: String, started: Instant, outcome: Result<String>) -> Self {
        match outcome {
            Ok(details) => {
                info!("    DIAGNOSTIC: {} PASSED in {:?}. {}", test_name, started.elapsed(), details);
                DiagnosticResult {
                    test_name,
                    success: true,
                    details,
                }
            }
            Err(e) => {
                error!("    DIAGNOSTIC: {} FAILED in {:?}: {:#}", test_name, started.elapsed(), e);
                DiagnosticResult {
                    test_name,
                    success: false,
                    details: format!("Failed: {:#}", e),
                }
            }
        }
    }
}

pub async fn handle_diagnostic_cli(master_config: &MasterConfig, _args: &ArgMatches) -> Result<()> {
    let overall_diag_start_time = Instant::now();
    info!("🩺 Starting diagnostic test suite...");
    let config = diagnostic_config(master_config);
    let workspace = tempfile::tempdir().context("Failed to create a temporary directory for diagnostics")?;
    info!("💾 Diagnostic recordings go to: {}", workspace.path().display());
    let mut results: Vec<DiagnosticResult> = Vec::new();

    for format in FileFormat::ALL {
        info!("  DIAGNOSTIC: Recording {} frames in {} format... 💾", DIAGNOSTIC_FRAMES, format);
        let started = Instant::now();
        let outcome = round_trip(&config, format, workspace.path()).await;
        results.push(DiagnosticResult::from_outcome(format!("Round trip ({})", format), started, outcome));
    }

    info!("  DIAGNOSTIC: Running parameter synchronization over TCP... 🔌");
    let started = Instant::now();
    let outcome = parameter_sync(&config, workspace.path()).await;
    results.push(DiagnosticResult::from_outcome("Parameter sync (TCP)".to_string(), started, outcome));

    info!("  DIAGNOSTIC: Running injected hardware fault... ⚡");
    let started = Instant::now();
    let outcome = injected_fault(&config, workspace.path()).await;
    results.push(DiagnosticResult::from_outcome("Hardware fault recovery".to_string(), started, outcome));

    info!("📋 ----- Diagnostic Test Summary (Total Suite Time: {:?}) -----", overall_diag_start_time.elapsed());
    let mut overall_success = true;
    for result in &results {
        let status_emoji = if result.success { "✅ PASS" } else { "❌ FAIL" };
        info!("Test: {:<32} | Status: {:<10} | Details: {}", result.test_name, status_emoji, result.details);
        overall_success &= result.success;
    }
    info!("----------------------------------------------------------------------");
    info!("🏁 Diagnostic test suite finished in {:?}.", overall_diag_start_time.elapsed());
    if !overall_success {
        bail!("🔥 One or more diagnostic tests failed. Please review logs above.");
    }
    info!("🎉 All diagnostic tests passed.");
    Ok(())
}

/// The configured camera with a small ROI and a fast frame rate, so the suite
/// finishes in seconds.
fn diagnostic_config(master_config: &MasterConfig) -> MasterConfig {
    let mut config = master_config.clone();
    let limits = &config.camera.limits;
    config.camera.defaults.roi = Roi::full(limits.sensor_width.min(64), limits.sensor_height.min(48));
    config.camera.simulation.frame_interval_ms = 1;
    config.camera.simulation.max_frames = None;
    config.camera.simulation.fail_after_frames = None;
    config
}

fn spawn_controller(config: &MasterConfig) -> (ControllerHandle, Arc<SimulationTally>) {
    let camera = SimulatedCamera::new(config.camera.name.clone(), config.camera.simulation.clone());
    let tally = camera.tally();
    let controller = Controller::spawn(Box::new(camera), Arc::new(FileSinkOpener), ControllerConfig::from_master(config));
    (controller, tally)
}

async fn record(controller: &ControllerHandle, parameters: CameraParameters, target: SinkTarget, frames: u64) -> Result<RunSummary> {
    let run_id = controller
        .start_run_with(RunRequest::new(parameters, target).with_max_frames(frames))
        .await
        .context("Run did not start")?;
    tokio::time::timeout(DIAGNOSTIC_TIMEOUT, controller.wait_for_summary(run_id))
        .await
        .map_err(|_| anyhow!("run {} did not finish within {:?}", run_id, DIAGNOSTIC_TIMEOUT))?
        .context("Controller stopped before the run finished")
}

async fn round_trip(config: &MasterConfig, format: FileFormat, dir: &Path) -> Result<String> {
    let (controller, _tally) = spawn_controller(config);
    let target = SinkTarget::in_directory(format, dir, &format!("roundtrip_{}", format));
    let parameters = config.camera.defaults.clone();
    let summary = record(&controller, parameters.clone(), target.clone(), DIAGNOSTIC_FRAMES).await?;
    controller.shutdown().await?;
    if summary.outcome.is_faulted() {
        bail!("run ended {}", summary.outcome);
    }

    let read_path = target.path.clone();
    let recording = tokio::task::spawn_blocking(move || storage::read_recording(format, &read_path)).await??;
    let expected: Vec<u64> = (0..DIAGNOSTIC_FRAMES).collect();
    if recording.sequences() != expected {
        bail!("expected sequences 0..{}, read back {:?}", DIAGNOSTIC_FRAMES, recording.sequences());
    }
    let layout = parameters.layout();
    for frame in &recording.frames {
        let sequence = frame.metadata.sequence;
        for y in 0..layout.height {
            for x in 0..layout.width {
                let stored = frame.pixels[(y * layout.width + x) as usize];
                let generated = SimulatedCamera::synthetic_pixel(sequence, x, y, &parameters);
                if stored != generated {
                    bail!("frame {} pixel ({}, {}) is {}, expected {}", sequence, x, y, stored, generated);
                }
            }
        }
    }
    Ok(format!("{} frames verified in {}", recording.frames.len(), target.path.display()))
}

async fn parameter_sync(config: &MasterConfig, dir: &Path) -> Result<String> {
    let (controller, _tally) = spawn_controller(config);
    let mut socket = config.socket.clone();
    socket.bind_address = "127.0.0.1".to_string();
    socket.port = 0;
    let worker = ConnectionWorker::bind(&socket, controller.clone()).await?;
    let addr = worker.local_addr()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let endpoint = worker.spawn(shutdown_rx);

    let target = SinkTarget::in_directory(FileFormat::Stream, dir, "parameter_sync");
    let run_id = controller.start_run(config.camera.defaults.clone(), target).await?;
    let version = controller.current_version().await?;
    let exposure = config.camera.defaults.exposure_ms + 1.0;

    let stream = TcpStream::connect(addr).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let accepted = exchange(&mut reader, &mut writer, format!(
        r#"{{"version": {}, "parameter_name": "exposure_time", "value": {}}}"#,
        version + 1,
        exposure
    ))
    .await?;
    if accepted.status != ResponseStatus::Ok || accepted.version != version + 1 {
        bail!("update to version {} was answered with {:?}", version + 1, accepted);
    }
    let stale = exchange(&mut reader, &mut writer, format!(
        r#"{{"version": {}, "parameter_name": "exposure_time", "value": {}}}"#,
        version + 1,
        exposure
    ))
    .await?;
    if stale.status != ResponseStatus::Rejected || stale.version != version + 1 {
        bail!("stale update was answered with {:?}", stale);
    }
    drop(writer);

    let summary = controller
        .stop_run()
        .await?
        .ok_or_else(|| anyhow!("run {} ended before it was stopped", run_id))?;
    let _ = shutdown_tx.send(true);
    endpoint.await?;
    controller.shutdown().await?;
    if !summary.applied_versions.contains(&(version + 1)) {
        bail!("version {} never reached the camera (applied {:?})", version + 1, summary.applied_versions);
    }
    Ok(format!("versions applied {:?}", summary.applied_versions))
}

async fn exchange(reader: &mut BufReader<OwnedReadHalf>, writer: &mut OwnedWriteHalf, request: String) -> Result<UpdateResponse> {
    writer.write_all(format!("{}\n", request).as_bytes()).await?;
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let response: UpdateResponse = serde_json::from_str(line.trim_end())
        .with_context(|| format!("unparseable response '{}'", line.trim_end()))?;
    debug!("Sent {} got {:?}", request, response);
    Ok(response)
}

async fn injected_fault(config: &MasterConfig, dir: &Path) -> Result<String> {
    let mut config = config.clone();
    config.camera.simulation.fail_after_frames = Some(5);
    let (controller, tally) = spawn_controller(&config);
    let target = SinkTarget::in_directory(FileFormat::Directory, dir, "fault");
    let summary = record(&controller, config.camera.defaults.clone(), target, 1_000).await?;
    let snapshot = controller.snapshot().await?;
    controller.shutdown().await?;

    if !summary.outcome.is_faulted() {
        bail!("run ended {} instead of faulted", summary.outcome);
    }
    if snapshot.state != RunState::Idle {
        bail!("controller is {} after the fault", snapshot.state);
    }
    if tally.closes() != 1 {
        bail!("camera closed {} times", tally.closes());
    }
    Ok(format!("{} after {} frames written", summary.outcome, summary.frames_written))
}
