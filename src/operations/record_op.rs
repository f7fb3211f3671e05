use crate::camera::simulated_camera::SimulatedCamera;
use crate::common::file_utils;
use crate::config_loader::MasterConfig;
use crate::core::controller::{Controller, ControllerConfig, ControllerHandle, RunRequest};
use crate::core::run::{RunId, RunSummary};
use crate::operations::op_helper;
use crate::storage::{FileSinkOpener, SinkTarget};
use crate::workers::connection_worker::ConnectionWorker;
use anyhow::{bail, Context, Result};
use clap::ArgMatches;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

pub async fn handle_record_cli(master_config: &MasterConfig, args: &ArgMatches) -> Result<()> {
    let op_start_time = Instant::now();
    let operation_display_name = "Record";

    let format = op_helper::parse_format_arg(args, master_config.app_settings.file_format)?;
    let output_dir = op_helper::determine_operation_output_dir(master_config, args, "output", Some("recordings"), operation_display_name)?;
    let max_frames = args.get_one::<u64>("frames").copied();
    let duration = args.get_one::<u64>("duration").map(|secs| Duration::from_secs(*secs));
    let mut shot_plan = master_config.acquisition;
    if let Some(frames_per_shot) = args.get_one::<u32>("frames_per_shot") {
        shot_plan.frames_per_shot = *frames_per_shot;
    }
    if let Some(shots_per_group) = args.get_one::<u32>("shots_per_group") {
        shot_plan.shots_per_group = Some(*shots_per_group);
    }

    let mut parameters = master_config.camera.defaults.clone();
    if let Some(exposure) = args.get_one::<f64>("exposure") {
        parameters.exposure_ms = *exposure;
    }

    let base_name = file_utils::generate_timestamped_filename(
        &master_config.camera.name,
        &master_config.app_settings.filename_timestamp_format,
        None,
    );
    let target = SinkTarget::in_directory(format, &output_dir, &base_name);

    let camera = SimulatedCamera::new(master_config.camera.name.clone(), master_config.camera.simulation.clone());
    let controller = Controller::spawn(
        Box::new(camera),
        Arc::new(FileSinkOpener),
        ControllerConfig::from_master(master_config),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let connection = if master_config.socket.enabled {
        let worker = ConnectionWorker::bind(&master_config.socket, controller.clone())
            .await
            .with_context(|| format!("Failed to bind parameter sync socket {}:{}", master_config.socket.bind_address, master_config.socket.port))?;
        Some(worker.spawn(shutdown_rx))
    } else {
        debug!("Parameter sync socket disabled by configuration");
        None
    };
    let temperature_monitor = tokio::spawn(log_temperature(controller.clone()));

    let mut request = RunRequest::new(parameters, target.clone()).with_shot_plan(shot_plan);
    if let Some(frames) = max_frames {
        request = request.with_max_frames(frames);
    }
    let run_id = controller
        .start_run_with(request)
        .await
        .context("Failed to start the acquisition run")?;

    match (max_frames, duration) {
        (None, None) => info!("🎥 Recording {} into '{}' until Ctrl-C...", run_id, target.path.display()),
        _ => info!(
            "🎥 Recording {} into '{}' (frames: {:?}, duration: {:?}, or Ctrl-C)...",
            run_id,
            target.path.display(),
            max_frames,
            duration
        ),
    }
    let summary = wait_for_run_end(&controller, run_id, duration).await?;

    let _ = shutdown_tx.send(true);
    if let Some(connection) = connection {
        if let Err(e) = connection.await {
            warn!("Parameter sync endpoint ended abnormally: {}", e);
        }
    }
    temperature_monitor.abort();
    controller.shutdown().await.context("Controller did not shut down cleanly")?;

    print_summary(&summary)?;
    info!("🏁 '{}' finished in {:?}.", operation_display_name, op_start_time.elapsed());
    if summary.outcome.is_faulted() {
        bail!("Run {} ended {}", summary.run_id, summary.outcome);
    }
    Ok(())
}

/// Resolves when the run completes on its own, the duration elapses or Ctrl-C
/// arrives; in the latter two cases the run is stopped and drained first.
async fn wait_for_run_end(controller: &ControllerHandle, run_id: RunId, duration: Option<Duration>) -> Result<RunSummary> {
    let finished = tokio::select! {
        summary = controller.wait_for_summary(run_id) => Some(summary.context("Controller stopped before the run ended")?),
        _ = deadline(duration) => {
            info!("⏱️ Recording duration reached; stopping {}", run_id);
            None
        }
        _ = ctrl_c() => {
            info!("🛑 Ctrl-C received; stopping {}", run_id);
            None
        }
    };
    if let Some(summary) = finished {
        return Ok(summary);
    }
    match controller.stop_run().await.context("Failed to stop the run")? {
        Some(summary) if summary.run_id == run_id => Ok(summary),
        // The run ended on its own while the stop was on its way.
        _ => controller
            .wait_for_summary(run_id)
            .await
            .context("Controller stopped before the run ended"),
    }
}

async fn deadline(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn log_temperature(controller: ControllerHandle) {
    let mut readings = controller.subscribe_temperature();
    let mut was_stabilized = false;
    while readings.changed().await.is_ok() {
        let reading = match *readings.borrow_and_update() {
            Some(reading) => reading,
            None => continue,
        };
        if reading.stabilized && !was_stabilized {
            info!("🌡️ Sensor stabilized at {:.1}°C (target {:.1}°C)", reading.celsius, reading.target);
        } else {
            debug!("🌡️ Sensor at {:.1}°C (target {:.1}°C)", reading.celsius, reading.target);
        }
        was_stabilized = reading.stabilized;
    }
}

fn print_summary(summary: &RunSummary) -> Result<()> {
    let rendered = serde_json::to_string_pretty(summary).context("Failed to render the run summary")?;
    println!("{}", rendered);
    info!(
        "📋 {} {}: {} captured, {} written, {} dropped, {} lost, {} gaps, versions {:?}",
        summary.run_id,
        summary.outcome,
        summary.frames_captured,
        summary.frames_written,
        summary.frames_dropped,
        summary.frames_lost,
        summary.sequence_gaps,
        summary.applied_versions
    );
    Ok(())
}
