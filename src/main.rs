use acqsync::cli;
use acqsync::common::logging_setup;
use acqsync::config_loader;
use acqsync::operations;
use anyhow::{bail, Result};
use log::{debug, error, info};
use std::time::Instant;

#[tokio::main]
async fn main() -> Result<()> {
    let main_start_time = Instant::now();
    let matches = cli::build_cli().get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(|s| s.as_str())
        .unwrap_or(cli::DEFAULT_CONFIG_PATH);

    let config_load_start_time = Instant::now();
    let master_config = match config_loader::load_config(config_path) {
        Ok(cfg) => {
            logging_setup::initialize_logging(Some(&cfg), &matches);
            info!("✅ Configuration loaded from: {} in {:?}", config_path, config_load_start_time.elapsed());
            cfg
        }
        Err(e) => {
            logging_setup::initialize_logging(None, &matches);
            error!("❌ Failed to load configuration from '{}': {:#}. Exiting.", config_path, e);
            return Err(e.context(format!("Failed to load configuration from '{}'", config_path)));
        }
    };

    info!("🚀 acqsync starting with camera '{}'.", master_config.camera.name);

    if let Some((operation_name, sub_matches)) = matches.subcommand() {
        debug!("🎬 Dispatching to subcommand: {}", operation_name);
        let op_start_time = Instant::now();

        let op_result: Result<()> = match operation_name {
            "record" => operations::record_op::handle_record_cli(&master_config, sub_matches).await,
            "inspect" => operations::inspect_op::handle_inspect_cli(&master_config, sub_matches).await,
            "test" => operations::diagnostic_op::handle_diagnostic_cli(&master_config, sub_matches).await,
            other => bail!("Subcommand '{}' not implemented.", other),
        };

        if let Err(e) = op_result {
            error!("❌ Operation '{}' failed after {:?}: {:#}", operation_name, op_start_time.elapsed(), e);
            return Err(e);
        }
        info!("✅ Operation '{}' completed successfully in {:?}.", operation_name, op_start_time.elapsed());
    } else {
        info!("🤔 No subcommand provided. Try 'acqsync record' or 'acqsync --help'.");
    }

    info!("🏁 acqsync finished in {:?}.", main_start_time.elapsed());
    Ok(())
}
