use crate::config_loader::MasterConfig;
use crate::storage::FileFormat;
use anyhow::{anyhow, Context, Result};
use clap::ArgMatches;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::time::Instant;
use tokio::task::JoinError;

/// Output directory for an operation: the CLI argument `output_cli_arg_key`
/// when given, otherwise the configured output directory (plus
/// `default_output_subdir`). Created when missing.
pub fn determine_operation_output_dir(
    master_config: &MasterConfig,
    args: &ArgMatches,
    output_cli_arg_key: &str,
    default_output_subdir: Option<&str>,
    operation_display_name: &str,
) -> Result<PathBuf> {
    let output_dir_determine_start = Instant::now();
    let operation_base_output_dir: PathBuf = match args.get_one::<String>(output_cli_arg_key) {
        Some(path_str) => {
            debug!("  Output directory specified via CLI for '{}': {}", operation_display_name, path_str);
            PathBuf::from(path_str)
        }
        None => {
            let mut dir = PathBuf::from(&master_config.app_settings.output_directory);
            if let Some(subdir) = default_output_subdir {
                dir.push(subdir);
            }
            debug!("  Using default output directory for '{}': {}", operation_display_name, dir.display());
            dir
        }
    };

    if !operation_base_output_dir.exists() {
        info!("📁 Output directory {} does not exist. Creating it for '{}'.", operation_base_output_dir.display(), operation_display_name);
        std::fs::create_dir_all(&operation_base_output_dir).with_context(|| {
            format!(
                "❌ Failed to create output directory '{}' for '{}'",
                operation_base_output_dir.display(),
                operation_display_name
            )
        })?;
    } else if !operation_base_output_dir.is_dir() {
        return Err(anyhow!(
            "Output path '{}' for '{}' exists but is not a directory",
            operation_base_output_dir.display(),
            operation_display_name
        ));
    } else {
        info!("ℹ️ Using existing output directory: {} for '{}'", operation_base_output_dir.display(), operation_display_name);
    }
    debug!(
        "  Determined output directory for '{}' as '{}' in {:?}.",
        operation_display_name,
        operation_base_output_dir.display(),
        output_dir_determine_start.elapsed()
    );
    Ok(operation_base_output_dir)
}

/// `--format` when given, otherwise `default`.
pub fn parse_format_arg(args: &ArgMatches, default: FileFormat) -> Result<FileFormat> {
    match args.get_one::<String>("format") {
        Some(name) => name.parse::<FileFormat>().map_err(|e| anyhow!(e)),
        None => Ok(default),
    }
}

/// Sorts the results of `join_all` over spawned tasks into successes and a
/// count of failures, logging each failure.
pub fn collect_task_results<T>(
    results: Vec<std::result::Result<Result<T>, JoinError>>,
    operation_display_name: &str,
) -> (Vec<T>, usize) {
    let mut successes = Vec::with_capacity(results.len());
    let mut operation_errors = 0;
    for (i, task_result) in results.into_iter().enumerate() {
        match task_result {
            Ok(Ok(value)) => successes.push(value),
            Ok(Err(op_err)) => {
                error!("❌ Error during '{}' task {}: {:#}", operation_display_name, i + 1, op_err);
                operation_errors += 1;
            }
            Err(join_err) => {
                error!("💀 Task execution failed (panic or cancellation) for '{}' task {}: {}", operation_display_name, i + 1, join_err);
                operation_errors += 1;
            }
        }
    }
    if operation_errors > 0 {
        warn!(
            "⚠️ '{}' completed with {} error(s) out of {} task(s). Please check logs.",
            operation_display_name,
            operation_errors,
            successes.len() + operation_errors
        );
    }
    (successes, operation_errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::build_cli;
    use futures::future::join_all;

    #[test]
    fn format_argument_overrides_the_default() {
        let matches = build_cli()
            .try_get_matches_from(["acqsync", "record", "--format", "directory"])
            .unwrap();
        let (_, record) = matches.subcommand().unwrap();
        assert_eq!(parse_format_arg(record, FileFormat::Npz).unwrap(), FileFormat::Directory);

        let matches = build_cli().try_get_matches_from(["acqsync", "record"]).unwrap();
        let (_, record) = matches.subcommand().unwrap();
        assert_eq!(parse_format_arg(record, FileFormat::Npz).unwrap(), FileFormat::Npz);
    }

    #[test]
    fn output_dir_defaults_to_config_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MasterConfig::default();
        config.app_settings.output_directory = dir.path().display().to_string();
        let matches = build_cli().try_get_matches_from(["acqsync", "record"]).unwrap();
        let (_, record) = matches.subcommand().unwrap();

        let out = determine_operation_output_dir(&config, record, "output", Some("recordings"), "Record").unwrap();
        assert_eq!(out, dir.path().join("recordings"));
        assert!(out.is_dir());
    }

    #[tokio::test]
    async fn task_failures_are_counted() {
        let tasks = vec![
            tokio::spawn(async { Ok::<_, anyhow::Error>(1) }),
            tokio::spawn(async { Err::<i32, _>(anyhow!("boom")) }),
            tokio::spawn(async { Ok::<_, anyhow::Error>(3) }),
        ];
        let (values, errors) = collect_task_results(join_all(tasks).await, "test");
        assert_eq!(values, vec![1, 3]);
        assert_eq!(errors, 1);
    }
}
