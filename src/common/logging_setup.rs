use crate::config_loader::MasterConfig;
use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;

/// Level from `--debug`, then the config's `log_level`, then `info`.
/// `RUST_LOG` still refines individual modules on top of that.
pub fn initialize_logging(config: Option<&MasterConfig>, cli_matches: &clap::ArgMatches) {
    let mut builder = Builder::new();

    let log_level_str = if cli_matches.get_flag("debug") {
        "debug".to_string()
    } else {
        config
            .and_then(|c| c.app_settings.log_level.clone())
            .unwrap_or_else(|| "info".to_string())
    };

    let mut unrecognized = None;
    let level = match log_level_str.to_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        s => {
            unrecognized = Some(s.to_string());
            LevelFilter::Info
        }
    };
    builder.filter_level(level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }

    // Thread names tell the acquisition thread apart from runtime workers.
    builder.format(|buf, record| {
        let thread = std::thread::current();
        writeln!(
            buf,
            "{} {:<5} [{}] {}",
            buf.timestamp_millis(),
            record.level(),
            thread.name().unwrap_or("-"),
            record.args()
        )
    });

    builder.try_init().unwrap_or_else(|e| {
        eprintln!("Failed to initialize logger: {}. Logging might not work as expected.", e);
    });
    if let Some(s) = unrecognized {
        log::warn!("Unrecognized log level '{}', defaulting to info.", s);
    }
}
