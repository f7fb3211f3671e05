use clap::{Arg, ArgAction, Command};
use log::debug;
use std::time::Instant;

pub const DEFAULT_CONFIG_PATH: &str = "config/acqsync.yaml";

pub fn build_cli() -> Command {
    debug!("⚙️ Building CLI interface...");
    let start_time = Instant::now();
    let cmd = Command::new("acqsync")
        .version("0.1.0")
        .author("acqsync developers")
        .about("Continuous camera acquisition with buffered persistence and live parameter synchronization.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Sets a custom configuration file")
                .default_value(DEFAULT_CONFIG_PATH)
                .action(ArgAction::Set)
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .help("Enable debug logging")
                .action(ArgAction::SetTrue)
        )
        .subcommand(
            Command::new("record")
                .about("Runs one acquisition with the configured camera and prints its summary")
                .arg(Arg::new("frames").long("frames").value_name("COUNT").help("Stop after this many frames").value_parser(clap::value_parser!(u64)).action(ArgAction::Set))
                .arg(Arg::new("frames_per_shot").long("frames-per-shot").value_name("COUNT").help("Frames read out per shot (default from config)").value_parser(clap::value_parser!(u32).range(1..)).action(ArgAction::Set))
                .arg(Arg::new("shots_per_group").long("shots-per-group").value_name("COUNT").help("Checkpoint the recording every COUNT shots").value_parser(clap::value_parser!(u32).range(1..)).action(ArgAction::Set))
                .arg(Arg::new("duration").long("duration").value_name("SECONDS").help("Stop after this many seconds").value_parser(clap::value_parser!(u64)).action(ArgAction::Set))
                .arg(Arg::new("format").short('f').long("format").value_name("FORMAT").help("Output format: stream, npz or directory (default from config)").action(ArgAction::Set))
                .arg(Arg::new("exposure").long("exposure").value_name("MS").help("Exposure time in milliseconds").value_parser(clap::value_parser!(f64)).action(ArgAction::Set))
                .arg(Arg::new("output").short('o').long("output").value_name("DIR").help("Output directory for the recording").action(ArgAction::Set))
        )
        .subcommand(
            Command::new("inspect")
                .about("Reads a recording back and prints its frame metadata")
                .arg(Arg::new("path").value_name("PATH").required(true).help("Recording file or directory").action(ArgAction::Set))
                .arg(Arg::new("format").short('f').long("format").value_name("FORMAT").help("Recording format (default: detected from the path)").action(ArgAction::Set))
                .arg(Arg::new("export-png").long("export-png").value_name("DIR").help("Write every frame as a 16-bit grayscale PNG into DIR").action(ArgAction::Set))
        )
        .subcommand(
            Command::new("test")
                .about("Runs a diagnostic test suite against the simulated camera")
        );
    debug!("✅ CLI interface built in {:?}", start_time.elapsed());
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_arguments_parse() {
        let matches = build_cli()
            .try_get_matches_from(["acqsync", "-d", "record", "--frames", "100", "--exposure", "10", "-f", "npz"])
            .unwrap();
        assert!(matches.get_flag("debug"));
        assert_eq!(matches.get_one::<String>("config").unwrap(), DEFAULT_CONFIG_PATH);
        let (name, record) = matches.subcommand().unwrap();
        assert_eq!(name, "record");
        assert_eq!(record.get_one::<u64>("frames"), Some(&100));
        assert_eq!(record.get_one::<f64>("exposure"), Some(&10.0));
        assert_eq!(record.get_one::<u32>("shots_per_group"), None);
    }

    #[test]
    fn shot_grouping_arguments_parse() {
        let matches = build_cli()
            .try_get_matches_from(["acqsync", "record", "--frames-per-shot", "2", "--shots-per-group", "50"])
            .unwrap();
        let (_, record) = matches.subcommand().unwrap();
        assert_eq!(record.get_one::<u32>("frames_per_shot"), Some(&2));
        assert_eq!(record.get_one::<u32>("shots_per_group"), Some(&50));
        assert!(build_cli()
            .try_get_matches_from(["acqsync", "record", "--shots-per-group", "0"])
            .is_err());
    }

    #[test]
    fn inspect_requires_a_path() {
        assert!(build_cli().try_get_matches_from(["acqsync", "inspect"]).is_err());
    }
}
