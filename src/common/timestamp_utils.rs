use chrono::{DateTime, Local, SecondsFormat, Utc};

// Get current local timestamp as a formatted string
pub fn current_local_timestamp_str(format_str: &str) -> String {
    let now: DateTime<Local> = Local::now();
    now.format(format_str).to_string()
}

/// Frame timestamps are UTC with nanosecond precision.
pub fn format_frame_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn frame_timestamps_keep_nanoseconds() {
        let ts = Utc.timestamp_nanos(1_700_000_000_000_000_007);
        assert_eq!(format_frame_timestamp(&ts), "2023-11-14T22:13:20.000000007Z");
    }
}
