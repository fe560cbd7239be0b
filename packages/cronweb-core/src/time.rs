use chrono::{DateTime, TimeZone, Utc};

/// Milliseconds since the Unix epoch, the unit the log-file prefix and webhook
/// timestamp are expressed in.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current time formatted as ISO-8601, the format every `date_*` column and log
/// header/trailer timestamp uses.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

pub fn ms_to_iso(ms: i64) -> String {
    ms_to_datetime(ms).to_rfc3339()
}

pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Builds the `<ms_epoch>-<shot_id>.log` file name for a shot.
pub fn log_file_name(ms: i64, shot_id: &str) -> String {
    format!("{ms}-{shot_id}.log")
}

/// Parses a `<ms_epoch>-<shot_id>.log` file name, splitting on the single `-`
/// that separates the prefix from the shot id, as the spec requires (the shot
/// id itself never contains `-`, since it is generated as plain hex).
pub fn parse_log_file_name(file_name: &str) -> Option<(i64, String)> {
    let stem = file_name.strip_suffix(".log")?;
    let (ms_part, shot_id) = stem.split_once('-')?;
    let ms: i64 = ms_part.parse().ok()?;
    Some((ms, shot_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_log_file_name() {
        let name = log_file_name(1_700_000_000_123, "deadbeefcafebabe0123456789abcdef");
        let (ms, shot_id) = parse_log_file_name(&name).expect("parses");
        assert_eq!(ms, 1_700_000_000_123);
        assert_eq!(shot_id, "deadbeefcafebabe0123456789abcdef");
    }

    #[test]
    fn rejects_names_without_log_suffix() {
        assert!(parse_log_file_name("not-a-log-file.txt").is_none());
    }
}
