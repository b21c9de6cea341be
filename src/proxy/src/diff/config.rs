use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_ENTRIES: usize = 2;
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_MAX_EXECUTION_TIME_DIFFERENCE: i64 = 10;
pub const DEFAULT_MAX_REQUEST_LAG: usize = 10;
pub const DEFAULT_RETAIN_STATEMENTS: usize = 5;
pub const DEFAULT_QPS_WINDOW: Duration = Duration::from_secs(15 * 60);

/// What results should be EXPLAINed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Explain {
    None,
    #[default]
    Other,
    Both,
}

/// What to do when a non-main connection fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Ignore,
    Close,
}

/// When to generate the report for an SQL command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Report {
    Always,
    #[default]
    OnDiscrepancy,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Recognized options of the comparison router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    /// Server from which responses are returned to the client.
    pub main: String,
    /// The service this router is installed for.
    pub service: String,
    /// During `period`, at most how many times a canonical statement is
    /// explained. 0 disables EXPLAIN entirely.
    pub entries: usize,
    #[serde(with = "duration_ms")]
    pub period: Duration,
    pub explain: Explain,
    /// Percent difference between main and other execution time beyond
    /// which the result is reported.
    pub max_execution_time_difference: i64,
    /// How many requests an other may lag behind main before plain SELECTs
    /// are no longer sent to it.
    pub max_request_lag: usize,
    pub on_error: OnError,
    pub report: Report,
    /// Reset and restart replication on previously stopped others when the
    /// comparison is stopped.
    pub reset_replication: bool,
    pub retain_faster_statements: usize,
    pub retain_slower_statements: usize,
    #[serde(with = "duration_ms")]
    pub qps_window: Duration,
    pub data_dir: PathBuf,
}

impl Default for DiffConfig {
    fn default() -> Self {
        DiffConfig {
            main: String::new(),
            service: String::new(),
            entries: DEFAULT_ENTRIES,
            period: DEFAULT_PERIOD,
            explain: Explain::default(),
            max_execution_time_difference: DEFAULT_MAX_EXECUTION_TIME_DIFFERENCE,
            max_request_lag: DEFAULT_MAX_REQUEST_LAG,
            on_error: OnError::default(),
            report: Report::default(),
            reset_replication: false,
            retain_faster_statements: DEFAULT_RETAIN_STATEMENTS,
            retain_slower_statements: DEFAULT_RETAIN_STATEMENTS,
            qps_window: DEFAULT_QPS_WINDOW,
            data_dir: PathBuf::from("/var/lib/diff-proxy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DiffConfig::default();
        assert_eq!(config.entries, 2);
        assert_eq!(config.max_execution_time_difference, 10);
        assert_eq!(config.max_request_lag, 10);
        assert_eq!(config.report, Report::OnDiscrepancy);
        assert!(!config.reset_replication);
    }

    #[test]
    fn test_deserialize_recognized_options() {
        let config: DiffConfig = serde_json::from_str(
            r#"{
                "main": "server1",
                "service": "MyService",
                "entries": 1,
                "period": 60000,
                "explain": "both",
                "report": "always",
                "on_error": "close"
            }"#,
        )
        .unwrap();
        assert_eq!(config.main, "server1");
        assert_eq!(config.period, Duration::from_secs(60));
        assert_eq!(config.explain, Explain::Both);
        assert_eq!(config.report, Report::Always);
        assert_eq!(config.on_error, OnError::Close);
    }
}
