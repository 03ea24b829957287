//! Node configuration loaded from the JSON configuration file.
//!
//! The file uses PascalCase keys, e.g.
//!
//! ```json
//! {
//!     "MachineName": "builder-01",
//!     "LighthouseServer": "tcp://lighthouse.example.org:5570",
//!     "MaxJobs": 4
//! }
//! ```
//!
//! Only `LighthouseServer` is required. Unknown keys are ignored so the
//! file can be shared with other tools.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Location of the configuration file when `SPARK_CONFIG` is not set.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/laniakea/spark.json";

/// Upper bound for the number of concurrent jobs a node may advertise.
pub const MAX_JOBS_LIMIT: u32 = 100;

/// Runner command used when the configuration does not name one.
pub const DEFAULT_RUNNER: &str = "spark-runner";

/// Default interval between heartbeats (seconds).
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Default time granted to running jobs on shutdown (seconds).
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Capacity
// ---------------------------------------------------------------------------

/// Maximum number of jobs this node runs at once.
///
/// Always within `1..=MAX_JOBS_LIMIT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    max_jobs: u32,
}

impl Capacity {
    /// Build a capacity, returning `None` when `max_jobs` is out of range.
    pub fn new(max_jobs: u32) -> Option<Self> {
        (1..=MAX_JOBS_LIMIT)
            .contains(&max_jobs)
            .then_some(Self { max_jobs })
    }

    /// Build a capacity from an untrusted configured value.
    ///
    /// Out-of-range values fall back to a single job. The second element
    /// carries the warning text when the value had to be reset.
    pub fn clamped(requested: i64) -> (Self, Option<String>) {
        match u32::try_from(requested).ok().and_then(Self::new) {
            Some(capacity) => (capacity, None),
            None => Self::reset(requested),
        }
    }

    /// [`Capacity::clamped`] for a raw JSON number. Fractions and integers
    /// beyond `i64` are reset the same way.
    pub fn from_json(requested: &serde_json::Number) -> (Self, Option<String>) {
        match requested.as_i64() {
            Some(requested) => Self::clamped(requested),
            None => Self::reset(requested),
        }
    }

    fn reset(requested: impl fmt::Display) -> (Self, Option<String>) {
        let warning =
            format!("A number of {requested} jobs looks wrong. Resetting maximum job count to 1.");
        tracing::warn!(requested = %requested, "{warning}");
        (Self::default(), Some(warning))
    }

    pub fn max_jobs(&self) -> u32 {
        self.max_jobs
    }
}

impl Default for Capacity {
    fn default() -> Self {
        Self { max_jobs: 1 }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// On-disk representation, before validation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawConfig {
    machine_name: Option<String>,
    lighthouse_server: Option<String>,
    max_jobs: Option<serde_json::Number>,
    runner: Option<Vec<String>>,
    heartbeat_interval_secs: Option<u64>,
    drain_timeout_secs: Option<u64>,
}

/// Validated node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Explicit machine name; `None` means "use the hostname".
    pub machine_name: Option<String>,
    /// Dispatcher endpoint, as written in the file.
    pub lighthouse_server: String,
    pub capacity: Capacity,
    /// Program and arguments used to execute job payloads.
    pub runner: Vec<String>,
    pub heartbeat_interval: Duration,
    pub drain_timeout: Duration,
    /// Non-fatal problems found while loading (e.g. a clamped `MaxJobs`).
    pub warnings: Vec<String>,
}

impl Config {
    /// Read and validate the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// Validate configuration text. `origin` is only used in error messages.
    pub fn parse(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from(origin),
            source,
        })?;

        let lighthouse_server = raw
            .lighthouse_server
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingServer)?;

        let machine_name = raw
            .machine_name
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let mut warnings = Vec::new();
        let capacity = match raw.max_jobs {
            Some(requested) => {
                let (capacity, warning) = Capacity::from_json(&requested);
                warnings.extend(warning);
                capacity
            }
            None => Capacity::default(),
        };

        let runner = match raw.runner {
            Some(runner) if runner.first().is_some_and(|p| !p.trim().is_empty()) => runner,
            Some(_) => {
                return Err(ConfigError::Invalid {
                    key: "Runner",
                    reason: "the runner command must name a program".to_string(),
                })
            }
            None => vec![DEFAULT_RUNNER.to_string()],
        };

        let heartbeat_secs = raw
            .heartbeat_interval_secs
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS);
        if heartbeat_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "HeartbeatIntervalSecs",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            machine_name,
            lighthouse_server,
            capacity,
            runner,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            drain_timeout: Duration::from_secs(
                raw.drain_timeout_secs.unwrap_or(DEFAULT_DRAIN_TIMEOUT_SECS),
            ),
            warnings,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;

    use super::*;

    fn parse(text: &str) -> Result<Config, ConfigError> {
        Config::parse(text, Path::new("spark.json"))
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse(r#"{"LighthouseServer": "tcp://lh.example.org:5570"}"#).unwrap();
        assert_eq!(config.lighthouse_server, "tcp://lh.example.org:5570");
        assert_eq!(config.capacity.max_jobs(), 1);
        assert!(config.machine_name.is_none());
        assert_eq!(config.runner, vec![DEFAULT_RUNNER.to_string()]);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.drain_timeout, Duration::from_secs(60));
        assert!(config.warnings.is_empty());
    }

    #[test]
    fn machine_name_is_trimmed() {
        let config = parse(
            r#"{"LighthouseServer": "lh:5570", "MachineName": "  builder-01\n", "MaxJobs": 4}"#,
        )
        .unwrap();
        assert_eq!(config.machine_name.as_deref(), Some("builder-01"));
        assert_eq!(config.capacity.max_jobs(), 4);
    }

    #[test]
    fn blank_machine_name_falls_back_to_hostname() {
        let config = parse(r#"{"LighthouseServer": "lh:5570", "MachineName": "   "}"#).unwrap();
        assert!(config.machine_name.is_none());
    }

    #[test]
    fn missing_server_is_fatal() {
        assert_matches!(parse(r#"{"MaxJobs": 2}"#), Err(ConfigError::MissingServer));
        assert_matches!(
            parse(r#"{"LighthouseServer": "  "}"#),
            Err(ConfigError::MissingServer)
        );
    }

    #[test]
    fn oversized_max_jobs_clamps_to_one_with_warning() {
        let config = parse(r#"{"LighthouseServer": "lh:5570", "MaxJobs": 500}"#).unwrap();
        assert_eq!(config.capacity.max_jobs(), 1);
        assert_eq!(config.warnings.len(), 1);
        assert!(config.warnings[0].contains("500"));
    }

    #[test]
    fn non_positive_max_jobs_clamps_to_one() {
        for value in [0, -3] {
            let config =
                parse(&format!(r#"{{"LighthouseServer": "lh:5570", "MaxJobs": {value}}}"#))
                    .unwrap();
            assert_eq!(config.capacity.max_jobs(), 1);
            assert_eq!(config.warnings.len(), 1);
        }
    }

    #[test]
    fn unusable_max_jobs_numbers_clamp_to_one() {
        for value in ["4.0", "2.5", "9223372036854775808", "1e30"] {
            let config =
                parse(&format!(r#"{{"LighthouseServer": "lh:5570", "MaxJobs": {value}}}"#))
                    .unwrap();
            assert_eq!(config.capacity.max_jobs(), 1, "MaxJobs {value}");
            assert_eq!(config.warnings.len(), 1);
        }
    }

    #[test]
    fn upper_bound_is_accepted() {
        let config = parse(r#"{"LighthouseServer": "lh:5570", "MaxJobs": 100}"#).unwrap();
        assert_eq!(config.capacity.max_jobs(), 100);
        assert!(config.warnings.is_empty());
    }

    #[test]
    fn empty_runner_is_rejected() {
        assert_matches!(
            parse(r#"{"LighthouseServer": "lh:5570", "Runner": []}"#),
            Err(ConfigError::Invalid { key: "Runner", .. })
        );
    }

    #[test]
    fn zero_heartbeat_interval_is_rejected() {
        assert_matches!(
            parse(r#"{"LighthouseServer": "lh:5570", "HeartbeatIntervalSecs": 0}"#),
            Err(ConfigError::Invalid {
                key: "HeartbeatIntervalSecs",
                ..
            })
        );
    }

    #[test]
    fn malformed_json_reports_path() {
        let err = parse("{ not json").unwrap_err();
        assert_matches!(err, ConfigError::Parse { .. });
        assert!(err.to_string().contains("spark.json"));
    }

    #[test]
    fn load_reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"LighthouseServer": "ws://127.0.0.1:9000", "MaxJobs": 3, "Runner": ["/bin/sh", "-c", "cat"]}}"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.capacity.max_jobs(), 3);
        assert_eq!(config.runner.len(), 3);
    }

    #[test]
    fn load_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        assert_matches!(
            Config::load(&dir.path().join("absent.json")),
            Err(ConfigError::Read { .. })
        );
    }

    #[test]
    fn capacity_new_rejects_out_of_range() {
        assert!(Capacity::new(0).is_none());
        assert!(Capacity::new(101).is_none());
        assert_eq!(Capacity::new(7).map(|c| c.max_jobs()), Some(7));
    }
}
