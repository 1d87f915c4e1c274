use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::SmartScan;

/// Process configuration, read from `CHATBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// JSON array of businesses loaded into the directory at startup.
    pub businesses: PathBuf,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger a rewrite.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// Tuning for businesses on the smart slot policy.
    pub smart_scan: SmartScan,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7878,
            data_dir: PathBuf::from("./data"),
            businesses: PathBuf::from("./config/businesses.json"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            smart_scan: SmartScan::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset or unparsable values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bind: lookup("CHATBOOK_BIND").unwrap_or(defaults.bind),
            port: lookup("CHATBOOK_PORT")
                .and_then(|v| parse_opt(&v))
                .unwrap_or(defaults.port),
            data_dir: lookup("CHATBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            businesses: lookup("CHATBOOK_BUSINESSES")
                .map(PathBuf::from)
                .unwrap_or(defaults.businesses),
            max_connections: lookup("CHATBOOK_MAX_CONNECTIONS")
                .and_then(|v| parse_opt(&v))
                .unwrap_or(defaults.max_connections),
            compact_threshold: lookup("CHATBOOK_COMPACT_THRESHOLD")
                .and_then(|v| parse_opt(&v))
                .unwrap_or(defaults.compact_threshold),
            metrics_port: lookup("CHATBOOK_METRICS_PORT").and_then(|v| parse_opt(&v)),
            smart_scan: SmartScan {
                step_minutes: lookup("CHATBOOK_SMART_STEP_MINUTES")
                    .and_then(|v| parse_opt(&v))
                    .filter(|m| *m > 0)
                    .unwrap_or(defaults.smart_scan.step_minutes),
                min_gap_minutes: lookup("CHATBOOK_SMART_MIN_GAP_MINUTES")
                    .and_then(|v| parse_opt(&v))
                    .unwrap_or(defaults.smart_scan.min_gap_minutes),
            },
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_opt<T: FromStr>(v: &str) -> Option<T> {
    v.trim().parse().ok()
}
