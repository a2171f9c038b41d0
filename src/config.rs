use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Execution limits and policies shared by every pipeline run on an engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Abort an execution once it has run this long.
    pub timeout_ms: Option<u64>,
    /// Default for `$unwind` stages that do not set `preserveNullAndEmptyArrays`.
    pub preserve_empty_unwind: bool,
    /// Upper bound on distinct keys held by `$group` / `$collapse`.
    pub max_group_keys: Option<usize>,
}

impl EngineConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_group_keys(mut self, limit: usize) -> Self {
        self.max_group_keys = Some(limit);
        self
    }

    pub fn with_preserve_empty_unwind(mut self, preserve: bool) -> Self {
        self.preserve_empty_unwind = preserve;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Read `OXIPIPE_TIMEOUT_MS`, `OXIPIPE_PRESERVE_EMPTY_UNWIND` and
    /// `OXIPIPE_MAX_GROUP_KEYS`. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(raw) = lookup("OXIPIPE_TIMEOUT_MS") {
            config.timeout_ms = Some(parse_var("OXIPIPE_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = lookup("OXIPIPE_PRESERVE_EMPTY_UNWIND") {
            config.preserve_empty_unwind = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(Error::InvalidInput(format!(
                        "OXIPIPE_PRESERVE_EMPTY_UNWIND: expected a boolean, got '{raw}'"
                    )));
                }
            };
        }
        if let Some(raw) = lookup("OXIPIPE_MAX_GROUP_KEYS") {
            config.max_group_keys = Some(parse_var("OXIPIPE_MAX_GROUP_KEYS", &raw)?);
        }
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::InvalidInput(format!("{key}: cannot parse '{raw}'")))
}
