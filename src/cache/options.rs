use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Configuration supplied when building a [`super::CacheSet`].
///
/// Loadable from TOML; every field is optional in the file.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSetOptions {
    /// Bucket size in sectors. Must be a power of two.
    pub bucket_size: u32,
    /// Run the GC-mark consistency check on every bad-key classification.
    pub expensive_checks: bool,
    /// Disable extent coalescing.
    pub key_merging_disabled: bool,
    /// Diagnostics logged per interval before suppression starts.
    pub diag_burst: u32,
    /// Length of the diagnostic rate-limit window in milliseconds.
    pub diag_interval_ms: u64,
}

impl Default for CacheSetOptions {
    fn default() -> Self {
        Self {
            bucket_size: 1024,
            expensive_checks: false,
            key_merging_disabled: false,
            diag_burst: 10,
            diag_interval_ms: 5_000,
        }
    }
}

impl CacheSetOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bucket size in sectors.
    pub fn bucket_size(mut self, sectors: u32) -> Self {
        self.bucket_size = sectors;
        self
    }

    /// Enables or disables the expensive consistency checks.
    pub fn expensive_checks(mut self, enabled: bool) -> Self {
        self.expensive_checks = enabled;
        self
    }

    /// Enables or disables extent coalescing.
    pub fn key_merging_disabled(mut self, disabled: bool) -> Self {
        self.key_merging_disabled = disabled;
        self
    }

    /// Sets the diagnostic rate limit.
    pub fn diag_rate_limit(mut self, burst: u32, interval_ms: u64) -> Self {
        self.diag_burst = burst;
        self.diag_interval_ms = interval_ms;
        self
    }

    /// Checks field ranges.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_size == 0 || !self.bucket_size.is_power_of_two() {
            return Err(Error::Invalid("bucket_size must be a power of two"));
        }
        if self.diag_interval_ms == 0 {
            return Err(Error::Invalid("diag_interval_ms must be positive"));
        }
        Ok(())
    }

    /// Parses and validates options from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: Self = toml::from_str(text).map_err(|err| Error::Config {
            path: "<inline>".into(),
            reason: err.to_string(),
        })?;
        options.validate()?;
        Ok(options)
    }

    /// Reads and validates options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let options: Self = toml::from_str(&text).map_err(|err| Error::Config {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        options.validate()?;
        Ok(options)
    }
}
