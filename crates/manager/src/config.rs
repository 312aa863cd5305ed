//! Manager configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use csp_security::CompilerOptions;
use networking::AllowListConfig;
use serde::{Deserialize, Serialize};

/// Deployment configuration, loaded from TOML. Every field has a default.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub cache: CacheSection,
    pub allow_list: AllowListSection,
    pub nonce: NonceSection,
    pub reporting: ReportingSection,
    pub logging: LoggingSection,
}

/// Compiled header cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Cache key for this site or tenant.
    pub namespace: String,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
        }
    }
}

/// External allow-list fetching.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllowListSection {
    pub timeout_ms: u64,
    pub cache_ttl_secs: u64,
    /// How long a failed fetch is remembered before the URL is retried.
    pub failure_ttl_secs: u64,
    pub cache_capacity: usize,
}

impl Default for AllowListSection {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            cache_ttl_secs: 300,
            failure_ttl_secs: 30,
            cache_capacity: 64,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NonceSection {
    /// Also splice the nonce into the style directives.
    pub apply_to_styles: bool,
}

/// Violation reporting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingSection {
    /// Emitted as the `report-uri` segment when set.
    pub report_uri: Option<String>,
    /// Summary window, and how long the built-in store keeps records.
    pub retention_days: u32,
    /// Upper bound on `(source, directive)` pairs in the built-in store.
    pub max_records: usize,
    /// Violations waiting for allow-list promotion.
    pub queue_capacity: usize,
    /// Entries kept by the built-in audit log.
    pub audit_capacity: usize,
}

impl Default for ReportingSection {
    fn default() -> Self {
        Self {
            report_uri: None,
            retention_days: 30,
            max_records: 10_000,
            queue_capacity: 1024,
            audit_capacity: 10_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Fallback filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ManagerConfig {
    /// Create a new configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Parse TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.cache.namespace = namespace.to_string();
        self
    }

    pub fn with_report_uri(mut self, report_uri: &str) -> Self {
        self.reporting.report_uri = Some(report_uri.to_string());
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.reporting.retention_days = days;
        self
    }

    pub fn with_style_nonces(mut self, enabled: bool) -> Self {
        self.nonce.apply_to_styles = enabled;
        self
    }

    pub fn with_allow_list_timeout(mut self, timeout: Duration) -> Self {
        self.allow_list.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_log_level(mut self, level: &str) -> Self {
        self.logging.level = level.to_string();
        self
    }

    /// Settings for the allow-list fetcher.
    pub fn allow_list_config(&self) -> AllowListConfig {
        AllowListConfig {
            timeout: Duration::from_millis(self.allow_list.timeout_ms),
            cache_ttl: Duration::from_secs(self.allow_list.cache_ttl_secs),
            failure_ttl: Duration::from_secs(self.allow_list.failure_ttl_secs),
            cache_capacity: self.allow_list.cache_capacity,
        }
    }

    /// Options for the directive compiler.
    pub fn compiler_options(&self) -> CompilerOptions {
        CompilerOptions {
            report_uri: self
                .reporting
                .report_uri
                .clone()
                .filter(|uri| !uri.trim().is_empty()),
        }
    }
}
