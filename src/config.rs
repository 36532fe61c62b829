// ABOUTME: Run configuration handed to the migration core
// ABOUTME: Loaded from TOML by the binary; the core only ever reads it

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::credentials::{CredentialSet, Dialect};

/// How TLS certificates of the workspace are checked.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum TlsPolicy {
    /// Validate against `ca_bundle`, or the system trust store when unset.
    Verify {
        #[serde(default)]
        ca_bundle: Option<PathBuf>,
    },
    SystemDefault,
    /// Skip verification entirely. Logged once per process.
    Disabled,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        TlsPolicy::SystemDefault
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub timeout_secs: u64,
    /// Log request and response bodies at debug level.
    pub verbose: bool,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            timeout_secs: 30,
            verbose: false,
        }
    }
}

impl ApiSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub retry_budget: u32,
    pub retry_delay_ms: u64,
    /// Run a checksum dry-run after each transfer.
    pub verify: bool,
    pub rsync_path: Option<PathBuf>,
    pub ctl_path: Option<PathBuf>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            retry_budget: 3,
            retry_delay_ms: 0,
            verify: false,
            rsync_path: None,
            ctl_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetadataSettings {
    /// Upper bound on in-flight detail requests per category.
    pub concurrency: usize,
    /// Dialect used to list jobs, models and applications on export.
    pub dialect: Dialect,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            dialect: Dialect::Current,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    pub workspace_url: String,
    /// Acting identity for ownership elevation and session login.
    pub username: String,
    #[serde(default)]
    pub tls: TlsPolicy,
    #[serde(default)]
    pub credentials: CredentialSet,
    /// Scratch directory on the bastion host.
    pub local_root: PathBuf,
    #[serde(default = "default_remote_root")]
    pub remote_root: String,
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub metadata: MetadataSettings,
    /// Mint a current-dialect token from the legacy one when only the
    /// legacy token is configured.
    #[serde(default = "default_true")]
    pub derive_current_token: bool,
}

fn default_remote_root() -> String {
    "/home/cdsw/".to_string()
}

fn default_true() -> bool {
    true
}

impl Configuration {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        let config = Self::from_toml_str(&raw)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Configuration =
            toml::from_str(raw).context("Failed to parse configuration TOML")?;
        config.validate()
    }

    pub fn validate(mut self) -> Result<Self> {
        if self.workspace_url.trim().is_empty() {
            anyhow::bail!("workspace_url must not be empty");
        }
        if self.username.trim().is_empty() {
            anyhow::bail!("username must not be empty");
        }
        self.workspace_url = self.workspace_url.trim_end_matches('/').to_string();
        self.api.max_attempts = self.api.max_attempts.max(1);
        self.transfer.retry_budget = self.transfer.retry_budget.max(1);
        self.metadata.concurrency = self.metadata.concurrency.max(1);
        Ok(self)
    }
}
