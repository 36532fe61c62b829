// ABOUTME: Credential resolution for the two remote API dialects
// ABOUTME: Decides which dialects a run may use; tokens are never swapped across dialects

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ApiError, MigratorError};

/// One version of the remote API contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// v1 endpoints, HTTP basic auth with the API key as user name.
    Legacy,
    /// v2 endpoints, bearer token.
    Current,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Dialect::Legacy => write!(f, "legacy"),
            Dialect::Current => write!(f, "current"),
        }
    }
}

/// Tokens as they come out of the configuration.
#[derive(Clone, Default, Deserialize)]
pub struct CredentialSet {
    #[serde(default)]
    pub legacy: Option<String>,
    #[serde(default)]
    pub current: Option<String>,
}

impl CredentialSet {
    pub fn new(legacy: Option<&str>, current: Option<&str>) -> Self {
        Self {
            legacy: legacy.map(str::to_string),
            current: current.map(str::to_string),
        }
    }
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("legacy", &self.legacy.as_ref().map(|_| "<redacted>"))
            .field("current", &self.current.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Validated view of a [`CredentialSet`]. Downstream code asks this which
/// dialects are usable instead of assuming both are.
#[derive(Clone)]
pub struct ResolvedCredentials {
    legacy: Option<String>,
    current: Option<String>,
}

impl ResolvedCredentials {
    pub fn usable(&self, dialect: Dialect) -> bool {
        self.slot(dialect).is_some()
    }

    pub fn usable_dialects(&self) -> Vec<Dialect> {
        [Dialect::Current, Dialect::Legacy]
            .into_iter()
            .filter(|d| self.usable(*d))
            .collect()
    }

    /// Token configured for exactly this dialect.
    pub fn token(&self, dialect: Dialect) -> Result<&str, ApiError> {
        self.slot(dialect)
            .ok_or(ApiError::CredentialMissing { dialect })
    }

    fn slot(&self, dialect: Dialect) -> Option<&str> {
        match dialect {
            Dialect::Legacy => self.legacy.as_deref(),
            Dialect::Current => self.current.as_deref(),
        }
    }
}

impl fmt::Debug for ResolvedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ResolvedCredentials")
            .field("dialects", &self.usable_dialects())
            .finish()
    }
}

pub struct CredentialResolver;

impl CredentialResolver {
    /// Blank tokens count as absent. Fails only when both slots are empty.
    pub fn resolve(set: &CredentialSet) -> Result<ResolvedCredentials, MigratorError> {
        let clean = |token: &Option<String>| {
            token
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
        };

        let resolved = ResolvedCredentials {
            legacy: clean(&set.legacy),
            current: clean(&set.current),
        };

        if resolved.usable_dialects().is_empty() {
            return Err(MigratorError::NoUsableCredential);
        }

        if !resolved.usable(Dialect::Legacy) {
            tracing::warn!("No legacy API token configured; legacy-only operations will be skipped");
        }
        tracing::info!(dialects = ?resolved.usable_dialects(), "Resolved API credentials");

        Ok(resolved)
    }
}
