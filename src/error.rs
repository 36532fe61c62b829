// ABOUTME: Custom error types for the migrator
// ABOUTME: Provides context-specific error variants with actionable messages

use std::fmt;

use crate::credentials::Dialect;

/// Failure of a single remote API call, after any local retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// No token is available for the dialect the call needs. Raised before
    /// anything touches the network.
    CredentialMissing { dialect: Dialect },
    /// 4xx response. Never retried.
    ClientError { status: u16, body: String },
    /// Connection failures, timeouts and 5xx responses that outlived the
    /// retry ceiling.
    TransientNetwork { attempts: u32, last_error: String },
    Decode { endpoint: String, message: String },
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::ClientError { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Server-provided message when the body is a JSON error document,
    /// otherwise the raw body.
    pub fn server_message(&self) -> Option<String> {
        let ApiError::ClientError { body, .. } = self else {
            return None;
        };
        let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
        let message = parsed.as_ref().and_then(|value| {
            value
                .get("message")
                .or_else(|| value.get("error"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        });
        Some(message.unwrap_or_else(|| body.clone()))
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ApiError::CredentialMissing { dialect } => write!(
                f,
                "Credential error: no {} API token configured. Add one to the credentials section of the configuration",
                dialect
            ),
            ApiError::ClientError { status, body } => {
                write!(f, "API error: request rejected with status {}: {}", status, body)
            }
            ApiError::TransientNetwork {
                attempts,
                last_error,
            } => write!(
                f,
                "Network error: giving up after {} attempts: {}. The workspace may be unreachable",
                attempts, last_error
            ),
            ApiError::Decode { endpoint, message } => {
                write!(f, "API error: unexpected response from {}: {}", endpoint, message)
            }
        }
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug)]
pub enum MigratorError {
    NoUsableCredential,
    Api(ApiError),
    ProjectNotFound(String),
    NoRuntimeAvailable,
    ReentrantAcquire { project_id: String },
    TransferFailed { attempts: u32, last_error: String },
    Session(String),
    Store(String),
    Cancelled,
    Panicked(String),
}

impl MigratorError {
    /// Short machine-readable code, used in the report.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoUsableCredential => "no_usable_credential",
            Self::Api(ApiError::CredentialMissing { .. }) => "credential_missing",
            Self::Api(ApiError::ClientError { .. }) => "client_error",
            Self::Api(ApiError::TransientNetwork { .. }) => "transient_network_error",
            Self::Api(ApiError::Decode { .. }) => "decode_error",
            Self::ProjectNotFound(_) => "project_not_found",
            Self::NoRuntimeAvailable => "no_runtime_available",
            Self::ReentrantAcquire { .. } => "reentrant_acquire",
            Self::TransferFailed { .. } => "transfer_failed",
            Self::Session(_) => "session_error",
            Self::Store(_) => "store_error",
            Self::Cancelled => "cancelled",
            Self::Panicked(_) => "panicked",
        }
    }
}

impl fmt::Display for MigratorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MigratorError::NoUsableCredential => write!(
                f,
                "Credential error: neither a legacy nor a current API token is configured"
            ),
            MigratorError::Api(err) => write!(f, "{}", err),
            MigratorError::ProjectNotFound(name) => write!(
                f,
                "Validation error: project '{}' not found in owned or accessible projects",
                name
            ),
            MigratorError::NoRuntimeAvailable => write!(
                f,
                "Runtime error: the workspace lists no runtimes, so no transfer session can be started"
            ),
            MigratorError::ReentrantAcquire { project_id } => write!(
                f,
                "Permission error: ownership of project {} is already held by this run",
                project_id
            ),
            MigratorError::TransferFailed {
                attempts,
                last_error,
            } => write!(
                f,
                "Migration error: file transfer failed after {} attempts: {}",
                attempts, last_error
            ),
            MigratorError::Session(msg) => write!(f, "Connection error: {}", msg),
            MigratorError::Store(msg) => write!(f, "Storage error: {}", msg),
            MigratorError::Cancelled => write!(f, "Migration error: run cancelled"),
            MigratorError::Panicked(msg) => write!(f, "Migration error: task panicked: {}", msg),
        }
    }
}

impl std::error::Error for MigratorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MigratorError::Api(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ApiError> for MigratorError {
    fn from(err: ApiError) -> Self {
        MigratorError::Api(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_prefers_json_message_field() {
        let err = ApiError::ClientError {
            status: 400,
            body: r#"{"message":"subdomain taken"}"#.to_string(),
        };
        assert_eq!(err.server_message().as_deref(), Some("subdomain taken"));

        let plain = ApiError::ClientError {
            status: 403,
            body: "forbidden".to_string(),
        };
        assert_eq!(plain.server_message().as_deref(), Some("forbidden"));
    }

    #[test]
    fn test_api_errors_keep_their_code_through_conversion() {
        let err: MigratorError = ApiError::CredentialMissing {
            dialect: Dialect::Legacy,
        }
        .into();
        assert_eq!(err.code(), "credential_missing");
        assert!(err.to_string().contains("legacy"));
    }
}
