// ABOUTME: Remote-shell sessions that host the transfer channel
// ABOUTME: Opened through the workspace CLI; the forwarding process dies with the session

use futures::future::BoxFuture;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::error::MigratorError;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEndpoint {
    pub user: String,
    pub host: String,
    pub port: u16,
}

#[derive(Clone)]
pub struct SessionRequest {
    pub workspace_url: String,
    pub username: String,
    pub api_key: String,
    /// `owner/slug` of the project.
    pub project_path: String,
    /// Runtime to start the session on; `None` for legacy-engine projects.
    pub runtime_id: Option<i64>,
}

impl fmt::Debug for SessionRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionRequest")
            .field("workspace_url", &self.workspace_url)
            .field("username", &self.username)
            .field("api_key", &"<redacted>")
            .field("project_path", &self.project_path)
            .field("runtime_id", &self.runtime_id)
            .finish()
    }
}

/// A live session. Dropping it kills the forwarding process.
pub struct RemoteSession {
    endpoint: SessionEndpoint,
    _forwarder: Option<Child>,
}

impl RemoteSession {
    /// Session not backed by a local process.
    pub fn detached(endpoint: SessionEndpoint) -> Self {
        Self {
            endpoint,
            _forwarder: None,
        }
    }

    pub fn endpoint(&self) -> &SessionEndpoint {
        &self.endpoint
    }
}

pub trait SessionProvider: Send + Sync {
    fn open<'a>(
        &'a self,
        request: &'a SessionRequest,
    ) -> BoxFuture<'a, Result<RemoteSession, MigratorError>>;
}

/// Sessions through `cdswctl login` and `cdswctl ssh-endpoint`.
pub struct CdswctlSessions {
    ctl: PathBuf,
    startup_timeout: Duration,
}

impl CdswctlSessions {
    pub fn new(ctl: PathBuf) -> Self {
        Self {
            ctl,
            startup_timeout: STARTUP_TIMEOUT,
        }
    }

    pub fn locate(configured: Option<&Path>) -> Result<Self, MigratorError> {
        let ctl = match configured {
            Some(path) => path.to_path_buf(),
            None => which::which("cdswctl").map_err(|_| {
                MigratorError::Session(
                    "cdswctl not found on PATH. Install it or set transfer.ctl_path".to_string(),
                )
            })?,
        };
        Ok(Self::new(ctl))
    }

    async fn login(&self, request: &SessionRequest) -> Result<(), MigratorError> {
        let output = Command::new(&self.ctl)
            .args([
                "login",
                "-n",
                request.username.as_str(),
                "-u",
                request.workspace_url.as_str(),
                "-y",
                request.api_key.as_str(),
            ])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| MigratorError::Session(format!("failed to run cdswctl login: {}", e)))?;

        if !output.status.success() {
            return Err(MigratorError::Session(format!(
                "cdswctl login failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn start_forwarder(&self, request: &SessionRequest) -> Result<RemoteSession, MigratorError> {
        let mut command = Command::new(&self.ctl);
        command.args(["ssh-endpoint", "-p", request.project_path.as_str()]);
        if let Some(runtime_id) = request.runtime_id {
            command.arg("-r").arg(runtime_id.to_string());
        }

        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MigratorError::Session(format!("failed to run cdswctl ssh-endpoint: {}", e)))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            MigratorError::Session("cdswctl ssh-endpoint has no stdout".to_string())
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let wait_for_port = async {
            while let Some(line) = lines.next_line().await.map_err(|e| {
                MigratorError::Session(format!("reading cdswctl output failed: {}", e))
            })? {
                tracing::debug!(line = %line, "cdswctl ssh-endpoint");
                if let Some(endpoint) = parse_endpoint(&line) {
                    return Ok(endpoint);
                }
            }
            Err(MigratorError::Session(
                "cdswctl ssh-endpoint exited before reporting a port".to_string(),
            ))
        };

        let endpoint = tokio::time::timeout(self.startup_timeout, wait_for_port)
            .await
            .map_err(|_| {
                MigratorError::Session(format!(
                    "no session endpoint within {}s",
                    self.startup_timeout.as_secs()
                ))
            })??;

        // Keep draining so the forwarder never writes into a closed pipe.
        tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

        tracing::info!(port = endpoint.port, host = %endpoint.host, project = %request.project_path, "Remote session ready");
        Ok(RemoteSession {
            endpoint,
            _forwarder: Some(child),
        })
    }
}

impl SessionProvider for CdswctlSessions {
    fn open<'a>(
        &'a self,
        request: &'a SessionRequest,
    ) -> BoxFuture<'a, Result<RemoteSession, MigratorError>> {
        Box::pin(async move {
            self.login(request).await?;
            self.start_forwarder(request).await
        })
    }
}

/// Pulls the endpoint out of a line like `ssh -p 4321 cdsw@localhost`.
fn parse_endpoint(line: &str) -> Option<SessionEndpoint> {
    const MARKER: &str = "ssh -p ";
    let rest = &line[line.find(MARKER)? + MARKER.len()..];
    let mut parts = rest.split_whitespace();
    let port = parts.next()?.parse().ok()?;
    let target = parts.next().unwrap_or("cdsw@localhost");
    let (user, host) = target.split_once('@').unwrap_or(("cdsw", target));
    Some(SessionEndpoint {
        user: user.to_string(),
        host: host.to_string(),
        port,
    })
}
