// ABOUTME: Retrying mirrored copy of a project file tree over a remote shell
// ABOUTME: Wraps rsync; each retry is a full re-run relying on mirror semantics

pub mod session;

use futures::future::BoxFuture;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::MigratorError;
use crate::project::ProjectIdentity;
use crate::remote::client::ApiClient;

const IGNORE_FILE: &str = ".exportignore";
const DEFAULT_EXCLUSIONS: [&str; 2] = [".cache", ".local"];

#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Seam over process spawning.
pub trait CommandRunner: Send + Sync {
    fn run<'a>(
        &'a self,
        program: &'a Path,
        args: &'a [String],
    ) -> BoxFuture<'a, std::io::Result<CommandOutput>>;
}

pub struct TokioCommandRunner;

impl CommandRunner for TokioCommandRunner {
    fn run<'a>(
        &'a self,
        program: &'a Path,
        args: &'a [String],
    ) -> BoxFuture<'a, std::io::Result<CommandOutput>> {
        Box::pin(async move {
            let output = tokio::process::Command::new(program)
                .args(args)
                .kill_on_drop(true)
                .output()
                .await?;
            Ok(CommandOutput {
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Local(PathBuf),
    Remote {
        user: String,
        host: String,
        port: u16,
        path: String,
    },
}

impl Endpoint {
    /// rsync operand. Directories end in '/' so their contents are mirrored
    /// rather than the directory itself.
    fn operand(&self) -> String {
        let with_slash = |p: String| if p.ends_with('/') { p } else { format!("{}/", p) };
        match self {
            Endpoint::Local(path) => with_slash(path.display().to_string()),
            Endpoint::Remote {
                user, host, path, ..
            } => format!("{}@{}:{}", user, host, with_slash(path.clone())),
        }
    }

    fn port(&self) -> Option<u16> {
        match self {
            Endpoint::Remote { port, .. } => Some(*port),
            Endpoint::Local(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferSpec {
    pub source: Endpoint,
    pub destination: Endpoint,
    /// `None` mirrors the full tree.
    pub exclusions: Option<Vec<String>>,
    pub retry_budget: u32,
    pub retry_delay: Duration,
    attempt: u32,
}

impl TransferSpec {
    pub fn new(source: Endpoint, destination: Endpoint, retry_budget: u32) -> Self {
        Self {
            source,
            destination,
            exclusions: None,
            retry_budget,
            retry_delay: Duration::ZERO,
            attempt: 0,
        }
    }

    pub fn with_exclusions(mut self, exclusions: Vec<String>) -> Self {
        self.exclusions = Some(exclusions);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Attempts made so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn ssh_command(&self) -> Option<String> {
        self.source
            .port()
            .or(self.destination.port())
            .map(|port| format!("ssh -p {} -oStrictHostKeyChecking=no", port))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    pub attempts: u32,
    pub elapsed: Duration,
}

pub struct FileTransferEngine {
    runner: Arc<dyn CommandRunner>,
    rsync: PathBuf,
}

impl FileTransferEngine {
    pub fn new(runner: Arc<dyn CommandRunner>, rsync: PathBuf) -> Self {
        Self { runner, rsync }
    }

    /// The configured rsync binary, or the first one on `PATH`.
    pub fn locate_rsync(configured: Option<&Path>) -> Result<PathBuf, MigratorError> {
        match configured {
            Some(path) => Ok(path.to_path_buf()),
            None => which::which("rsync").map_err(|_| MigratorError::TransferFailed {
                attempts: 0,
                last_error: "rsync not found on PATH. Install rsync or set transfer.rsync_path"
                    .to_string(),
            }),
        }
    }

    fn exclusion_file(spec: &TransferSpec) -> Result<Option<tempfile::NamedTempFile>, MigratorError> {
        let Some(rules) = &spec.exclusions else {
            return Ok(None);
        };
        let failed = |e: std::io::Error| MigratorError::TransferFailed {
            attempts: 0,
            last_error: format!("could not write exclusion list: {}", e),
        };
        let mut file = tempfile::NamedTempFile::new().map_err(failed)?;
        for rule in rules {
            writeln!(file, "{}", rule).map_err(failed)?;
        }
        file.flush().map_err(failed)?;
        Ok(Some(file))
    }

    fn base_args(spec: &TransferSpec, exclude_from: Option<&Path>) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ssh) = spec.ssh_command() {
            args.push("-e".to_string());
            args.push(ssh);
        }
        if let Some(path) = exclude_from {
            args.push(format!("--exclude-from={}", path.display()));
        }
        args.push(spec.source.operand());
        args.push(spec.destination.operand());
        args
    }

    /// Mirrors source onto destination, re-running the whole copy up to
    /// `retry_budget` times.
    pub async fn transfer(&self, spec: &mut TransferSpec) -> Result<TransferResult, MigratorError> {
        let budget = spec.retry_budget.max(1);
        let exclusions = Self::exclusion_file(spec)?;

        if let Endpoint::Local(dir) = &spec.destination {
            tokio::fs::create_dir_all(dir).await.map_err(|e| MigratorError::TransferFailed {
                attempts: 0,
                last_error: format!("could not create {}: {}", dir.display(), e),
            })?;
        }

        let mut args: Vec<String> = ["--delete", "-P", "-r", "-v", "-i", "-a"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(Self::base_args(spec, exclusions.as_ref().map(|f| f.path())));

        let started = Instant::now();
        let mut last_error = String::new();
        while spec.attempt < budget {
            spec.attempt += 1;
            tracing::info!(
                attempt = spec.attempt,
                budget,
                command = %format!("{} {}", self.rsync.display(), args.join(" ")),
                "Starting file transfer"
            );

            match self.runner.run(&self.rsync, &args).await {
                Ok(output) if output.success() => {
                    let elapsed = started.elapsed();
                    tracing::info!(
                        attempts = spec.attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "File transfer complete"
                    );
                    return Ok(TransferResult {
                        attempts: spec.attempt,
                        elapsed,
                    });
                }
                Ok(output) => {
                    let detail = output.stderr.lines().last().unwrap_or_default().trim();
                    last_error = match output.status {
                        Some(code) => format!("rsync exited with status {}: {}", code, detail),
                        None => format!("rsync was terminated by a signal: {}", detail),
                    };
                }
                Err(err) => last_error = format!("failed to run rsync: {}", err),
            }

            tracing::warn!(attempt = spec.attempt, budget, error = %last_error, "File transfer attempt failed");
            if spec.attempt < budget && !spec.retry_delay.is_zero() {
                tokio::time::sleep(spec.retry_delay).await;
            }
        }

        tracing::warn!(
            attempts = spec.attempt,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "File transfer failed, retry budget exhausted"
        );
        Err(MigratorError::TransferFailed {
            attempts: spec.attempt,
            last_error,
        })
    }

    /// Checksum dry run; returns the paths that still differ, dotfiles
    /// excluded.
    pub async fn verify(&self, spec: &TransferSpec) -> Result<Vec<String>, MigratorError> {
        let exclusions = Self::exclusion_file(spec)?;
        let mut args: Vec<String> = [
            "-n",
            "-r",
            "-c",
            "-a",
            "--delete",
            "--itemize-changes",
            "--out-format=%n",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend(Self::base_args(spec, exclusions.as_ref().map(|f| f.path())));

        let output = self
            .runner
            .run(&self.rsync, &args)
            .await
            .map_err(|e| MigratorError::TransferFailed {
                attempts: 0,
                last_error: format!("failed to run verification: {}", e),
            })?;
        if !output.success() {
            return Err(MigratorError::TransferFailed {
                attempts: 0,
                last_error: format!("verification exited with status {:?}", output.status),
            });
        }

        let differing: Vec<String> = output
            .stdout
            .lines()
            .map(|line| line.trim().trim_start_matches("deleting ").to_string())
            .filter(|path| !path.is_empty() && path != "./" && !is_hidden(path))
            .collect();
        tracing::info!(differing = differing.len(), "Transfer verification finished");
        Ok(differing)
    }
}

fn is_hidden(path: &str) -> bool {
    path.split('/').any(|part| part.starts_with('.') && part != "." && part != "..")
}

/// Exclusion rules from the project's `.exportignore`. Missing file means
/// the defaults; the ignore file itself is never copied. The second value
/// is a warning when the rules could not be read.
pub async fn export_exclusions(
    client: &ApiClient,
    project: &ProjectIdentity,
) -> (Vec<String>, Option<String>) {
    let defaults = || {
        DEFAULT_EXCLUSIONS
            .iter()
            .map(|s| s.to_string())
            .chain(std::iter::once(IGNORE_FILE.to_string()))
            .collect::<Vec<_>>()
    };

    match client.project_file(&project.legacy_path(), IGNORE_FILE).await {
        Ok(body) => {
            let mut rules: Vec<String> = body
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect();
            if !rules.iter().any(|r| r == IGNORE_FILE) {
                rules.push(IGNORE_FILE.to_string());
            }
            tracing::info!(rules = rules.len(), "Using exclusion rules from {}", IGNORE_FILE);
            (rules, None)
        }
        Err(err) if err.is_not_found() => {
            tracing::info!("No {} in project, using default exclusions", IGNORE_FILE);
            (defaults(), None)
        }
        Err(err) => (
            defaults(),
            Some(format!(
                "could not read {} ({}), using default exclusions",
                IGNORE_FILE, err
            )),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialSet;
    use crate::project::{EngineKind, Identity};
    use crate::testing::{client_with, FakeRunner, FakeTransport};
    use reqwest::Method;

    fn remote() -> Endpoint {
        Endpoint::Remote {
            user: "cdsw".into(),
            host: "localhost".into(),
            port: 2222,
            path: "/home/cdsw".into(),
        }
    }

    fn spec(budget: u32, dir: &Path) -> TransferSpec {
        TransferSpec::new(remote(), Endpoint::Local(dir.to_path_buf()), budget)
    }

    #[tokio::test]
    async fn test_exhausts_exactly_the_budget() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::exits(&[12]);
        let engine = FileTransferEngine::new(runner.clone(), PathBuf::from("rsync"));
        let mut spec = spec(3, dir.path());

        let err = engine.transfer(&mut spec).await.unwrap_err();
        match err {
            MigratorError::TransferFailed {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("status 12"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(runner.transfer_calls().len(), 3);
        assert_eq!(spec.attempt(), 3);
    }

    #[tokio::test]
    async fn test_stops_at_first_success() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::exits(&[23, 0]);
        let engine = FileTransferEngine::new(runner.clone(), PathBuf::from("rsync"));
        let mut spec = spec(5, dir.path());

        let result = engine.transfer(&mut spec).await.unwrap();
        assert_eq!(result.attempts, 2);
        assert_eq!(runner.transfer_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_command_shape() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::exits(&[0]);
        let engine = FileTransferEngine::new(runner.clone(), PathBuf::from("/usr/bin/rsync"));
        let mut spec = spec(1, dir.path()).with_exclusions(vec![".cache".into(), "*.tmp".into()]);

        engine.transfer(&mut spec).await.unwrap();
        let call = &runner.calls()[0];
        assert_eq!(call.program, PathBuf::from("/usr/bin/rsync"));
        assert!(call.args.contains(&"--delete".to_string()));
        assert!(call.args.contains(&"ssh -p 2222 -oStrictHostKeyChecking=no".to_string()));
        assert_eq!(call.args[call.args.len() - 2], "cdsw@localhost:/home/cdsw/");
        assert!(call.args.last().unwrap().ends_with('/'));
        assert_eq!(call.exclusions.as_deref(), Some(".cache\n*.tmp\n"));
    }

    #[tokio::test]
    async fn test_no_exclusions_mirrors_everything() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::exits(&[0]);
        let engine = FileTransferEngine::new(runner.clone(), PathBuf::from("rsync"));
        let mut spec = spec(1, dir.path());

        engine.transfer(&mut spec).await.unwrap();
        assert!(runner.calls()[0]
            .args
            .iter()
            .all(|a| !a.starts_with("--exclude-from")));
    }

    #[tokio::test]
    async fn test_verify_ignores_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::exits(&[0]);
        runner.with_dry_run_output("./\nmodels/churn.pkl\n.ipython/profile\ndata/.hidden\ndeleting old.csv\n");
        let engine = FileTransferEngine::new(runner.clone(), PathBuf::from("rsync"));

        let differing = engine.verify(&spec(1, dir.path())).await.unwrap();
        assert_eq!(differing, vec!["models/churn.pkl".to_string(), "old.csv".to_string()]);
    }

    fn project() -> ProjectIdentity {
        ProjectIdentity {
            id: "p1".into(),
            name: "CDV".into(),
            slug: "cdv".into(),
            owner: Some(Identity::new("alice")),
            team: None,
            engine: EngineKind::Runtimes,
            description: None,
            visibility: None,
            shared_memory_limit: None,
        }
    }

    #[tokio::test]
    async fn test_exclusions_from_ignore_file() {
        let fake = FakeTransport::new();
        fake.reply(
            Method::GET,
            "/api/v1/projects/alice/cdv/files/.exportignore",
            200,
            "# scratch\nnode_modules\n\n*.parquet\n",
        );
        let client = client_with(&fake, CredentialSet::new(Some("v1"), Some("v2")));

        let (rules, warning) = export_exclusions(&client, &project()).await;
        assert_eq!(rules, vec!["node_modules", "*.parquet", ".exportignore"]);
        assert!(warning.is_none());
    }

    #[tokio::test]
    async fn test_missing_ignore_file_uses_defaults() {
        let fake = FakeTransport::new();
        let client = client_with(&fake, CredentialSet::new(Some("v1"), Some("v2")));

        let (rules, warning) = export_exclusions(&client, &project()).await;
        assert_eq!(rules, vec![".cache", ".local", ".exportignore"]);
        assert!(warning.is_none());
    }

    #[tokio::test]
    async fn test_no_legacy_token_uses_defaults_with_warning() {
        let fake = FakeTransport::new();
        let client = client_with(&fake, CredentialSet::new(None, Some("v2")));

        let (rules, warning) = export_exclusions(&client, &project()).await;
        assert_eq!(rules.len(), 3);
        assert!(warning.unwrap().contains("legacy"));
        assert!(fake.requests().is_empty());
    }
}
