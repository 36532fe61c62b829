// ABOUTME: Migration state machine sequencing credentials, runtime, ownership, metadata and transfer
// ABOUTME: Every run that elevates ownership passes through release before it ends

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Configuration;
use crate::credentials::{CredentialResolver, Dialect};
use crate::error::MigratorError;
use crate::metadata::canonical::ProjectSnapshot;
use crate::metadata::MetadataCollector;
use crate::ownership::OwnershipManager;
use crate::project::{Identity, ProjectIdentity};
use crate::remote::client::ApiClient;
use crate::remote::models::CreateProjectRequest;
use crate::remote::transport::{ReqwestTransport, Transport};
use crate::report::{Direction, MigrationReport, ReportAccumulator, WarningKind};
use crate::runtime::{RuntimeCatalog, RuntimeResolver};
use crate::store::{LocalSnapshotStore, SnapshotStore};
use crate::transfer::session::{CdswctlSessions, SessionProvider, SessionRequest};
use crate::transfer::{
    export_exclusions, CommandRunner, Endpoint, FileTransferEngine, TokioCommandRunner, TransferSpec,
};

const NEW_PROJECT_TEMPLATE: &str = "blank";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    CredentialsResolved,
    RuntimeSelected,
    OwnershipAcquired,
    MetadataPhase,
    TransferPhase,
    OwnershipReleased,
    Done,
    Failed,
}

/// External systems the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub sessions: Arc<dyn SessionProvider>,
    pub runner: Arc<dyn CommandRunner>,
    pub store: Arc<dyn SnapshotStore>,
}

/// A failed run: the fatal error plus the report built up to that point.
#[derive(Debug)]
pub struct RunFailure {
    pub error: MigratorError,
    pub report: MigrationReport,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Project state carried from the locate step into the ownership scope.
struct Located {
    project: ProjectIdentity,
    catalog: Option<RuntimeCatalog>,
    runtime_id: Option<i64>,
    /// Import only.
    snapshot: Option<ProjectSnapshot>,
}

pub struct Orchestrator {
    config: Configuration,
    collaborators: Collaborators,
    engine: FileTransferEngine,
}

impl Orchestrator {
    pub fn new(config: Configuration, collaborators: Collaborators) -> Self {
        let rsync = config
            .transfer
            .rsync_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("rsync"));
        let engine = FileTransferEngine::new(collaborators.runner.clone(), rsync);
        Self {
            config,
            collaborators,
            engine,
        }
    }

    /// Production wiring: reqwest, cdswctl sessions, rsync on the bastion
    /// and the local snapshot store under `local_root`.
    pub fn from_config(mut config: Configuration) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(&config.tls, config.api.timeout())?;
        let sessions = CdswctlSessions::locate(config.transfer.ctl_path.as_deref())?;
        let rsync = FileTransferEngine::locate_rsync(config.transfer.rsync_path.as_deref())?;
        config.transfer.rsync_path = Some(rsync);
        let store = LocalSnapshotStore::new(config.local_root.clone());

        Ok(Self::new(
            config,
            Collaborators {
                transport: Arc::new(transport),
                sessions: Arc::new(sessions),
                runner: Arc::new(TokioCommandRunner),
                store: Arc::new(store),
            },
        ))
    }

    /// Runs one migration of `project_name` in `direction`. Cancelling
    /// `cancel` aborts the current phase; ownership is still restored.
    pub async fn run(
        &self,
        direction: Direction,
        project_name: &str,
        cancel: CancellationToken,
    ) -> Result<MigrationReport, RunFailure> {
        let report = ReportAccumulator::new(direction, project_name);
        report.transition(RunState::Init);

        match self.execute(direction, project_name, &cancel, &report).await {
            Ok(()) => {
                report.transition(RunState::Done);
                let mut report = report.finish(None);
                self.record_manual_steps(&mut report).await;
                tracing::info!(project = project_name, %direction, status = %report.status, "Migration finished");
                Ok(report)
            }
            Err(error) => {
                report.transition(RunState::Failed);
                tracing::error!(project = project_name, %direction, error = %error, "Migration failed");
                let mut report = report.finish(Some(&error));
                self.record_manual_steps(&mut report).await;
                Err(RunFailure { error, report })
            }
        }
    }

    async fn execute(
        &self,
        direction: Direction,
        project_name: &str,
        cancel: &CancellationToken,
        report: &ReportAccumulator,
    ) -> Result<(), MigratorError> {
        let client = self.client().await?;
        report.transition(RunState::CredentialsResolved);

        if cancel.is_cancelled() {
            return Err(MigratorError::Cancelled);
        }

        let located = match direction {
            Direction::Export => self.locate_source(&client, project_name).await?,
            Direction::Import => self.locate_target(&client, project_name).await?,
        };
        report.transition(RunState::RuntimeSelected);

        let manager = OwnershipManager::new(&client);
        let acting = Identity::new(self.config.username.as_str());
        let outcome = manager
            .scoped(&located.project.id, &acting, cancel, |_token| async {
                report.transition(RunState::OwnershipAcquired);
                self.elevated_phases(direction, &client, &located, report).await
            })
            .await;

        if outcome.acquired {
            report.transition(RunState::OwnershipReleased);
        }
        if let Some(err) = outcome.restore_error {
            let owner = located
                .project
                .owner
                .as_ref()
                .map(Identity::as_str)
                .unwrap_or("(unknown)");
            report.warn(
                WarningKind::OwnershipRestoreFailed,
                format!(
                    "project {} is still owned by {}; restore owner {} by hand: {}",
                    located.project.name, acting, owner, err
                ),
            );
        }
        outcome.result
    }

    async fn client(&self) -> Result<ApiClient, MigratorError> {
        let resolved = CredentialResolver::resolve(&self.config.credentials)?;
        tracing::info!(dialects = ?resolved.usable_dialects(), "Resolved credentials");
        let client = ApiClient::new(
            &self.config.workspace_url,
            resolved,
            self.collaborators.transport.clone(),
            &self.config.api,
            &self.config.tls,
        );

        if self.config.derive_current_token
            && !client.usable(Dialect::Current)
            && client.usable(Dialect::Legacy)
        {
            if let Err(err) = client.derive_current_token(&self.config.username).await {
                tracing::warn!(error = %err, "Could not derive a current-dialect token; current-only calls will fail");
            }
        }
        Ok(client)
    }

    async fn select_runtime(
        &self,
        client: &ApiClient,
        project: &ProjectIdentity,
    ) -> Result<(Option<RuntimeCatalog>, Option<i64>), MigratorError> {
        if !project.uses_runtimes() {
            tracing::info!(project = %project.name, "Legacy engine project, no runtime needed");
            return Ok((None, None));
        }
        let catalog = RuntimeCatalog::fetch(client).await?;
        let chosen = RuntimeResolver::default().select(&catalog.descriptors())?;
        Ok((Some(catalog), Some(chosen.id)))
    }

    async fn locate_source(
        &self,
        client: &ApiClient,
        project_name: &str,
    ) -> Result<Located, MigratorError> {
        let project = ProjectIdentity::locate(client, project_name).await?;
        tracing::info!(project = %project.name, id = %project.id, owner = ?project.owner, "Located source project");
        let (catalog, runtime_id) = self.select_runtime(client, &project).await?;
        Ok(Located {
            project,
            catalog,
            runtime_id,
            snapshot: None,
        })
    }

    /// Loads the exported snapshot and finds the target project, creating
    /// it when missing.
    async fn locate_target(
        &self,
        client: &ApiClient,
        project_name: &str,
    ) -> Result<Located, MigratorError> {
        let snapshot = self.collaborators.store.load(project_name).await?;

        let project = match ProjectIdentity::locate(client, project_name).await {
            Ok(project) => {
                tracing::info!(project = %project.name, id = %project.id, "Target project exists");
                project
            }
            Err(MigratorError::ProjectNotFound(_)) => {
                let source = &snapshot.project;
                let request = CreateProjectRequest {
                    name: source.name.clone(),
                    template: NEW_PROJECT_TEMPLATE.to_string(),
                    description: source.description.clone(),
                    visibility: source.visibility.clone(),
                    default_project_engine_type: Some(source.engine.as_api_str().to_string()),
                    shared_memory_limit: source.shared_memory_limit,
                    team_name: source.team.clone(),
                    environment: source.environment.clone(),
                };
                let id = client.create_project(&request).await?;
                tracing::info!(project = %source.name, id = %id, "Created target project");
                ProjectIdentity::from_payload(client.get_project(&id).await?)
            }
            Err(err) => return Err(err),
        };

        let (catalog, runtime_id) = self.select_runtime(client, &project).await?;
        Ok(Located {
            project,
            catalog,
            runtime_id,
            snapshot: Some(snapshot),
        })
    }

    async fn elevated_phases(
        &self,
        direction: Direction,
        client: &ApiClient,
        located: &Located,
        report: &ReportAccumulator,
    ) -> Result<(), MigratorError> {
        // Legacy paths follow the owner, which elevation may have changed.
        let mut project = located.project.refresh(client).await?;
        project.team = located.project.team.clone();

        report.transition(RunState::MetadataPhase);
        let collector = MetadataCollector::new(client, report, self.config.metadata.concurrency);
        let exported = match direction {
            Direction::Export => {
                let mut snapshot = collector
                    .collect(&project, self.config.metadata.dialect, located.catalog.as_ref())
                    .await?;
                snapshot.project.owner = located
                    .project
                    .owner
                    .as_ref()
                    .map(|o| o.as_str().to_string());
                self.collaborators.store.save(&snapshot).await?;
                Some(snapshot)
            }
            Direction::Import => {
                if let Some(snapshot) = &located.snapshot {
                    collector
                        .materialize(snapshot, &project, located.catalog.as_ref())
                        .await?;
                    collector.validate(snapshot, &project).await;
                }
                None
            }
        };

        report.transition(RunState::TransferPhase);
        self.transfer_files(direction, client, &project, located.runtime_id, report)
            .await?;

        // After the transfer, which mirrors the source tree with --delete.
        if let Some(snapshot) = exported {
            self.write_placeholders(&snapshot, report).await;
        }
        Ok(())
    }

    async fn write_placeholders(&self, snapshot: &ProjectSnapshot, report: &ReportAccumulator) {
        match self
            .collaborators
            .store
            .write_script_placeholders(&snapshot.project.name, &snapshot.applications)
            .await
        {
            Ok(written) if !written.is_empty() => {
                tracing::info!(count = written.len(), "Wrote placeholders for system scripts");
            }
            Ok(_) => {}
            Err(err) => report.warn(
                WarningKind::ScriptPlaceholder,
                format!("could not create script placeholders: {}", err),
            ),
        }
    }

    /// Persists the manual steps left by a finished run, if there are any.
    async fn record_manual_steps(&self, report: &mut MigrationReport) {
        let Some(manifest) = report.manual_steps() else {
            return;
        };
        match self.collaborators.store.save_manifest(&manifest).await {
            Ok(path) => {
                tracing::info!(path = %path.display(), steps = manifest.steps.len(), "Wrote manual steps manifest");
                report.manual_steps = Some(path);
            }
            Err(err) => tracing::warn!(error = %err, "Could not write the manual steps manifest"),
        }
    }

    async fn transfer_files(
        &self,
        direction: Direction,
        client: &ApiClient,
        project: &ProjectIdentity,
        runtime_id: Option<i64>,
        report: &ReportAccumulator,
    ) -> Result<(), MigratorError> {
        let api_key = client.session_key().ok_or_else(|| {
            MigratorError::Session("no API key available for the workspace CLI login".to_string())
        })?;
        let path = project.legacy_path();
        let request = SessionRequest {
            workspace_url: self.config.workspace_url.clone(),
            username: self.config.username.clone(),
            api_key,
            project_path: format!("{}/{}", path.owner, path.slug),
            runtime_id,
        };
        let session = self.collaborators.sessions.open(&request).await?;
        let endpoint = session.endpoint();
        let remote = Endpoint::Remote {
            user: endpoint.user.clone(),
            host: endpoint.host.clone(),
            port: endpoint.port,
            path: self.config.remote_root.clone(),
        };
        let local = Endpoint::Local(self.collaborators.store.data_dir(&project.name));

        let budget = self.config.transfer.retry_budget;
        let mut spec = match direction {
            Direction::Export => {
                let (rules, warning) = export_exclusions(client, project).await;
                if let Some(message) = warning {
                    report.warn(WarningKind::LegacyUnavailable, message);
                }
                TransferSpec::new(remote, local, budget).with_exclusions(rules)
            }
            Direction::Import => TransferSpec::new(local, remote, budget),
        }
        .with_retry_delay(Duration::from_millis(self.config.transfer.retry_delay_ms));

        let result = self.engine.transfer(&mut spec).await?;
        tracing::info!(
            project = %project.name,
            attempts = result.attempts,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Project files transferred"
        );

        if self.config.transfer.verify {
            match self.engine.verify(&spec).await {
                Ok(differing) if differing.is_empty() => {}
                Ok(differing) => report.warn(
                    WarningKind::TransferVerification,
                    format!(
                        "{} path(s) differ after transfer, e.g. {}",
                        differing.len(),
                        differing.iter().take(5).cloned().collect::<Vec<_>>().join(", ")
                    ),
                ),
                Err(err) => report.warn(
                    WarningKind::TransferVerification,
                    format!("could not verify the transfer: {}", err),
                ),
            }
        }

        drop(session);
        Ok(())
    }
}
