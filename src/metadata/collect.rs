// ABOUTME: Export side of the metadata phase
// ABOUTME: Fetches the three record categories concurrently and canonicalizes them

use futures::stream::{self, StreamExt};

use super::canonical::{CanonicalMetadataRecord, CanonicalProject, ProjectSnapshot, RecordKind};
use crate::credentials::Dialect;
use crate::error::{ApiError, MigratorError};
use crate::project::ProjectIdentity;
use crate::remote::client::ApiClient;
use crate::report::{ReportAccumulator, WarningKind};
use crate::runtime::RuntimeCatalog;

pub struct MetadataCollector<'a> {
    pub(super) client: &'a ApiClient,
    pub(super) report: &'a ReportAccumulator,
    concurrency: usize,
}

impl<'a> MetadataCollector<'a> {
    pub fn new(client: &'a ApiClient, report: &'a ReportAccumulator, concurrency: usize) -> Self {
        Self {
            client,
            report,
            concurrency: concurrency.max(1),
        }
    }

    /// Reads the project and its jobs, models and applications through
    /// `dialect`. A category that cannot be read is recorded as a partial
    /// failure and comes back empty; only an unusable dialect is fatal.
    pub async fn collect(
        &self,
        project: &ProjectIdentity,
        dialect: Dialect,
        source_catalog: Option<&RuntimeCatalog>,
    ) -> Result<ProjectSnapshot, MigratorError> {
        if !self.client.usable(dialect) {
            return Err(ApiError::CredentialMissing { dialect }.into());
        }

        let mut canonical = CanonicalProject::from_identity(project);
        if let Some(team) = &project.team {
            self.report.warn(
                WarningKind::TeamProject,
                format!("project belongs to team '{}', which must exist on the target before import", team),
            );
        }
        canonical.environment = self.project_environment(project).await;

        let (jobs, models, applications) = futures::join!(
            self.jobs(project, dialect),
            self.models(project, dialect),
            self.applications(project, dialect),
        );

        let mut snapshot = ProjectSnapshot {
            project: canonical,
            jobs,
            models,
            applications,
        };

        let all = snapshot
            .jobs
            .iter_mut()
            .chain(snapshot.models.iter_mut())
            .chain(snapshot.applications.iter_mut());
        for record in all {
            if let Some(catalog) = source_catalog {
                record.enrich_runtime(catalog);
            }
            self.report.processed(record.kind(), &record.name);
        }

        tracing::info!(
            project = %project.name,
            %dialect,
            jobs = snapshot.jobs.len(),
            models = snapshot.models.len(),
            applications = snapshot.applications.len(),
            "Collected project metadata"
        );
        Ok(snapshot)
    }

    async fn project_environment(
        &self,
        project: &ProjectIdentity,
    ) -> std::collections::BTreeMap<String, String> {
        if !self.client.usable(Dialect::Legacy) {
            self.report.warn(
                WarningKind::LegacyUnavailable,
                "no legacy token configured, project environment variables were not exported",
            );
            return Default::default();
        }
        match self.client.project_environment(&project.legacy_path()).await {
            Ok(env) => env,
            Err(err) => {
                self.report.warn(
                    WarningKind::Environment,
                    format!("could not read project environment: {}", err),
                );
                Default::default()
            }
        }
    }

    fn note_warning(&self, warning: Option<String>) {
        if let Some(message) = warning {
            self.report.warn(WarningKind::Environment, message);
        }
    }

    async fn jobs(&self, project: &ProjectIdentity, dialect: Dialect) -> Vec<CanonicalMetadataRecord> {
        match self
            .client
            .list_jobs(dialect, &project.id, &project.legacy_path())
            .await
        {
            Ok(jobs) => jobs
                .into_iter()
                .map(|job| {
                    let (record, warning) = CanonicalMetadataRecord::from_job(job);
                    self.note_warning(warning);
                    record
                })
                .collect(),
            Err(err) => {
                self.report.category_failed(RecordKind::Job, &err.to_string());
                Vec::new()
            }
        }
    }

    async fn applications(
        &self,
        project: &ProjectIdentity,
        dialect: Dialect,
    ) -> Vec<CanonicalMetadataRecord> {
        match self
            .client
            .list_applications(dialect, &project.id, &project.legacy_path())
            .await
        {
            Ok(apps) => apps
                .into_iter()
                .map(|app| {
                    let (record, warning) = CanonicalMetadataRecord::from_application(app);
                    self.note_warning(warning);
                    record
                })
                .collect(),
            Err(err) => {
                self.report
                    .category_failed(RecordKind::Application, &err.to_string());
                Vec::new()
            }
        }
    }

    /// Models with their latest build. Build histories are fetched with at
    /// most `concurrency` requests in flight.
    async fn models(&self, project: &ProjectIdentity, dialect: Dialect) -> Vec<CanonicalMetadataRecord> {
        if dialect == Dialect::Legacy {
            self.report.category_failed(
                RecordKind::Model,
                "the legacy dialect has no model listing",
            );
            return Vec::new();
        }

        let models = match self.client.list_models(&project.id).await {
            Ok(models) => models,
            Err(err) => {
                self.report.category_failed(RecordKind::Model, &err.to_string());
                return Vec::new();
            }
        };

        stream::iter(models)
            .map(|model| async move {
                let builds = self.client.list_model_builds(&project.id, &model.id).await;
                (model, builds)
            })
            .buffered(self.concurrency)
            .map(|(model, builds)| {
                let latest = match builds {
                    Ok(builds) => builds.into_iter().next(),
                    Err(err) => {
                        self.report.warn(
                            WarningKind::ModelBuildFailed,
                            format!("model '{}': build history unavailable: {}", model.name, err),
                        );
                        None
                    }
                };
                CanonicalMetadataRecord::from_model(model, latest)
            })
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialSet;
    use crate::project::{EngineKind, Identity};
    use crate::report::{Direction, RunStatus};
    use crate::testing::{client_with, FakeTransport};
    use reqwest::Method;
    use serde_json::json;
    use std::time::{Duration, Instant};

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

    fn empty_project(fake: &FakeTransport) {
        fake.json(Method::GET, "/api/v2/projects/p1/jobs", json!({"jobs": []}));
        fake.json(Method::GET, "/api/v2/projects/p1/models", json!({"models": []}));
        fake.json(Method::GET, "/api/v2/projects/p1/applications", json!({"applications": []}));
        fake.json(Method::GET, "/api/v1/projects/alice/cdv/environment", json!({}));
    }

    #[tokio::test]
    async fn test_single_application_project() {
        let fake = FakeTransport::new();
        empty_project(&fake);
        fake.json(
            Method::GET,
            "/api/v2/projects/p1/applications",
            json!({"applications": [{"id": "a1", "name": "CDV 1", "subdomain": "cdvapp", "script": "app.py"}]}),
        );
        let client = client_with(&fake, CredentialSet::new(Some("v1"), Some("v2")));
        let report = ReportAccumulator::new(Direction::Export, "CDV");

        let snapshot = MetadataCollector::new(&client, &report, 4)
            .collect(&project(), Dialect::Current, None)
            .await
            .unwrap();

        assert!(snapshot.jobs.is_empty());
        assert!(snapshot.models.is_empty());
        assert_eq!(snapshot.applications[0].identity_key(), "cdvapp");
        let report = report.finish(None);
        assert_eq!(report.applications.processed, vec!["CDV 1".to_string()]);
        assert_eq!(report.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn test_failed_category_is_partial_not_fatal() {
        let fake = FakeTransport::new();
        empty_project(&fake);
        fake.reply(Method::GET, "/api/v2/projects/p1/jobs", 403, r#"{"message":"denied"}"#);
        fake.json(
            Method::GET,
            "/api/v2/projects/p1/applications",
            json!({"applications": [{"id": "a1", "name": "viz", "subdomain": "viz"}]}),
        );
        let client = client_with(&fake, CredentialSet::new(Some("v1"), Some("v2")));
        let report = ReportAccumulator::new(Direction::Export, "CDV");

        let snapshot = MetadataCollector::new(&client, &report, 4)
            .collect(&project(), Dialect::Current, None)
            .await
            .unwrap();

        assert_eq!(snapshot.applications.len(), 1);
        assert_eq!(report.finish(None).status, RunStatus::Partial);
    }

    #[tokio::test]
    async fn test_models_carry_latest_build() {
        let fake = FakeTransport::new();
        empty_project(&fake);
        fake.json(
            Method::GET,
            "/api/v2/projects/p1/models",
            json!({"models": [{"id": "m1", "name": "churn"}, {"id": "m2", "name": "ltv"}]}),
        );
        fake.json(
            Method::GET,
            "/api/v2/projects/p1/models/m1/builds",
            json!({"model_builds": [
                {"file_path": "predict.py", "function_name": "predict", "runtime_identifier": "img:py39"},
                {"file_path": "old.py", "function_name": "predict"}
            ]}),
        );
        fake.reply(Method::GET, "/api/v2/projects/p1/models/m2/builds", 500, "");
        let client = client_with(&fake, CredentialSet::new(Some("v1"), Some("v2")));
        let report = ReportAccumulator::new(Direction::Export, "CDV");

        let snapshot = MetadataCollector::new(&client, &report, 2)
            .collect(&project(), Dialect::Current, None)
            .await
            .unwrap();

        assert_eq!(snapshot.models.len(), 2);
        assert_eq!(snapshot.models[0].script.as_deref(), Some("predict.py"));
        assert_eq!(snapshot.models[0].runtime.identifier.as_deref(), Some("img:py39"));
        assert!(snapshot.models[1].script.is_none());
        let report = report.finish(None);
        assert_eq!(report.models.count(), 2);
        assert_eq!(report.warnings_of(WarningKind::ModelBuildFailed).count(), 1);
    }

    #[tokio::test]
    async fn test_categories_are_fetched_concurrently() {
        let fake = FakeTransport::new();
        empty_project(&fake);
        for path in [
            "/api/v2/projects/p1/jobs",
            "/api/v2/projects/p1/models",
            "/api/v2/projects/p1/applications",
        ] {
            fake.delay(Method::GET, path, Duration::from_millis(200));
        }
        let client = client_with(&fake, CredentialSet::new(Some("v1"), Some("v2")));
        let report = ReportAccumulator::new(Direction::Export, "CDV");

        let started = Instant::now();
        MetadataCollector::new(&client, &report, 4)
            .collect(&project(), Dialect::Current, None)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(550));
    }

    #[tokio::test]
    async fn test_legacy_dialect_reads_v1_listings() {
        let fake = FakeTransport::new();
        fake.json(Method::GET, "/api/v1/projects/alice/cdv/environment", json!({"A": "1"}));
        fake.json(
            Method::GET,
            "/api/v1/projects/alice/cdv/jobs",
            json!([{"id": 3, "name": "nightly", "script": "etl.py", "kernel": "python3"}]),
        );
        fake.json(Method::GET, "/api/v1/projects/alice/cdv/applications", json!([]));
        let client = client_with(&fake, CredentialSet::new(Some("v1"), None));
        let report = ReportAccumulator::new(Direction::Export, "CDV");

        let snapshot = MetadataCollector::new(&client, &report, 4)
            .collect(&project(), Dialect::Legacy, None)
            .await
            .unwrap();

        assert_eq!(snapshot.jobs[0].source_id, "3");
        assert_eq!(snapshot.project.environment["A"], "1");
        assert_eq!(fake.count(&Method::GET, "/api/v2/projects/p1/models"), 0);
        assert_eq!(report.finish(None).status, RunStatus::Partial);
    }

    #[tokio::test]
    async fn test_missing_legacy_token_skips_environment() {
        let fake = FakeTransport::new();
        empty_project(&fake);
        let client = client_with(&fake, CredentialSet::new(None, Some("v2")));
        let report = ReportAccumulator::new(Direction::Export, "CDV");

        MetadataCollector::new(&client, &report, 4)
            .collect(&project(), Dialect::Current, None)
            .await
            .unwrap();

        let report = report.finish(None);
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.warnings_of(WarningKind::LegacyUnavailable).count(), 1);
        assert_eq!(fake.count(&Method::GET, "/api/v1/projects/alice/cdv/environment"), 0);
    }

    #[tokio::test]
    async fn test_unusable_dialect_is_fatal() {
        let fake = FakeTransport::new();
        let client = client_with(&fake, CredentialSet::new(None, Some("v2")));
        let report = ReportAccumulator::new(Direction::Export, "CDV");

        let err = MetadataCollector::new(&client, &report, 4)
            .collect(&project(), Dialect::Legacy, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "credential_missing");
    }
}
