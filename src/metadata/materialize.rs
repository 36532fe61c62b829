// ABOUTME: Import side of the metadata phase
// ABOUTME: Re-creates canonical records on the target, skipping ones that already exist

use std::collections::{HashMap, HashSet};

use super::canonical::{CanonicalMetadataRecord, ProjectSnapshot, RecordDetail, RecordKind};
use super::collect::MetadataCollector;
use crate::credentials::Dialect;
use crate::error::{ApiError, MigratorError};
use crate::project::ProjectIdentity;
use crate::remote::endpoints::SPARK_ADDON;
use crate::remote::models::{
    CreateApplicationRequest, CreateJobRequest, CreateModelBuildRequest, CreateModelRequest,
};
use crate::report::{singular, WarningKind};
use crate::runtime::{RuntimeCatalog, RuntimeChoice};

const SYSTEM_SCRIPT_PREFIXES: [&str; 4] = ["/opt/", "/usr/", "/bin/", "/etc/"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializationResult {
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl std::ops::Add for MaterializationResult {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            created: self.created + other.created,
            skipped: self.skipped + other.skipped,
            failed: self.failed + other.failed,
        }
    }
}

/// Runtime fields for a create request.
struct ResolvedRuntime {
    identifier: Option<String>,
    kernel: Option<String>,
    addons: Vec<String>,
}

impl<'a> MetadataCollector<'a> {
    /// Creates every record of `snapshot` that the target does not already
    /// have. Records that exist are skipped, so a second run creates
    /// nothing. `catalog` is the target's runtime catalog; `None` for
    /// projects without runtimes.
    pub async fn materialize(
        &self,
        snapshot: &ProjectSnapshot,
        target: &ProjectIdentity,
        catalog: Option<&RuntimeCatalog>,
    ) -> Result<MaterializationResult, MigratorError> {
        if !self.client.usable(Dialect::Current) {
            return Err(ApiError::CredentialMissing {
                dialect: Dialect::Current,
            }
            .into());
        }

        let (jobs, models, applications) = futures::join!(
            self.materialize_jobs(&snapshot.jobs, target, catalog),
            self.materialize_models(&snapshot.models, target, catalog),
            self.materialize_applications(&snapshot.applications, target, catalog),
        );
        let total = jobs + models + applications;

        tracing::info!(
            project = %target.name,
            created = total.created,
            skipped = total.skipped,
            failed = total.failed,
            "Materialized project metadata"
        );
        Ok(total)
    }

    fn resolve_runtime(
        &self,
        record: &CanonicalMetadataRecord,
        catalog: Option<&RuntimeCatalog>,
        allow_any: bool,
    ) -> Result<ResolvedRuntime, String> {
        let Some(catalog) = catalog else {
            return Ok(ResolvedRuntime {
                identifier: None,
                kernel: record.runtime.kernel.clone(),
                addons: Vec::new(),
            });
        };

        match catalog.choose(&record.runtime, allow_any) {
            RuntimeChoice::Exact(identifier) => Ok(ResolvedRuntime {
                identifier: Some(identifier),
                kernel: None,
                addons: record.runtime.addons.clone(),
            }),
            RuntimeChoice::Fallback { required, chosen } => {
                self.report.warn(
                    WarningKind::RuntimeFallback,
                    format!(
                        "'{}': runtime {} is not available on the target, using {}",
                        record.name,
                        required.as_deref().unwrap_or("(unspecified)"),
                        chosen
                    ),
                );
                Ok(ResolvedRuntime {
                    identifier: Some(chosen),
                    kernel: None,
                    addons: Vec::new(),
                })
            }
            RuntimeChoice::Unavailable => Err(format!(
                "no compatible runtime on the target (requires {})",
                record
                    .runtime
                    .identifier
                    .as_deref()
                    .or(record.runtime.kernel.as_deref())
                    .unwrap_or("an unspecified runtime")
            )),
        }
    }

    /// The target's Spark add-on. A failed lookup keeps the exported add-ons.
    async fn spark_addon(&self) -> Option<String> {
        match self.client.find_runtime_addon(SPARK_ADDON).await {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!(error = %err, "Could not look up the Spark add-on; keeping exported add-ons");
                None
            }
        }
    }

    fn skip(&self, kind: RecordKind, record: &CanonicalMetadataRecord, result: &mut MaterializationResult) {
        tracing::info!(kind = ?kind, name = %record.name, key = %record.identity_key(), "Already present on target, skipping");
        self.report.skipped(kind, &record.name);
        result.skipped += 1;
    }

    fn fail(&self, kind: RecordKind, name: &str, reason: &str, result: &mut MaterializationResult) {
        self.report.failed(kind, name, reason);
        result.failed += 1;
    }

    fn misfiled(
        &self,
        kind: RecordKind,
        record: &CanonicalMetadataRecord,
        result: &mut MaterializationResult,
    ) {
        let reason = format!("record '{}' is not {} metadata", record.source_id, singular(kind));
        self.fail(kind, &record.name, &reason, result);
    }

    async fn materialize_jobs(
        &self,
        records: &[CanonicalMetadataRecord],
        target: &ProjectIdentity,
        catalog: Option<&RuntimeCatalog>,
    ) -> MaterializationResult {
        let mut result = MaterializationResult::default();
        if records.is_empty() {
            return result;
        }

        let mut existing: HashMap<String, String> = match self
            .client
            .list_jobs(Dialect::Current, &target.id, &target.legacy_path())
            .await
        {
            Ok(jobs) => jobs
                .into_iter()
                .map(|job| {
                    let id = job.id.clone();
                    (CanonicalMetadataRecord::from_job(job).0.identity_key(), id)
                })
                .collect(),
            Err(err) => {
                self.report.category_failed(RecordKind::Job, &err.to_string());
                result.failed = records.len();
                return result;
            }
        };

        let spark = match catalog {
            Some(_) => self.spark_addon().await,
            None => None,
        };

        // source id -> target id, for parent links
        let mut ids: HashMap<&str, String> = HashMap::new();
        let mut created: Vec<(&CanonicalMetadataRecord, String)> = Vec::new();

        for record in records {
            if let Some(id) = existing.get(&record.identity_key()) {
                ids.insert(&record.source_id, id.clone());
                self.skip(RecordKind::Job, record, &mut result);
                continue;
            }

            let RecordDetail::Job {
                schedule,
                timeout,
                arguments,
                kill_on_timeout,
                ..
            } = &record.detail
            else {
                self.misfiled(RecordKind::Job, record, &mut result);
                continue;
            };

            let mut runtime = match self.resolve_runtime(record, catalog, true) {
                Ok(runtime) => runtime,
                Err(reason) => {
                    self.fail(RecordKind::Job, &record.name, &reason, &mut result);
                    continue;
                }
            };
            if let (Some(spark), Some(_)) = (&spark, &runtime.identifier) {
                runtime.addons = vec![spark.clone()];
            }

            let request = CreateJobRequest {
                project_id: target.id.clone(),
                name: record.name.clone(),
                script: record.script.clone().unwrap_or_default(),
                paused: true,
                kernel: runtime.kernel,
                runtime_identifier: runtime.identifier,
                runtime_addon_identifiers: runtime.addons,
                cpu: record.cpu,
                memory: record.memory,
                nvidia_gpu: record.nvidia_gpu,
                schedule: schedule.clone(),
                timeout: *timeout,
                arguments: arguments.clone(),
                kill_on_timeout: *kill_on_timeout,
                environment: record.environment.clone(),
            };

            match self.client.create_job(&request).await {
                Ok(id) => {
                    tracing::info!(name = %record.name, id = %id, "Created job (paused)");
                    ids.insert(&record.source_id, id.clone());
                    existing.insert(record.identity_key(), id.clone());
                    created.push((record, id));
                    self.report.processed(RecordKind::Job, &record.name);
                    result.created += 1;
                }
                Err(err) => self.fail(RecordKind::Job, &record.name, &err.to_string(), &mut result),
            }
        }

        for (record, id) in created {
            let RecordDetail::Job {
                parent_source_id: Some(parent),
                ..
            } = &record.detail
            else {
                continue;
            };
            let Some(parent_id) = ids.get(parent.as_str()) else {
                self.report.warn(
                    WarningKind::JobDependency,
                    format!("job '{}': parent job was not migrated, dependency dropped", record.name),
                );
                continue;
            };
            if let Err(err) = self.client.set_job_parent(&target.id, &id, parent_id).await {
                self.report.warn(
                    WarningKind::JobDependency,
                    format!("job '{}': could not restore dependency: {}", record.name, err),
                );
            }
        }

        result
    }

    async fn materialize_models(
        &self,
        records: &[CanonicalMetadataRecord],
        target: &ProjectIdentity,
        catalog: Option<&RuntimeCatalog>,
    ) -> MaterializationResult {
        let mut result = MaterializationResult::default();
        if records.is_empty() {
            return result;
        }

        let mut existing: HashSet<String> = match self.client.list_models(&target.id).await {
            Ok(models) => models.into_iter().map(|m| m.name).collect(),
            Err(err) => {
                self.report.category_failed(RecordKind::Model, &err.to_string());
                result.failed = records.len();
                return result;
            }
        };

        for record in records {
            if existing.contains(&record.name) {
                self.skip(RecordKind::Model, record, &mut result);
                continue;
            }

            let RecordDetail::Model {
                disable_authentication,
                build,
            } = &record.detail
            else {
                self.misfiled(RecordKind::Model, record, &mut result);
                continue;
            };

            // Only a build needs a runtime; check it before creating anything.
            let runtime = match build {
                Some(_) => match self.resolve_runtime(record, catalog, true) {
                    Ok(runtime) => Some(runtime),
                    Err(reason) => {
                        self.fail(RecordKind::Model, &record.name, &reason, &mut result);
                        continue;
                    }
                },
                None => None,
            };

            let request = CreateModelRequest {
                project_id: target.id.clone(),
                name: record.name.clone(),
                description: record.description.clone(),
                disable_authentication: *disable_authentication,
            };
            let model_id = match self.client.create_model(&request).await {
                Ok(id) => id,
                Err(err) => {
                    self.fail(RecordKind::Model, &record.name, &err.to_string(), &mut result);
                    continue;
                }
            };
            tracing::info!(name = %record.name, id = %model_id, "Created model");
            existing.insert(record.name.clone());
            self.report.processed(RecordKind::Model, &record.name);
            result.created += 1;

            if let (Some(build), Some(runtime)) = (build, runtime) {
                let request = CreateModelBuildRequest {
                    project_id: target.id.clone(),
                    model_id,
                    file_path: build.file_path.clone(),
                    function_name: build.function_name.clone(),
                    kernel: runtime.kernel,
                    runtime_identifier: runtime.identifier,
                    runtime_addon_identifiers: runtime.addons,
                };
                if let Err(err) = self.client.create_model_build(&request).await {
                    self.report.warn(
                        WarningKind::ModelBuildFailed,
                        format!("model '{}' was created but its build failed: {}", record.name, err),
                    );
                }
            }
        }

        result
    }

    async fn materialize_applications(
        &self,
        records: &[CanonicalMetadataRecord],
        target: &ProjectIdentity,
        catalog: Option<&RuntimeCatalog>,
    ) -> MaterializationResult {
        let mut result = MaterializationResult::default();
        if records.is_empty() {
            return result;
        }

        let mut existing: HashSet<String> = match self
            .client
            .list_applications(Dialect::Current, &target.id, &target.legacy_path())
            .await
        {
            Ok(apps) => apps
                .into_iter()
                .map(|app| CanonicalMetadataRecord::from_application(app).0.identity_key())
                .collect(),
            Err(err) => {
                self.report
                    .category_failed(RecordKind::Application, &err.to_string());
                result.failed = records.len();
                return result;
            }
        };

        for record in records {
            let key = record.identity_key();
            if existing.contains(&key) {
                self.skip(RecordKind::Application, record, &mut result);
                continue;
            }

            let RecordDetail::Application {
                subdomain,
                bypass_authentication,
            } = &record.detail
            else {
                self.misfiled(RecordKind::Application, record, &mut result);
                continue;
            };

            let script = record.script.clone().unwrap_or_default();
            let system_script = SYSTEM_SCRIPT_PREFIXES.iter().any(|p| script.starts_with(p));

            let runtime = match self.resolve_runtime(record, catalog, !system_script) {
                Ok(runtime) => runtime,
                Err(reason) => {
                    self.fail(RecordKind::Application, &record.name, &reason, &mut result);
                    continue;
                }
            };

            let script = match script.strip_prefix('/') {
                Some(relative) => {
                    self.report.warn(
                        WarningKind::ScriptPathRewritten,
                        format!(
                            "application '{}': script {} imported as {}; point it back to {} once the target runtime provides it",
                            record.name, script, relative, script
                        ),
                    );
                    relative.to_string()
                }
                None => script.clone(),
            };

            let request = CreateApplicationRequest {
                project_id: target.id.clone(),
                name: record.name.clone(),
                subdomain: subdomain.clone(),
                description: record.description.clone(),
                script,
                kernel: runtime.kernel,
                runtime_identifier: runtime.identifier,
                runtime_addon_identifiers: runtime.addons,
                cpu: record.cpu,
                memory: record.memory,
                nvidia_gpu: record.nvidia_gpu,
                bypass_authentication: *bypass_authentication,
                environment: record.environment.clone(),
            };

            let app_id = match self.client.create_application(&request).await {
                Ok(id) => id,
                Err(err) => {
                    let reason = err.server_message().unwrap_or_else(|| err.to_string());
                    self.fail(RecordKind::Application, &record.name, &reason, &mut result);
                    continue;
                }
            };
            tracing::info!(name = %record.name, id = %app_id, subdomain = %subdomain, "Created application");
            existing.insert(key);
            self.report.processed(RecordKind::Application, &record.name);
            result.created += 1;

            // Applications start on creation; leave them stopped like the rest.
            if let Err(err) = self.client.stop_application(&target.id, &app_id).await {
                tracing::warn!(name = %record.name, error = %err, "Could not stop imported application");
            }
        }

        result
    }
}
