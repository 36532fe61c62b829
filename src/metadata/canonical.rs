// ABOUTME: Dialect-agnostic records for jobs, models and applications
// ABOUTME: Raw payloads of either dialect are normalized here and nowhere else

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::project::{slugify, EngineKind, ProjectIdentity};
use crate::remote::models::{
    ApplicationPayload, JobPayload, ModelBuildPayload, ModelPayload, RuntimeRef,
};
use crate::runtime::{RuntimeCatalog, RuntimeRequirement};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Job,
    Model,
    Application,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBuild {
    pub file_path: String,
    pub function_name: String,
}

/// Fields that only exist for one kind of record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordDetail {
    Job {
        #[serde(default)]
        schedule: Option<String>,
        #[serde(default)]
        timeout: Option<i64>,
        #[serde(default)]
        arguments: Option<String>,
        #[serde(default)]
        kill_on_timeout: Option<bool>,
        /// Source-side id of the job this one runs after.
        #[serde(default)]
        parent_source_id: Option<String>,
    },
    Model {
        disable_authentication: bool,
        #[serde(default)]
        build: Option<ModelBuild>,
    },
    Application {
        subdomain: String,
        bypass_authentication: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMetadataRecord {
    /// Id on the source instance. Only meaningful for job parent links.
    pub source_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub runtime: RuntimeRequirement,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub memory: Option<f64>,
    #[serde(default)]
    pub nvidia_gpu: Option<i64>,
    #[serde(flatten)]
    pub detail: RecordDetail,
}

impl CanonicalMetadataRecord {
    pub fn kind(&self) -> RecordKind {
        match self.detail {
            RecordDetail::Job { .. } => RecordKind::Job,
            RecordDetail::Model { .. } => RecordKind::Model,
            RecordDetail::Application { .. } => RecordKind::Application,
        }
    }

    /// What makes two records "the same" on a target: name and script for
    /// jobs, name for models, subdomain for applications.
    pub fn identity_key(&self) -> String {
        match &self.detail {
            RecordDetail::Job { .. } => job_key(&self.name, self.script.as_deref()),
            RecordDetail::Model { .. } => self.name.clone(),
            RecordDetail::Application { subdomain, .. } => subdomain.clone(),
        }
    }

    pub fn from_job(job: JobPayload) -> (Self, Option<String>) {
        let (environment, warning) = environment_from_value(job.environment.as_ref());
        let warning = warning.map(|w| format!("job '{}': {}", job.name, w));
        let runtime = requirement(
            job.runtime_identifier,
            job.kernel,
            job.runtime.as_ref(),
            job.runtime_addon_identifiers,
        );
        let record = CanonicalMetadataRecord {
            source_id: job.id,
            description: String::new(),
            script: job.script.filter(|s| !s.is_empty()),
            runtime,
            environment,
            cpu: job.cpu,
            memory: job.memory,
            nvidia_gpu: job.nvidia_gpu,
            detail: RecordDetail::Job {
                schedule: job.schedule.filter(|s| !s.is_empty()),
                timeout: job.timeout,
                arguments: job.arguments.filter(|s| !s.is_empty()),
                kill_on_timeout: job.kill_on_timeout,
                parent_source_id: job.parent_id,
            },
            name: job.name,
        };
        (record, warning)
    }

    pub fn from_model(model: ModelPayload, latest_build: Option<ModelBuildPayload>) -> Self {
        let (runtime, build) = match latest_build {
            Some(b) => {
                let runtime = requirement(
                    b.runtime_identifier,
                    b.kernel,
                    None,
                    b.runtime_addon_identifiers,
                );
                let build = match (b.file_path, b.function_name) {
                    (Some(file_path), Some(function_name)) => Some(ModelBuild {
                        file_path,
                        function_name,
                    }),
                    _ => None,
                };
                (runtime, build)
            }
            None => (RuntimeRequirement::default(), None),
        };

        CanonicalMetadataRecord {
            source_id: model.id,
            description: model
                .description
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| model.name.clone()),
            script: build.as_ref().map(|b| b.file_path.clone()),
            runtime,
            environment: BTreeMap::new(),
            cpu: None,
            memory: None,
            nvidia_gpu: None,
            detail: RecordDetail::Model {
                disable_authentication: !model.auth_enabled.unwrap_or(true),
                build,
            },
            name: model.name,
        }
    }

    pub fn from_application(app: ApplicationPayload) -> (Self, Option<String>) {
        let (environment, warning) = environment_from_value(app.environment.as_ref());
        let warning = warning.map(|w| format!("application '{}': {}", app.name, w));
        let runtime = requirement(
            app.runtime_identifier,
            app.kernel,
            app.runtime.as_ref(),
            app.runtime_addon_identifiers,
        );
        let subdomain = app
            .subdomain
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| slugify(&app.name));
        let record = CanonicalMetadataRecord {
            source_id: app.id,
            description: app
                .description
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| app.name.clone()),
            script: app.script.filter(|s| !s.is_empty()),
            runtime,
            environment,
            cpu: app.cpu,
            memory: app.memory,
            nvidia_gpu: app.nvidia_gpu,
            detail: RecordDetail::Application {
                subdomain,
                bypass_authentication: app.bypass_authentication.unwrap_or(false),
            },
            name: app.name,
        };
        (record, warning)
    }

    /// Fills the runtime fields the record payload does not carry from the
    /// source catalog entry with the same image.
    pub fn enrich_runtime(&mut self, catalog: &RuntimeCatalog) {
        let Some(identifier) = self.runtime.identifier.as_deref() else {
            return;
        };
        let Some(entry) = catalog.find_by_identifier(identifier) else {
            return;
        };
        let known = entry.requirement();
        let req = &mut self.runtime;
        req.kernel = req.kernel.take().or(known.kernel);
        req.edition = req.edition.take().or(known.edition);
        req.editor = req.editor.take().or(known.editor);
        req.short_version = req.short_version.take().or(known.short_version);
        req.full_version = req.full_version.take().or(known.full_version);
    }
}

pub fn job_key(name: &str, script: Option<&str>) -> String {
    format!("{}\u{0}{}", name, script.unwrap_or_default())
}

fn requirement(
    identifier: Option<String>,
    kernel: Option<String>,
    nested: Option<&RuntimeRef>,
    addons: Vec<String>,
) -> RuntimeRequirement {
    RuntimeRequirement {
        identifier: identifier
            .or_else(|| nested.and_then(|r| r.image_identifier.clone()))
            .filter(|s| !s.is_empty()),
        kernel: kernel
            .or_else(|| nested.and_then(|r| r.kernel.clone()))
            .filter(|s| !s.is_empty()),
        addons,
        ..RuntimeRequirement::default()
    }
}

/// Environment variables as either dialect sends them: an object, or an
/// object encoded as a JSON string. Anything else yields an empty map and
/// a warning.
pub fn environment_from_value(
    value: Option<&serde_json::Value>,
) -> (BTreeMap<String, String>, Option<String>) {
    use serde_json::Value;

    let object = match value {
        None | Some(Value::Null) => return (BTreeMap::new(), None),
        Some(Value::String(raw)) if raw.trim().is_empty() => return (BTreeMap::new(), None),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            _ => {
                return (
                    BTreeMap::new(),
                    Some("environment is not a JSON object, using an empty one".to_string()),
                )
            }
        },
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            return (
                BTreeMap::new(),
                Some("environment is not a JSON object, using an empty one".to_string()),
            )
        }
    };

    let env = object
        .into_iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (key, text)
        })
        .collect();
    (env, None)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProject {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub visibility: Option<String>,
    pub engine: EngineKind,
    #[serde(default)]
    pub shared_memory_limit: Option<i64>,
    #[serde(default)]
    pub owner: Option<String>,
    /// Owning team; it has to exist on the target before import.
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl CanonicalProject {
    pub fn from_identity(project: &ProjectIdentity) -> Self {
        CanonicalProject {
            name: project.name.clone(),
            slug: project.slug.clone(),
            description: project.description.clone(),
            visibility: project.visibility.clone(),
            engine: project.engine,
            shared_memory_limit: project.shared_memory_limit,
            owner: project.owner.as_ref().map(|o| o.as_str().to_string()),
            team: project.team.as_ref().map(|t| t.as_str().to_string()),
            environment: BTreeMap::new(),
        }
    }
}

/// Everything exported about one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub project: CanonicalProject,
    #[serde(default)]
    pub jobs: Vec<CanonicalMetadataRecord>,
    #[serde(default)]
    pub models: Vec<CanonicalMetadataRecord>,
    #[serde(default)]
    pub applications: Vec<CanonicalMetadataRecord>,
}

impl ProjectSnapshot {
    pub fn empty(project: CanonicalProject) -> Self {
        Self {
            project,
            jobs: Vec::new(),
            models: Vec::new(),
            applications: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeEntry;
    use serde_json::json;

    #[test]
    fn test_job_from_legacy_payload() {
        let payload: JobPayload = serde_json::from_value(json!({
            "id": 42,
            "name": "nightly",
            "script": "etl.py",
            "runtime": {"kernel": "Python 3.9", "imageIdentifier": "img:py39"},
            "environment": "{\"STAGE\": \"prod\", \"RETRIES\": 3}",
            "parentId": 41
        }))
        .unwrap();

        let (record, warning) = CanonicalMetadataRecord::from_job(payload);
        assert!(warning.is_none());
        assert_eq!(record.kind(), RecordKind::Job);
        assert_eq!(record.runtime.identifier.as_deref(), Some("img:py39"));
        assert_eq!(record.runtime.kernel.as_deref(), Some("Python 3.9"));
        assert_eq!(record.environment["STAGE"], "prod");
        assert_eq!(record.environment["RETRIES"], "3");
        match record.detail {
            RecordDetail::Job {
                parent_source_id, ..
            } => assert_eq!(parent_source_id.as_deref(), Some("41")),
            _ => panic!("expected a job"),
        }
    }

    #[test]
    fn test_application_subdomain_falls_back_to_name() {
        let payload: ApplicationPayload = serde_json::from_value(json!({
            "id": "a1", "name": "CDV 1", "script": "app.py"
        }))
        .unwrap();

        let (record, _) = CanonicalMetadataRecord::from_application(payload);
        assert_eq!(record.identity_key(), "cdv-1");
        assert_eq!(record.description, "CDV 1");
    }

    #[test]
    fn test_unparsable_environment_warns() {
        let payload: ApplicationPayload = serde_json::from_value(json!({
            "id": "a1", "name": "viz", "subdomain": "viz", "environment": "not json"
        }))
        .unwrap();

        let (record, warning) = CanonicalMetadataRecord::from_application(payload);
        assert!(record.environment.is_empty());
        assert!(warning.unwrap().contains("viz"));
    }

    #[test]
    fn test_model_without_build() {
        let payload: ModelPayload = serde_json::from_value(json!({
            "id": "m1", "name": "churn", "auth_enabled": false
        }))
        .unwrap();

        let record = CanonicalMetadataRecord::from_model(payload, None);
        assert_eq!(record.identity_key(), "churn");
        assert_eq!(
            record.detail,
            RecordDetail::Model {
                disable_authentication: true,
                build: None
            }
        );
    }

    #[test]
    fn test_runtime_enriched_from_catalog() {
        let payload: JobPayload = serde_json::from_value(json!({
            "id": "j1", "name": "train", "script": "train.py",
            "runtime_identifier": "img:py39"
        }))
        .unwrap();
        let (mut record, _) = CanonicalMetadataRecord::from_job(payload);
        let catalog = RuntimeCatalog::new(vec![RuntimeEntry {
            id: 3,
            image_identifier: Some("img:py39".into()),
            kernel: "Python 3.9".into(),
            edition: "Standard".into(),
            editor: "Workbench".into(),
            short_version: Some("2023.08".into()),
            full_version: Some("2023.08.2-b8".into()),
            available: true,
        }]);

        record.enrich_runtime(&catalog);
        assert_eq!(record.runtime.kernel.as_deref(), Some("Python 3.9"));
        assert_eq!(record.runtime.edition.as_deref(), Some("Standard"));
        assert_eq!(record.runtime.short_version.as_deref(), Some("2023.08"));
    }

    #[test]
    fn test_snapshot_record_serializes_flat() {
        let payload: ApplicationPayload = serde_json::from_value(json!({
            "id": "a1", "name": "CDV 1", "subdomain": "cdvapp"
        }))
        .unwrap();
        let (record, _) = CanonicalMetadataRecord::from_application(payload);

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["kind"], "application");
        assert_eq!(value["subdomain"], "cdvapp");
        let back: CanonicalMetadataRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }
}
