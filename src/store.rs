// ABOUTME: Bastion-side storage for exported snapshots and file trees
// ABOUTME: One JSON document per category under {root}/{project}/project-metadata

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::MigratorError;
use crate::metadata::canonical::{CanonicalMetadataRecord, CanonicalProject, ProjectSnapshot};
use crate::report::ManualStepsManifest;

const METADATA_DIR: &str = "project-metadata";
const DATA_DIR: &str = "project-data";
const PROJECT_FILE: &str = "project-metadata.json";
const JOBS_FILE: &str = "jobs-metadata.json";
const MODELS_FILE: &str = "models-metadata.json";
const APPLICATIONS_FILE: &str = "applications-metadata.json";
const MANIFEST_FILE: &str = "manual-steps-required.json";

pub trait SnapshotStore: Send + Sync {
    fn save<'a>(&'a self, snapshot: &'a ProjectSnapshot) -> BoxFuture<'a, Result<(), MigratorError>>;

    fn load<'a>(&'a self, project_name: &'a str) -> BoxFuture<'a, Result<ProjectSnapshot, MigratorError>>;

    /// Local directory that mirrors the project's file tree.
    fn data_dir(&self, project_name: &str) -> PathBuf;

    /// Writes the manual steps manifest beside the project's metadata and
    /// returns its path.
    fn save_manifest<'a>(
        &'a self,
        manifest: &'a ManualStepsManifest,
    ) -> BoxFuture<'a, Result<PathBuf, MigratorError>>;

    /// Creates a stand-in file in the data directory for every application
    /// whose script is an absolute path, so the relative path it is imported
    /// under exists on the target. Existing files are left alone. Returns the
    /// files created.
    fn write_script_placeholders<'a>(
        &'a self,
        project_name: &'a str,
        applications: &'a [CanonicalMetadataRecord],
    ) -> BoxFuture<'a, Result<Vec<PathBuf>, MigratorError>>;
}

pub struct LocalSnapshotStore {
    root: PathBuf,
}

impl LocalSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn metadata_dir(&self, project_name: &str) -> PathBuf {
        self.root.join(project_name).join(METADATA_DIR)
    }
}

fn store_error(action: &str, path: &Path, err: impl std::fmt::Display) -> MigratorError {
    MigratorError::Store(format!("failed to {} {}: {}", action, path.display(), err))
}

async fn write_private(path: &Path, value: &impl Serialize) -> Result<(), MigratorError> {
    let body = serde_json::to_vec_pretty(value).map_err(|e| store_error("encode", path, e))?;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options
        .open(path)
        .await
        .map_err(|e| store_error("open", path, e))?;
    tokio::io::AsyncWriteExt::write_all(&mut file, &body)
        .await
        .map_err(|e| store_error("write", path, e))?;

    // An older file keeps its mode through truncate, so tighten it too.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| store_error("restrict", path, e))?;
    }
    Ok(())
}

/// `None` when the file does not exist.
async fn read_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, MigratorError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| store_error("parse", path, e)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(store_error("read", path, err)),
    }
}

impl SnapshotStore for LocalSnapshotStore {
    fn save<'a>(&'a self, snapshot: &'a ProjectSnapshot) -> BoxFuture<'a, Result<(), MigratorError>> {
        Box::pin(async move {
            let dir = self.metadata_dir(&snapshot.project.name);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| store_error("create", &dir, e))?;

            write_private(&dir.join(PROJECT_FILE), &snapshot.project).await?;
            write_private(&dir.join(JOBS_FILE), &snapshot.jobs).await?;
            write_private(&dir.join(MODELS_FILE), &snapshot.models).await?;
            write_private(&dir.join(APPLICATIONS_FILE), &snapshot.applications).await?;

            tracing::info!(
                path = %dir.display(),
                jobs = snapshot.jobs.len(),
                models = snapshot.models.len(),
                applications = snapshot.applications.len(),
                "Saved project snapshot"
            );
            Ok(())
        })
    }

    fn load<'a>(&'a self, project_name: &'a str) -> BoxFuture<'a, Result<ProjectSnapshot, MigratorError>> {
        Box::pin(async move {
            let dir = self.metadata_dir(project_name);
            let project_path = dir.join(PROJECT_FILE);
            let project: CanonicalProject = read_optional(&project_path).await?.ok_or_else(|| {
                MigratorError::Store(format!(
                    "no exported metadata for '{}' at {}; run an export first",
                    project_name,
                    project_path.display()
                ))
            })?;

            let category = |file: &'static str| {
                let path = dir.join(file);
                async move {
                    Ok::<_, MigratorError>(
                        read_optional::<Vec<CanonicalMetadataRecord>>(&path)
                            .await?
                            .unwrap_or_default(),
                    )
                }
            };

            Ok(ProjectSnapshot {
                project,
                jobs: category(JOBS_FILE).await?,
                models: category(MODELS_FILE).await?,
                applications: category(APPLICATIONS_FILE).await?,
            })
        })
    }

    fn data_dir(&self, project_name: &str) -> PathBuf {
        self.root.join(project_name).join(DATA_DIR)
    }

    fn save_manifest<'a>(
        &'a self,
        manifest: &'a ManualStepsManifest,
    ) -> BoxFuture<'a, Result<PathBuf, MigratorError>> {
        Box::pin(async move {
            let dir = self.root.join(&manifest.project);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| store_error("create", &dir, e))?;
            let path = dir.join(MANIFEST_FILE);
            write_private(&path, manifest).await?;
            Ok(path)
        })
    }

    fn write_script_placeholders<'a>(
        &'a self,
        project_name: &'a str,
        applications: &'a [CanonicalMetadataRecord],
    ) -> BoxFuture<'a, Result<Vec<PathBuf>, MigratorError>> {
        Box::pin(async move {
            let data_dir = self.data_dir(project_name);
            let mut written = Vec::new();
            for app in applications {
                let Some(script) = app.script.as_deref() else {
                    continue;
                };
                let relative = script.trim_start_matches('/');
                if relative.len() == script.len() || relative.is_empty() {
                    continue;
                }
                let path = data_dir.join(relative);
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    continue;
                }
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| store_error("create", parent, e))?;
                }
                tokio::fs::write(&path, placeholder_script(&app.name, script))
                    .await
                    .map_err(|e| store_error("write", &path, e))?;
                tracing::info!(application = %app.name, path = %path.display(), "Created script placeholder");
                written.push(path);
            }
            Ok(written)
        })
    }
}

fn placeholder_script(application: &str, original: &str) -> String {
    format!(
        "#!/usr/bin/env python3\n\
         # Placeholder for application '{application}'.\n\
         # The application runs {original}, which ships with its runtime image.\n\
         # After import, set the application script back to {original}.\n\
         print(\"placeholder for {original}\")\n"
    )
}
