// ABOUTME: Project and identity snapshots shared by every migration phase
// ABOUTME: Normalizes the project payload of either dialect into one shape

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::MigratorError;
use crate::remote::client::ApiClient;
use crate::remote::endpoints::LegacyProjectPath;
use crate::remote::models::ProjectPayload;

const ORGANIZATION_OWNER: &str = "organization";
const RUNTIME_ENGINE: &str = "ml_runtime";

/// A user or team name on the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Identity(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Execution model of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Runtimes,
    LegacyEngine,
}

impl EngineKind {
    fn from_engine_type(raw: Option<&str>) -> Self {
        match raw.map(str::to_ascii_lowercase).as_deref() {
            Some(RUNTIME_ENGINE) | None => EngineKind::Runtimes,
            Some(_) => EngineKind::LegacyEngine,
        }
    }

    pub fn as_api_str(&self) -> &'static str {
        match self {
            EngineKind::Runtimes => RUNTIME_ENGINE,
            EngineKind::LegacyEngine => "legacy_engine",
        }
    }
}

/// Read-only snapshot of a remote project. Refreshed through
/// [`ProjectIdentity::refresh`]; the owner only changes through the
/// ownership manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectIdentity {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub owner: Option<Identity>,
    /// Set when the owner is an organization rather than a user.
    pub team: Option<Identity>,
    pub engine: EngineKind,
    pub description: Option<String>,
    pub visibility: Option<String>,
    pub shared_memory_limit: Option<i64>,
}

impl ProjectIdentity {
    pub fn from_payload(payload: ProjectPayload) -> Self {
        let slug = payload
            .slug
            .clone()
            .or(payload.slug_raw.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| slugify(&payload.name));

        let owner_ref = payload.owner.unwrap_or_default();
        let owner = owner_ref.username.clone().map(Identity::new);
        let team = match owner_ref.kind.as_deref() {
            Some(kind) if kind.eq_ignore_ascii_case(ORGANIZATION_OWNER) => owner.clone(),
            _ => None,
        };

        let engine_type = payload
            .default_engine_type
            .as_deref()
            .or(payload.default_project_engine_type.as_deref());

        ProjectIdentity {
            id: payload.id,
            name: payload.name,
            slug,
            owner: owner.or_else(|| {
                payload
                    .creator
                    .and_then(|c| c.username)
                    .map(Identity::new)
            }),
            team,
            engine: EngineKind::from_engine_type(engine_type),
            description: payload.description,
            visibility: payload.visibility,
            shared_memory_limit: payload.shared_memory_limit,
        }
    }

    pub async fn locate(client: &ApiClient, name: &str) -> Result<Self, MigratorError> {
        match client.find_project(name).await? {
            Some(payload) => Ok(Self::from_payload(payload)),
            None => Err(MigratorError::ProjectNotFound(name.to_string())),
        }
    }

    pub async fn refresh(&self, client: &ApiClient) -> Result<Self, MigratorError> {
        Ok(Self::from_payload(client.get_project(&self.id).await?))
    }

    pub fn uses_runtimes(&self) -> bool {
        self.engine == EngineKind::Runtimes
    }

    pub fn legacy_path(&self) -> LegacyProjectPath<'_> {
        LegacyProjectPath {
            owner: self.owner.as_ref().map(Identity::as_str).unwrap_or_default(),
            slug: &self.slug,
        }
    }
}

/// Lower-case, dash-separated form of a display name.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}
