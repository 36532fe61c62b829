// ABOUTME: Data structures for workspace API payloads in both dialects
// ABOUTME: Field aliases absorb camelCase/snake_case drift; create bodies are serialized to JSON

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Legacy ids are integers, current ids are strings.
pub fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdHelper {
        Text(String),
        Number(i64),
    }

    Ok(match IdHelper::deserialize(deserializer)? {
        IdHelper::Text(s) => s,
        IdHelper::Number(n) => n.to_string(),
    })
}

fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "deserialize_id")] String);

    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserRef {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectPayload {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub slug_raw: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub visibility: Option<String>,
    #[serde(default)]
    pub owner: Option<UserRef>,
    #[serde(default)]
    pub creator: Option<UserRef>,
    #[serde(default, alias = "defaultEngineType")]
    pub default_engine_type: Option<String>,
    #[serde(default)]
    pub default_project_engine_type: Option<String>,
    #[serde(default, alias = "sharedMemoryLimit")]
    pub shared_memory_limit: Option<i64>,
}

/// Nested runtime block some payloads carry instead of flat fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeRef {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub kernel: Option<String>,
    #[serde(default, alias = "imageIdentifier")]
    pub image_identifier: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobPayload {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub kernel: Option<String>,
    #[serde(default)]
    pub runtime: Option<RuntimeRef>,
    #[serde(default, alias = "runtimeId")]
    pub runtime_id: Option<i64>,
    #[serde(default, alias = "runtimeIdentifier")]
    pub runtime_identifier: Option<String>,
    #[serde(default, alias = "runtimeAddonIdentifiers")]
    pub runtime_addon_identifiers: Vec<String>,
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub memory: Option<f64>,
    #[serde(default, alias = "nvidia_gpus", alias = "nvidiaGpu")]
    pub nvidia_gpu: Option<i64>,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub timeout: Option<i64>,
    #[serde(default)]
    pub arguments: Option<String>,
    #[serde(default, alias = "killOnTimeout")]
    pub kill_on_timeout: Option<bool>,
    #[serde(default, alias = "parentId", deserialize_with = "deserialize_opt_id")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub environment: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelPayload {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "authEnabled")]
    pub auth_enabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelBuildPayload {
    #[serde(default, alias = "filePath")]
    pub file_path: Option<String>,
    #[serde(default, alias = "functionName")]
    pub function_name: Option<String>,
    #[serde(default)]
    pub kernel: Option<String>,
    #[serde(default, alias = "runtimeId")]
    pub runtime_id: Option<i64>,
    #[serde(default, alias = "runtimeIdentifier")]
    pub runtime_identifier: Option<String>,
    #[serde(default, alias = "runtimeAddonIdentifiers")]
    pub runtime_addon_identifiers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationPayload {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub subdomain: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub kernel: Option<String>,
    #[serde(default)]
    pub runtime: Option<RuntimeRef>,
    #[serde(default, alias = "runtimeIdentifier")]
    pub runtime_identifier: Option<String>,
    #[serde(default, alias = "runtimeAddonIdentifiers")]
    pub runtime_addon_identifiers: Vec<String>,
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub memory: Option<f64>,
    #[serde(default, alias = "nvidia_gpus", alias = "nvidiaGpu")]
    pub nvidia_gpu: Option<i64>,
    #[serde(default, alias = "bypassAuthentication")]
    pub bypass_authentication: Option<bool>,
    #[serde(default)]
    pub environment: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimePayload {
    pub id: i64,
    #[serde(default, alias = "imageIdentifier")]
    pub image_identifier: Option<String>,
    #[serde(default)]
    pub kernel: String,
    #[serde(default)]
    pub edition: String,
    #[serde(default)]
    pub editor: String,
    #[serde(default, alias = "shortVersion")]
    pub short_version: Option<String>,
    #[serde(default, alias = "fullVersion")]
    pub full_version: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimePage {
    #[serde(default)]
    pub runtimes: Vec<RuntimePayload>,
    #[serde(default)]
    pub next_page_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeAddonPayload {
    pub identifier: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectList {
    #[serde(default)]
    pub projects: Vec<ProjectPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatedResource {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyResponse {
    #[serde(rename = "apiKey")]
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub template: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_project_engine_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_memory_limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_name: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateJobRequest {
    pub project_id: String,
    pub name: String,
    pub script: String,
    pub paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_identifier: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub runtime_addon_identifiers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nvidia_gpu: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kill_on_timeout: Option<bool>,
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateModelRequest {
    pub project_id: String,
    pub name: String,
    pub description: String,
    pub disable_authentication: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateModelBuildRequest {
    pub project_id: String,
    pub model_id: String,
    pub file_path: String,
    pub function_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_identifier: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub runtime_addon_identifiers: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateApplicationRequest {
    pub project_id: String,
    pub name: String,
    pub subdomain: String,
    pub description: String,
    pub script: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_identifier: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub runtime_addon_identifiers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nvidia_gpu: Option<i64>,
    pub bypass_authentication: bool,
    pub environment: BTreeMap<String, String>,
}
