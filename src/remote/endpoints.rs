// ABOUTME: Endpoint paths for both dialects and typed calls built on them
// ABOUTME: Owner updates are deliberately absent here; they live with the ownership manager

use reqwest::{Method, Url};
use serde::Serialize;
use std::collections::BTreeMap;

use super::client::ApiClient;
use super::models::{
    ApplicationPayload, CreateApplicationRequest, CreateJobRequest, CreateModelBuildRequest,
    CreateModelRequest, CreateProjectRequest, CreatedResource, JobPayload, ModelBuildPayload,
    ModelPayload, ProjectList, ProjectPayload, RuntimeAddonPayload, RuntimePage, RuntimePayload,
};
use crate::credentials::Dialect;
use crate::error::ApiError;

const PAGE_SIZE: &str = "1000";

/// Identifier of the Spark add-on that jobs attach on the target.
pub const SPARK_ADDON: &str = "spark";

/// Appends form-encoded query pairs to a relative path.
fn with_query(path: &str, pairs: &[(&str, &str)]) -> String {
    let Ok(mut url) = Url::parse(&format!("http://workspace.invalid/{}", path)) else {
        return path.to_string();
    };
    url.query_pairs_mut().extend_pairs(pairs);
    format!(
        "{}?{}",
        url.path().trim_start_matches('/'),
        url.query().unwrap_or_default()
    )
}

pub mod legacy {
    pub fn api_key(username: &str) -> String {
        format!("api/v1/users/{}/apikey", username)
    }

    pub fn runtimes() -> String {
        "api/v1/runtimes".to_string()
    }

    pub fn project_environment(owner: &str, slug: &str) -> String {
        format!("api/v1/projects/{}/{}/environment", owner, slug)
    }

    pub fn project_file(owner: &str, slug: &str, filename: &str) -> String {
        format!("api/v1/projects/{}/{}/files/{}", owner, slug, filename)
    }

    pub fn jobs(owner: &str, slug: &str) -> String {
        format!("api/v1/projects/{}/{}/jobs", owner, slug)
    }

    pub fn applications(owner: &str, slug: &str) -> String {
        format!("api/v1/projects/{}/{}/applications", owner, slug)
    }
}

pub mod current {
    use super::{with_query, PAGE_SIZE};

    pub fn projects() -> String {
        "api/v2/projects".to_string()
    }

    pub fn search_projects(name: &str) -> String {
        let filter = serde_json::json!({ "name": name }).to_string();
        with_query(
            "api/v2/projects",
            &[("search_filter", filter.as_str()), ("page_size", "100")],
        )
    }

    pub fn all_projects() -> String {
        with_query(
            "api/v2/projects",
            &[("page_size", PAGE_SIZE), ("sort", "-created_at")],
        )
    }

    pub fn project(project_id: &str) -> String {
        format!("api/v2/projects/{}", project_id)
    }

    pub fn jobs(project_id: &str) -> String {
        with_query(
            &format!("api/v2/projects/{}/jobs", project_id),
            &[("page_size", PAGE_SIZE)],
        )
    }

    pub fn job(project_id: &str, job_id: &str) -> String {
        format!("api/v2/projects/{}/jobs/{}", project_id, job_id)
    }

    pub fn models(project_id: &str) -> String {
        with_query(
            &format!("api/v2/projects/{}/models", project_id),
            &[("page_size", PAGE_SIZE)],
        )
    }

    pub fn model_builds(project_id: &str, model_id: &str) -> String {
        format!("api/v2/projects/{}/models/{}/builds", project_id, model_id)
    }

    pub fn applications(project_id: &str) -> String {
        with_query(
            &format!("api/v2/projects/{}/applications", project_id),
            &[("page_size", PAGE_SIZE)],
        )
    }

    pub fn stop_application(project_id: &str, application_id: &str) -> String {
        format!(
            "api/v2/projects/{}/applications/{}:stop",
            project_id, application_id
        )
    }

    pub fn available_runtime_addons(identifier: &str) -> String {
        let filter = serde_json::json!({ "identifier": identifier, "status": "AVAILABLE" }).to_string();
        with_query("api/v2/runtimeaddons", &[("search_filter", filter.as_str())])
    }

    pub fn runtimes(page_token: &str) -> String {
        with_query(
            "api/v2/runtimes",
            &[("page_size", PAGE_SIZE), ("page_token", page_token)],
        )
    }
}

/// Where a project lives, as the legacy dialect addresses it.
#[derive(Debug, Clone)]
pub struct LegacyProjectPath<'a> {
    pub owner: &'a str,
    pub slug: &'a str,
}

fn to_body<T: Serialize>(request: &T) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(request).map_err(|e| ApiError::Decode {
        endpoint: "request body".to_string(),
        message: e.to_string(),
    })
}

impl ApiClient {
    /// Exact-name search first; then every accessible project, compared
    /// case-insensitively, which also finds shared and team projects.
    pub async fn find_project(&self, name: &str) -> Result<Option<ProjectPayload>, ApiError> {
        let response = self
            .call(Dialect::Current, Method::GET, &current::search_projects(name), None)
            .await?;
        let found: ProjectList = response.json()?;
        if let Some(project) = found.projects.into_iter().find(|p| p.name == name) {
            return Ok(Some(project));
        }

        tracing::info!(project = name, "Project not found by name filter, searching all accessible projects");
        let response = self
            .call(Dialect::Current, Method::GET, &current::all_projects(), None)
            .await?;
        let all: ProjectList = response.json()?;
        Ok(all
            .projects
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name)))
    }

    pub async fn get_project(&self, project_id: &str) -> Result<ProjectPayload, ApiError> {
        self.call(Dialect::Current, Method::GET, &current::project(project_id), None)
            .await?
            .json()
    }

    pub async fn create_project(&self, request: &CreateProjectRequest) -> Result<String, ApiError> {
        let body = to_body(request)?;
        let created: CreatedResource = self
            .call(Dialect::Current, Method::POST, &current::projects(), Some(&body))
            .await?
            .json()?;
        Ok(created.id)
    }

    /// All runtimes known to the workspace. Pages through the current
    /// dialect; falls back to the legacy listing when only legacy is usable.
    pub async fn list_runtimes(&self) -> Result<Vec<RuntimePayload>, ApiError> {
        if !self.usable(Dialect::Current) {
            let page: RuntimePage = self
                .call(Dialect::Legacy, Method::GET, &legacy::runtimes(), None)
                .await?
                .json()?;
            return Ok(page.runtimes);
        }

        let mut runtimes = Vec::new();
        let mut page_token = String::new();
        loop {
            let page: RuntimePage = self
                .call(Dialect::Current, Method::GET, &current::runtimes(&page_token), None)
                .await?
                .json()?;
            runtimes.extend(page.runtimes);
            if page.next_page_token.is_empty() {
                break;
            }
            page_token = page.next_page_token;
        }
        Ok(runtimes)
    }

    /// First available add-on matching `identifier`, if the workspace has one.
    pub async fn find_runtime_addon(&self, identifier: &str) -> Result<Option<String>, ApiError> {
        let addons: Vec<RuntimeAddonPayload> = self
            .call(
                Dialect::Current,
                Method::GET,
                &current::available_runtime_addons(identifier),
                None,
            )
            .await?
            .list("runtime_addons")?;
        Ok(addons.into_iter().next().map(|addon| addon.identifier))
    }

    pub async fn list_jobs(
        &self,
        dialect: Dialect,
        project_id: &str,
        legacy_path: &LegacyProjectPath<'_>,
    ) -> Result<Vec<JobPayload>, ApiError> {
        let endpoint = match dialect {
            Dialect::Current => current::jobs(project_id),
            Dialect::Legacy => legacy::jobs(legacy_path.owner, legacy_path.slug),
        };
        self.call(dialect, Method::GET, &endpoint, None)
            .await?
            .list("jobs")
    }

    pub async fn list_applications(
        &self,
        dialect: Dialect,
        project_id: &str,
        legacy_path: &LegacyProjectPath<'_>,
    ) -> Result<Vec<ApplicationPayload>, ApiError> {
        let endpoint = match dialect {
            Dialect::Current => current::applications(project_id),
            Dialect::Legacy => legacy::applications(legacy_path.owner, legacy_path.slug),
        };
        self.call(dialect, Method::GET, &endpoint, None)
            .await?
            .list("applications")
    }

    pub async fn list_models(&self, project_id: &str) -> Result<Vec<ModelPayload>, ApiError> {
        self.call(Dialect::Current, Method::GET, &current::models(project_id), None)
            .await?
            .list("models")
    }

    /// Builds of a model, newest first.
    pub async fn list_model_builds(
        &self,
        project_id: &str,
        model_id: &str,
    ) -> Result<Vec<ModelBuildPayload>, ApiError> {
        self.call(
            Dialect::Current,
            Method::GET,
            &current::model_builds(project_id, model_id),
            None,
        )
        .await?
        .list("model_builds")
    }

    pub async fn create_job(&self, request: &CreateJobRequest) -> Result<String, ApiError> {
        let body = to_body(request)?;
        let endpoint = format!("api/v2/projects/{}/jobs", request.project_id);
        let created: CreatedResource = self
            .call(Dialect::Current, Method::POST, &endpoint, Some(&body))
            .await?
            .json()?;
        Ok(created.id)
    }

    pub async fn set_job_parent(
        &self,
        project_id: &str,
        job_id: &str,
        parent_id: &str,
    ) -> Result<(), ApiError> {
        let body = serde_json::json!({ "parent_id": parent_id });
        self.call_idempotent(
            Dialect::Current,
            Method::PATCH,
            &current::job(project_id, job_id),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    pub async fn create_model(&self, request: &CreateModelRequest) -> Result<String, ApiError> {
        let body = to_body(request)?;
        let endpoint = format!("api/v2/projects/{}/models", request.project_id);
        let created: CreatedResource = self
            .call(Dialect::Current, Method::POST, &endpoint, Some(&body))
            .await?
            .json()?;
        Ok(created.id)
    }

    pub async fn create_model_build(&self, request: &CreateModelBuildRequest) -> Result<(), ApiError> {
        let body = to_body(request)?;
        self.call(
            Dialect::Current,
            Method::POST,
            &current::model_builds(&request.project_id, &request.model_id),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    pub async fn create_application(
        &self,
        request: &CreateApplicationRequest,
    ) -> Result<String, ApiError> {
        let body = to_body(request)?;
        let endpoint = format!("api/v2/projects/{}/applications", request.project_id);
        let created: CreatedResource = self
            .call(Dialect::Current, Method::POST, &endpoint, Some(&body))
            .await?
            .json()?;
        Ok(created.id)
    }

    pub async fn stop_application(&self, project_id: &str, application_id: &str) -> Result<(), ApiError> {
        self.call(
            Dialect::Current,
            Method::POST,
            &current::stop_application(project_id, application_id),
            None,
        )
        .await?;
        Ok(())
    }

    /// Project environment variables. Legacy-only: the current dialect has
    /// no equivalent endpoint.
    pub async fn project_environment(
        &self,
        path: &LegacyProjectPath<'_>,
    ) -> Result<BTreeMap<String, String>, ApiError> {
        let value: serde_json::Value = self
            .call(
                Dialect::Legacy,
                Method::GET,
                &legacy::project_environment(path.owner, path.slug),
                None,
            )
            .await?
            .json()?;
        Ok(crate::metadata::canonical::environment_from_value(Some(&value)).0)
    }

    /// Raw contents of a file in the project tree. Legacy-only.
    pub async fn project_file(
        &self,
        path: &LegacyProjectPath<'_>,
        filename: &str,
    ) -> Result<String, ApiError> {
        let response = self
            .call(
                Dialect::Legacy,
                Method::GET,
                &legacy::project_file(path.owner, path.slug, filename),
                None,
            )
            .await?;
        Ok(response.body)
    }
}
