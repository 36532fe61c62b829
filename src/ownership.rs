// ABOUTME: Scoped elevation of a project's owner with guaranteed restoration
// ABOUTME: The only place in the crate that issues owner-update calls

use futures::FutureExt;
use reqwest::Method;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::credentials::Dialect;
use crate::error::{ApiError, MigratorError};
use crate::project::{Identity, ProjectIdentity};
use crate::remote::client::ApiClient;
use crate::remote::endpoints;

/// Proof that an elevation scope is open. Consumed by
/// [`OwnershipManager::release`].
#[derive(Debug)]
pub struct OwnershipToken {
    project_id: String,
    original_owner: Option<Identity>,
    changed: bool,
    armed: bool,
}

impl OwnershipToken {
    pub fn original_owner(&self) -> Option<&Identity> {
        self.original_owner.as_ref()
    }

    pub fn changed(&self) -> bool {
        self.changed
    }
}

impl Drop for OwnershipToken {
    fn drop(&mut self) {
        if self.armed && self.changed {
            tracing::error!(
                project_id = %self.project_id,
                original_owner = ?self.original_owner,
                "Ownership token dropped without release; the project owner was not restored"
            );
        }
    }
}

/// Result of [`OwnershipManager::scoped`]. The work result and the restore
/// failure are kept apart so neither hides the other.
#[derive(Debug)]
pub struct ScopedOutcome<T> {
    pub result: Result<T, MigratorError>,
    /// Whether acquire succeeded and a release step ran.
    pub acquired: bool,
    pub changed: bool,
    pub restore_error: Option<MigratorError>,
}

pub struct OwnershipManager<'a> {
    client: &'a ApiClient,
    outstanding: Mutex<HashSet<String>>,
}

impl<'a> OwnershipManager<'a> {
    pub fn new(client: &'a ApiClient) -> Self {
        Self {
            client,
            outstanding: Mutex::new(HashSet::new()),
        }
    }

    fn outstanding(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.outstanding.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes `acting_identity` the owner of the project unless it already is.
    pub async fn acquire(
        &self,
        project_id: &str,
        acting_identity: &Identity,
    ) -> Result<OwnershipToken, MigratorError> {
        if !self.outstanding().insert(project_id.to_string()) {
            return Err(MigratorError::ReentrantAcquire {
                project_id: project_id.to_string(),
            });
        }

        match self.elevate(project_id, acting_identity).await {
            Ok(token) => Ok(token),
            Err(err) => {
                self.outstanding().remove(project_id);
                Err(err)
            }
        }
    }

    async fn elevate(
        &self,
        project_id: &str,
        acting_identity: &Identity,
    ) -> Result<OwnershipToken, MigratorError> {
        let project = ProjectIdentity::from_payload(self.client.get_project(project_id).await?);
        let original_owner = project.owner;

        if original_owner.as_ref() == Some(acting_identity) {
            tracing::info!(project_id, owner = %acting_identity, "Acting identity already owns the project");
            return Ok(OwnershipToken {
                project_id: project_id.to_string(),
                original_owner,
                changed: false,
                armed: true,
            });
        }

        update_owner(self.client, project_id, acting_identity).await?;
        tracing::info!(
            project_id,
            from = ?original_owner,
            to = %acting_identity,
            "Elevated project ownership"
        );

        Ok(OwnershipToken {
            project_id: project_id.to_string(),
            original_owner,
            changed: true,
            armed: true,
        })
    }

    /// Restores the original owner. A no-op for unchanged tokens.
    pub async fn release(&self, mut token: OwnershipToken) -> Result<(), MigratorError> {
        token.armed = false;
        self.outstanding().remove(&token.project_id);

        if !token.changed {
            return Ok(());
        }

        let Some(original) = token.original_owner.as_ref() else {
            tracing::warn!(project_id = %token.project_id, "Original owner unknown, leaving ownership with the acting identity");
            return Ok(());
        };

        match update_owner(self.client, &token.project_id, original).await {
            Ok(()) => {
                tracing::info!(project_id = %token.project_id, owner = %original, "Restored project ownership");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    project_id = %token.project_id,
                    owner = %original,
                    error = %err,
                    "Failed to restore project ownership"
                );
                Err(err.into())
            }
        }
    }

    /// Runs `work` inside an elevation scope. Release runs exactly once on
    /// every exit path of the work: success, error, panic or cancellation.
    /// Cancellation before acquire skips the scope entirely.
    pub async fn scoped<T, F, Fut>(
        &self,
        project_id: &str,
        acting_identity: &Identity,
        cancel: &CancellationToken,
        work: F,
    ) -> ScopedOutcome<T>
    where
        F: FnOnce(&OwnershipToken) -> Fut,
        Fut: Future<Output = Result<T, MigratorError>>,
    {
        if cancel.is_cancelled() {
            return ScopedOutcome {
                result: Err(MigratorError::Cancelled),
                acquired: false,
                changed: false,
                restore_error: None,
            };
        }

        let token = match self.acquire(project_id, acting_identity).await {
            Ok(token) => token,
            Err(err) => {
                return ScopedOutcome {
                    result: Err(err),
                    acquired: false,
                    changed: false,
                    restore_error: None,
                }
            }
        };
        let changed = token.changed;

        let guarded = AssertUnwindSafe(work(&token)).catch_unwind();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!(project_id, "Run cancelled inside ownership scope");
                Err(MigratorError::Cancelled)
            }
            outcome = guarded => match outcome {
                Ok(result) => result,
                Err(panic) => Err(MigratorError::Panicked(panic_message(panic))),
            },
        };

        let restore_error = self.release(token).await.err();

        ScopedOutcome {
            result,
            acquired: true,
            changed,
            restore_error,
        }
    }
}

async fn update_owner(
    client: &ApiClient,
    project_id: &str,
    owner: &Identity,
) -> Result<(), ApiError> {
    let body = serde_json::json!({ "owner": { "username": owner.as_str() } });
    client
        .call_idempotent(
            Dialect::Current,
            Method::PATCH,
            &endpoints::current::project(project_id),
            Some(&body),
        )
        .await?;
    Ok(())
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
