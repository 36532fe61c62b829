// ABOUTME: Post-import check of the metadata phase
// ABOUTME: Re-lists the target project and flags exported records it does not show

use std::collections::HashSet;

use super::canonical::{CanonicalMetadataRecord, ProjectSnapshot, RecordKind};
use super::collect::MetadataCollector;
use crate::credentials::Dialect;
use crate::error::ApiError;
use crate::project::ProjectIdentity;
use crate::report::{plural, singular, WarningKind};

impl<'a> MetadataCollector<'a> {
    /// Lists the target again after an import and warns once per exported
    /// record it does not show. Returns the number of missing records. A
    /// listing that fails is a warning, never an error.
    pub async fn validate(&self, snapshot: &ProjectSnapshot, target: &ProjectIdentity) -> usize {
        let path = target.legacy_path();
        let (jobs, models, applications) = futures::join!(
            self.client.list_jobs(Dialect::Current, &target.id, &path),
            self.client.list_models(&target.id),
            self.client.list_applications(Dialect::Current, &target.id, &path),
        );

        let jobs: Result<HashSet<String>, ApiError> = jobs.map(|jobs| {
            jobs.into_iter()
                .map(|job| CanonicalMetadataRecord::from_job(job).0.identity_key())
                .collect()
        });
        let models: Result<HashSet<String>, ApiError> =
            models.map(|models| models.into_iter().map(|m| m.name).collect());
        let applications: Result<HashSet<String>, ApiError> = applications.map(|apps| {
            apps.into_iter()
                .map(|app| CanonicalMetadataRecord::from_application(app).0.identity_key())
                .collect()
        });

        let missing = self.missing_on_target(RecordKind::Job, &snapshot.jobs, jobs)
            + self.missing_on_target(RecordKind::Model, &snapshot.models, models)
            + self.missing_on_target(RecordKind::Application, &snapshot.applications, applications);

        tracing::info!(project = %target.name, missing, "Validated imported metadata");
        missing
    }

    fn missing_on_target(
        &self,
        kind: RecordKind,
        records: &[CanonicalMetadataRecord],
        listed: Result<HashSet<String>, ApiError>,
    ) -> usize {
        if records.is_empty() {
            return 0;
        }
        let listed = match listed {
            Ok(listed) => listed,
            Err(err) => {
                self.report.warn(
                    WarningKind::ImportValidation,
                    format!("could not list {} to validate the import: {}", plural(kind), err),
                );
                return 0;
            }
        };

        let missing: Vec<&CanonicalMetadataRecord> = records
            .iter()
            .filter(|record| !listed.contains(&record.identity_key()))
            .collect();
        for record in &missing {
            self.report.warn(
                WarningKind::ImportValidation,
                format!("{} '{}' is not on the target after import", singular(kind), record.name),
            );
        }
        missing.len()
    }
}
