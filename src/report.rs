// ABOUTME: Migration report and the synchronized accumulator that builds it
// ABOUTME: Concurrent metadata tasks append here; the report is frozen when the run ends

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::MigratorError;
use crate::metadata::canonical::RecordKind;
use crate::orchestrator::RunState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Export,
    Import,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Export => write!(f, "export"),
            Direction::Import => write!(f, "import"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::Partial => write!(f, "partial"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    OwnershipRestoreFailed,
    PartialMetadataFailure,
    LegacyUnavailable,
    RuntimeFallback,
    TransferVerification,
    ModelBuildFailed,
    ScriptPathRewritten,
    JobDependency,
    TeamProject,
    Environment,
    ImportValidation,
    ScriptPlaceholder,
}

impl WarningKind {
    /// What an operator has to do by hand about a warning of this kind.
    pub fn follow_up(self) -> &'static str {
        match self {
            WarningKind::OwnershipRestoreFailed => "Set the project owner back to the original owner",
            WarningKind::PartialMetadataFailure => "Recreate the item on the target project",
            WarningKind::LegacyUnavailable => "Copy the skipped project settings by hand",
            WarningKind::RuntimeFallback => "Test the item on the substitute runtime or install the original one",
            WarningKind::TransferVerification => "Re-run the transfer or compare the listed paths",
            WarningKind::ModelBuildFailed => "Start a new build of the model with a suitable runtime",
            WarningKind::ScriptPathRewritten => "Point the application script back to its original path",
            WarningKind::JobDependency => "Set the job's parent job on the target",
            WarningKind::TeamProject => "Create the team on the target before importing",
            WarningKind::Environment => "Check the environment variables on the target",
            WarningKind::ImportValidation => "Check that the item exists on the target project",
            WarningKind::ScriptPlaceholder => "Make the application script available on the target",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportWarning {
    pub kind: WarningKind,
    pub message: String,
}

/// Names of the records handled in one category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CategoryReport {
    pub processed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

impl CategoryReport {
    pub fn count(&self) -> usize {
        self.processed.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub direction: Direction,
    pub project: String,
    pub jobs: CategoryReport,
    pub models: CategoryReport,
    pub applications: CategoryReport,
    pub elapsed_ms: u64,
    pub status: RunStatus,
    pub warnings: Vec<ReportWarning>,
    pub states: Vec<RunState>,
    /// Code and message of the fatal error, if any.
    pub error: Option<String>,
    /// Where the manual steps manifest was written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_steps: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManualStep {
    pub kind: WarningKind,
    pub detail: String,
    pub action: &'static str,
}

/// Everything a run left for an operator to finish by hand.
#[derive(Debug, Clone, Serialize)]
pub struct ManualStepsManifest {
    pub generated_at: String,
    pub project: String,
    pub direction: Direction,
    pub status: RunStatus,
    pub jobs: CategoryReport,
    pub models: CategoryReport,
    pub applications: CategoryReport,
    pub steps: Vec<ManualStep>,
}

impl MigrationReport {
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    pub fn warnings_of(&self, kind: WarningKind) -> impl Iterator<Item = &ReportWarning> {
        self.warnings.iter().filter(move |w| w.kind == kind)
    }

    /// One step per warning; `None` when the run left nothing to do.
    pub fn manual_steps(&self) -> Option<ManualStepsManifest> {
        if self.warnings.is_empty() {
            return None;
        }
        Some(ManualStepsManifest {
            generated_at: chrono::Utc::now().to_rfc3339(),
            project: self.project.clone(),
            direction: self.direction,
            status: self.status,
            jobs: self.jobs.clone(),
            models: self.models.clone(),
            applications: self.applications.clone(),
            steps: self
                .warnings
                .iter()
                .map(|w| ManualStep {
                    kind: w.kind,
                    detail: w.message.clone(),
                    action: w.kind.follow_up(),
                })
                .collect(),
        })
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "{} of '{}': {} in {:.1}s",
            self.direction,
            self.project,
            self.status,
            self.elapsed().as_secs_f64()
        )?;
        for (label, category) in [
            ("jobs", &self.jobs),
            ("models", &self.models),
            ("applications", &self.applications),
        ] {
            writeln!(
                f,
                "  {:<13} {} processed, {} skipped, {} failed",
                label,
                category.processed.len(),
                category.skipped.len(),
                category.failed.len()
            )?;
        }
        for warning in &self.warnings {
            writeln!(f, "  warning: {}", warning.message)?;
        }
        if let Some(error) = &self.error {
            writeln!(f, "  error: {}", error)?;
        }
        if let Some(path) = &self.manual_steps {
            writeln!(f, "  manual steps: {}", path.display())?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Draft {
    jobs: CategoryReport,
    models: CategoryReport,
    applications: CategoryReport,
    warnings: Vec<ReportWarning>,
    states: Vec<RunState>,
    partial: bool,
}

impl Draft {
    fn category(&mut self, kind: RecordKind) -> &mut CategoryReport {
        match kind {
            RecordKind::Job => &mut self.jobs,
            RecordKind::Model => &mut self.models,
            RecordKind::Application => &mut self.applications,
        }
    }
}

/// Append-only, shareable view of the report under construction.
#[derive(Debug, Clone)]
pub struct ReportAccumulator {
    direction: Direction,
    project: String,
    started: Instant,
    draft: Arc<Mutex<Draft>>,
}

impl ReportAccumulator {
    pub fn new(direction: Direction, project: &str) -> Self {
        Self {
            direction,
            project: project.to_string(),
            started: Instant::now(),
            draft: Arc::new(Mutex::new(Draft {
                jobs: CategoryReport::default(),
                models: CategoryReport::default(),
                applications: CategoryReport::default(),
                warnings: Vec::new(),
                states: Vec::new(),
                partial: false,
            })),
        }
    }

    fn draft(&self) -> MutexGuard<'_, Draft> {
        self.draft.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn processed(&self, kind: RecordKind, name: &str) {
        self.draft().category(kind).processed.push(name.to_string());
    }

    pub fn skipped(&self, kind: RecordKind, name: &str) {
        self.draft().category(kind).skipped.push(name.to_string());
    }

    /// One record failed; the run ends partial.
    pub fn failed(&self, kind: RecordKind, name: &str, reason: &str) {
        let mut draft = self.draft();
        draft.category(kind).failed.push(name.to_string());
        draft.partial = true;
        draft.warnings.push(ReportWarning {
            kind: WarningKind::PartialMetadataFailure,
            message: format!("{} '{}' failed: {}", singular(kind), name, reason),
        });
    }

    /// A whole category could not be handled; the run ends partial.
    pub fn category_failed(&self, kind: RecordKind, reason: &str) {
        let mut draft = self.draft();
        draft.partial = true;
        draft.warnings.push(ReportWarning {
            kind: WarningKind::PartialMetadataFailure,
            message: format!("{} could not be migrated: {}", plural(kind), reason),
        });
    }

    pub fn warn(&self, kind: WarningKind, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(kind = ?kind, "{}", message);
        self.draft().warnings.push(ReportWarning { kind, message });
    }

    pub fn transition(&self, state: RunState) {
        tracing::info!(project = %self.project, direction = %self.direction, state = ?state, "State transition");
        self.draft().states.push(state);
    }

    /// Freezes the report. A fatal error makes it `failed`; otherwise any
    /// per-record or per-category failure makes it `partial`.
    pub fn finish(&self, error: Option<&MigratorError>) -> MigrationReport {
        let draft = self.draft();
        let status = match (error, draft.partial) {
            (Some(_), _) => RunStatus::Failed,
            (None, true) => RunStatus::Partial,
            (None, false) => RunStatus::Success,
        };
        MigrationReport {
            direction: self.direction,
            project: self.project.clone(),
            jobs: draft.jobs.clone(),
            models: draft.models.clone(),
            applications: draft.applications.clone(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            status,
            warnings: draft.warnings.clone(),
            states: draft.states.clone(),
            error: error.map(|e| format!("{}: {}", e.code(), e)),
            manual_steps: None,
        }
    }
}

pub(crate) fn singular(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Job => "job",
        RecordKind::Model => "model",
        RecordKind::Application => "application",
    }
}

pub(crate) fn plural(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Job => "jobs",
        RecordKind::Model => "models",
        RecordKind::Application => "applications",
    }
}
