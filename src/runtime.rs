// ABOUTME: Runtime selection for the transfer channel and for imported records
// ABOUTME: Picks a transfer-capable runtime and matches record requirements against a catalog

use serde::{Deserialize, Serialize};

use crate::error::{ApiError, MigratorError};
use crate::remote::client::ApiClient;
use crate::remote::models::RuntimePayload;

const TRANSFER_EDITION: &str = "rsync";
const STATUS_AVAILABLE: &str = "AVAILABLE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LanguageFamily {
    Python,
    R,
    Scala,
    Other,
}

impl LanguageFamily {
    /// Family of a kernel label such as "Python 3.9" or "R 4.1".
    pub fn from_kernel(kernel: &str) -> Self {
        let kernel = kernel.trim();
        if kernel.to_ascii_lowercase().starts_with("python") {
            LanguageFamily::Python
        } else if kernel == "R" || kernel.starts_with("R ") {
            LanguageFamily::R
        } else if kernel.to_ascii_lowercase().contains("scala") {
            LanguageFamily::Scala
        } else {
            LanguageFamily::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeDescriptor {
    pub id: i64,
    pub is_transfer_capable: bool,
    pub language_family: LanguageFamily,
}

pub struct RuntimeResolver {
    default_family: LanguageFamily,
}

impl Default for RuntimeResolver {
    fn default() -> Self {
        Self {
            default_family: LanguageFamily::Python,
        }
    }
}

impl RuntimeResolver {
    /// Transfer-capable first, then the default language family, then
    /// whatever comes first.
    pub fn select(&self, candidates: &[RuntimeDescriptor]) -> Result<RuntimeDescriptor, MigratorError> {
        let chosen = candidates
            .iter()
            .find(|r| r.is_transfer_capable)
            .or_else(|| {
                tracing::info!(family = ?self.default_family, "No transfer-capable runtime, looking for fallback");
                candidates
                    .iter()
                    .find(|r| r.language_family == self.default_family)
            })
            .or_else(|| candidates.first())
            .cloned()
            .ok_or(MigratorError::NoRuntimeAvailable)?;

        tracing::info!(
            runtime_id = chosen.id,
            transfer_capable = chosen.is_transfer_capable,
            "Selected runtime for transfer session"
        );
        Ok(chosen)
    }
}

/// What a job, model or application needs to run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeRequirement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeEntry {
    pub id: i64,
    pub image_identifier: Option<String>,
    pub kernel: String,
    pub edition: String,
    pub editor: String,
    pub short_version: Option<String>,
    pub full_version: Option<String>,
    pub available: bool,
}

impl From<RuntimePayload> for RuntimeEntry {
    fn from(p: RuntimePayload) -> Self {
        let available = p
            .status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case(STATUS_AVAILABLE))
            .unwrap_or(true);
        RuntimeEntry {
            id: p.id,
            image_identifier: p.image_identifier,
            kernel: p.kernel,
            edition: p.edition,
            editor: p.editor,
            short_version: p.short_version,
            full_version: p.full_version,
            available,
        }
    }
}

impl RuntimeEntry {
    pub fn descriptor(&self) -> RuntimeDescriptor {
        RuntimeDescriptor {
            id: self.id,
            is_transfer_capable: self.edition.to_ascii_lowercase().contains(TRANSFER_EDITION),
            language_family: LanguageFamily::from_kernel(&self.kernel),
        }
    }

    /// Requirement fields describing this runtime, minus add-ons.
    pub fn requirement(&self) -> RuntimeRequirement {
        RuntimeRequirement {
            identifier: self.image_identifier.clone(),
            kernel: Some(self.kernel.clone()).filter(|k| !k.is_empty()),
            edition: Some(self.edition.clone()).filter(|e| !e.is_empty()),
            editor: Some(self.editor.clone()).filter(|e| !e.is_empty()),
            short_version: self.short_version.clone(),
            full_version: self.full_version.clone(),
            addons: Vec::new(),
        }
    }
}

/// Outcome of matching a requirement against the target catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeChoice {
    /// The required image exists as-is.
    Exact(String),
    /// The required image is missing; `chosen` stands in for it.
    Fallback {
        required: Option<String>,
        chosen: String,
    },
    Unavailable,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeCatalog {
    entries: Vec<RuntimeEntry>,
}

impl RuntimeCatalog {
    pub fn new(entries: Vec<RuntimeEntry>) -> Self {
        Self { entries }
    }

    pub async fn fetch(client: &ApiClient) -> Result<Self, ApiError> {
        let runtimes = client.list_runtimes().await?;
        tracing::info!(count = runtimes.len(), "Fetched runtime catalog");
        Ok(Self::new(runtimes.into_iter().map(RuntimeEntry::from).collect()))
    }

    /// Transfer-channel candidates: runtimes not marked unavailable.
    pub fn descriptors(&self) -> Vec<RuntimeDescriptor> {
        self.entries
            .iter()
            .filter(|e| e.available)
            .map(RuntimeEntry::descriptor)
            .collect()
    }

    pub fn find_by_identifier(&self, identifier: &str) -> Option<&RuntimeEntry> {
        self.entries
            .iter()
            .find(|e| e.image_identifier.as_deref() == Some(identifier))
    }

    pub fn contains_identifier(&self, identifier: &str) -> bool {
        self.find_by_identifier(identifier).is_some()
    }

    fn first_identifier(&self) -> Option<&str> {
        self.entries
            .iter()
            .filter(|e| e.available)
            .find_map(|e| e.image_identifier.as_deref())
    }

    /// Progressively looser match on kernel, edition, editor and versions.
    /// A "Standard" edition also accepts "Rsync", which is Standard plus the
    /// transfer tooling.
    pub fn best_match(&self, req: &RuntimeRequirement) -> Option<&str> {
        let kernel = req.kernel.as_deref()?;
        let same = |a: &Option<String>, b: &str| a.as_deref() == Some(b);
        let same_opt = |a: &Option<String>, b: &Option<String>| a.is_some() && a == b;

        let tiers: [&dyn Fn(&RuntimeEntry) -> bool; 5] = [
            &|e| {
                same(&req.edition, &e.edition)
                    && same(&req.editor, &e.editor)
                    && same_opt(&req.short_version, &e.short_version)
                    && same_opt(&req.full_version, &e.full_version)
            },
            &|e| {
                same(&req.edition, &e.edition)
                    && same(&req.editor, &e.editor)
                    && same_opt(&req.short_version, &e.short_version)
            },
            &|e| {
                let edition_ok = same(&req.edition, &e.edition)
                    || (same(&req.edition, "Standard") && e.edition == "Rsync");
                edition_ok && same(&req.editor, &e.editor)
            },
            &|e| same(&req.editor, &e.editor),
            &|_| true,
        ];

        tiers.iter().find_map(|tier| {
            self.entries
                .iter()
                .filter(|e| e.kernel == kernel && tier(e))
                .find_map(|e| e.image_identifier.as_deref())
        })
    }

    /// Exact image, then best match, then (if `allow_any`) the first
    /// available runtime.
    pub fn choose(&self, req: &RuntimeRequirement, allow_any: bool) -> RuntimeChoice {
        if let Some(identifier) = req.identifier.as_deref() {
            if self.contains_identifier(identifier) {
                return RuntimeChoice::Exact(identifier.to_string());
            }
        }

        let fallback = self
            .best_match(req)
            .or_else(|| allow_any.then(|| self.first_identifier()).flatten());

        match fallback {
            Some(chosen) => RuntimeChoice::Fallback {
                required: req.identifier.clone(),
                chosen: chosen.to_string(),
            },
            None => RuntimeChoice::Unavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: i64, capable: bool, family: LanguageFamily) -> RuntimeDescriptor {
        RuntimeDescriptor {
            id,
            is_transfer_capable: capable,
            language_family: family,
        }
    }

    fn entry(id: i64, image: &str, kernel: &str, edition: &str, short: &str) -> RuntimeEntry {
        RuntimeEntry {
            id,
            image_identifier: Some(image.to_string()),
            kernel: kernel.to_string(),
            edition: edition.to_string(),
            editor: "Workbench".to_string(),
            short_version: Some(short.to_string()),
            full_version: Some(format!("{}-b1", short)),
            available: true,
        }
    }

    #[test]
    fn test_transfer_capable_runtime_wins() {
        let resolver = RuntimeResolver::default();
        let chosen = resolver
            .select(&[
                descriptor(1, false, LanguageFamily::Python),
                descriptor(2, true, LanguageFamily::R),
            ])
            .unwrap();
        assert_eq!(chosen.id, 2);
    }

    #[test]
    fn test_default_family_then_first() {
        let resolver = RuntimeResolver::default();
        let chosen = resolver
            .select(&[
                descriptor(1, false, LanguageFamily::R),
                descriptor(2, false, LanguageFamily::Python),
            ])
            .unwrap();
        assert_eq!(chosen.id, 2);

        let chosen = resolver
            .select(&[
                descriptor(3, false, LanguageFamily::Scala),
                descriptor(4, false, LanguageFamily::R),
            ])
            .unwrap();
        assert_eq!(chosen.id, 3);
    }

    #[test]
    fn test_empty_candidates_fail() {
        let err = RuntimeResolver::default().select(&[]).unwrap_err();
        assert!(matches!(err, MigratorError::NoRuntimeAvailable));
    }

    #[test]
    fn test_descriptor_from_entry() {
        let e = entry(9, "img:rsync", "Python 3.10", "Rsync", "2024.02");
        let d = e.descriptor();
        assert!(d.is_transfer_capable);
        assert_eq!(d.language_family, LanguageFamily::Python);
        assert_eq!(LanguageFamily::from_kernel("R 4.3"), LanguageFamily::R);
        assert_eq!(LanguageFamily::from_kernel("Scala 2.11"), LanguageFamily::Scala);
    }

    #[test]
    fn test_unavailable_runtimes_are_not_candidates() {
        let mut broken = entry(1, "img:a", "Python 3.9", "Rsync", "2023.08");
        broken.available = false;
        let catalog = RuntimeCatalog::new(vec![broken, entry(2, "img:b", "Python 3.9", "Standard", "2023.08")]);
        let ids: Vec<i64> = catalog.descriptors().iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_choose_prefers_exact_identifier() {
        let catalog = RuntimeCatalog::new(vec![entry(1, "img:py39", "Python 3.9", "Standard", "2023.08")]);
        let req = RuntimeRequirement {
            identifier: Some("img:py39".into()),
            ..Default::default()
        };
        assert_eq!(catalog.choose(&req, false), RuntimeChoice::Exact("img:py39".into()));
    }

    #[test]
    fn test_best_match_loosens_versions() {
        let catalog = RuntimeCatalog::new(vec![
            entry(1, "img:r", "R 4.1", "Standard", "2024.02"),
            entry(2, "img:py-new", "Python 3.9", "Rsync", "2024.02"),
        ]);
        let req = RuntimeRequirement {
            identifier: Some("img:py-old".into()),
            kernel: Some("Python 3.9".into()),
            edition: Some("Standard".into()),
            editor: Some("Workbench".into()),
            short_version: Some("2022.11".into()),
            full_version: Some("2022.11-b1".into()),
            addons: vec![],
        };
        assert_eq!(
            catalog.choose(&req, false),
            RuntimeChoice::Fallback {
                required: Some("img:py-old".into()),
                chosen: "img:py-new".into()
            }
        );
    }

    #[test]
    fn test_choose_without_kernel_needs_allow_any() {
        let catalog = RuntimeCatalog::new(vec![entry(1, "img:a", "Python 3.9", "Standard", "2023.08")]);
        let req = RuntimeRequirement {
            identifier: Some("img:gone".into()),
            ..Default::default()
        };
        assert_eq!(catalog.choose(&req, false), RuntimeChoice::Unavailable);
        assert!(matches!(
            catalog.choose(&req, true),
            RuntimeChoice::Fallback { chosen, .. } if chosen == "img:a"
        ));
    }
}
