use std::collections::HashMap;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::models::null_as_default;

/// One place an image reference is deployed, as reported by image-tool
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ImageUsage {
    pub cluster: String,
    pub used_in_namespace: String,
    pub from_namespace: String,
    pub age_in_days: i64,
    pub image: String,
    pub registry_url: String,
}

/// image name -> tag -> deployments. image-tool writes `null` for empty levels.
type UsedTags = HashMap<String, Option<HashMap<String, Option<Vec<ImageUsage>>>>>;

/// Per-family section of the image-tool report. Only the used tags are read.
#[derive(Debug, Default, Deserialize)]
pub struct FamilyUsage {
    #[serde(rename = "UsedIstags", default, deserialize_with = "null_as_default")]
    pub used_istags: UsedTags,
}

/// Answers "is this image reference deployed anywhere"
pub trait UsageLookup {
    fn find(&self, reference: &str) -> Option<&ImageUsage>;
}

/// Usage report of one organization
#[derive(Debug, Default)]
pub struct ImageToolReport {
    entries: Vec<ImageUsage>,
}

impl ImageToolReport {
    /// Run `image-tool -family <org> -used -json -statcfg` and keep the
    /// organization's used tags.
    pub async fn load(org: &str) -> Result<Self, AppError> {
        debug!("Running image-tool for family {}", org);
        let output = Command::new("image-tool")
            .args(["-family", org, "-used", "-json", "-statcfg"])
            .output()
            .await
            .map_err(|e| AppError::UsageReport(format!("failed to run image-tool: {}", e)))?;
        if !output.status.success() {
            return Err(AppError::UsageReport(format!(
                "image-tool exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let report = Self::from_json(org, &output.stdout)?;
        if report.is_empty() {
            warn!("image-tool reported no used images for {}", org);
        }
        info!(
            "Loaded usage report for {} with {} entries",
            org,
            report.len()
        );
        Ok(report)
    }

    /// Parse image-tool JSON output, keyed by family name
    pub fn from_json(org: &str, json: &[u8]) -> Result<Self, AppError> {
        let mut families: HashMap<String, Option<FamilyUsage>> = serde_json::from_slice(json)
            .map_err(|e| AppError::UsageReport(format!("invalid image-tool output: {}", e)))?;
        let family = families.remove(org).flatten().unwrap_or_default();
        Ok(Self::from_entries(
            family
                .used_istags
                .into_values()
                .flatten()
                .flat_map(HashMap::into_values)
                .flatten()
                .flatten()
                .collect(),
        ))
    }

    pub fn from_entries(entries: Vec<ImageUsage>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl UsageLookup for ImageToolReport {
    /// Substring match against each entry's registry URL. A short reference
    /// can match a longer unrelated one.
    fn find(&self, reference: &str) -> Option<&ImageUsage> {
        self.entries
            .iter()
            .find(|u| u.registry_url.contains(reference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"{
        "team": {
            "AllIstags": {"prod": {"Report": {"Anz_Images": 3}}},
            "UsedIstags": {
                "app": {
                    "v1": [{
                        "Cluster": "prod",
                        "UsedInNamespace": "team-prod",
                        "FromNamespace": "team-images",
                        "AgeInDays": 12,
                        "Image": "app",
                        "RegistryUrl": "quay.example.com/team/app:v1"
                    }]
                }
            },
            "UnUsedIstags": null
        },
        "other": {"UsedIstags": {"x": {"y": [{"RegistryUrl": "other-images/x:y"}]}}}
    }"#;

    #[test]
    fn test_from_json_reads_only_requested_family() {
        let report = ImageToolReport::from_json("team", REPORT.as_bytes()).unwrap();
        assert_eq!(report.len(), 1);
        let hit = report.find("quay.example.com/team/app:v1").unwrap();
        assert_eq!(hit.cluster, "prod");
        assert_eq!(hit.used_in_namespace, "team-prod");
        assert_eq!(hit.age_in_days, 12);
        assert!(report.find("other-images/x:y").is_none());
    }

    #[test]
    fn test_unknown_family_is_empty() {
        let report = ImageToolReport::from_json("nobody", REPORT.as_bytes()).unwrap();
        assert!(report.is_empty());
    }

    #[test]
    fn test_null_sections_are_empty() {
        let json = r#"{
            "team": {
                "UsedIstags": {
                    "app": {
                        "v1": null,
                        "v2": [{"RegistryUrl": "quay.example.com/team/app:v2"}]
                    },
                    "db": null
                }
            },
            "nothing": {"UsedIstags": null},
            "gone": null
        }"#;
        let report = ImageToolReport::from_json("team", json.as_bytes()).unwrap();
        assert_eq!(report.len(), 1);
        assert!(report.find("team/app:v2").is_some());

        for family in ["nothing", "gone"] {
            let report = ImageToolReport::from_json(family, json.as_bytes()).unwrap();
            assert!(report.is_empty());
        }
    }

    #[test]
    fn test_invalid_output() {
        let err = ImageToolReport::from_json("team", b"not json").unwrap_err();
        assert!(matches!(err, AppError::UsageReport(_)));
    }

    #[test]
    fn test_find_is_substring_containment() {
        let report = ImageToolReport::from_entries(vec![ImageUsage {
            registry_url: "quay.example.com/team/app:v10".to_string(),
            ..Default::default()
        }]);
        assert!(report.find("team/app:v10").is_some());
        // prefix of a longer tag also matches
        assert!(report.find("team/app:v1").is_some());
        assert!(report.find("team/app:v2").is_none());
    }
}
