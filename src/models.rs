use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::severity::Severity;

/// The only scan status whose data is considered complete.
pub const STATUS_SCANNED: &str = "scanned";

/// Quay sends `null` for empty lists in several places.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// GET /superuser/organizations/ response
#[derive(Debug, Deserialize)]
pub struct OrganizationList {
    #[serde(default, deserialize_with = "null_as_default")]
    pub organizations: Vec<NamedEntry>,
}

/// GET /repository?namespace=<org> response
#[derive(Debug, Deserialize)]
pub struct RepositoryList {
    #[serde(default, deserialize_with = "null_as_default")]
    pub repositories: Vec<NamedEntry>,
}

/// Listing entries only need their name; everything else is ignored
#[derive(Debug, Clone, Deserialize)]
pub struct NamedEntry {
    pub name: String,
}

/// GET /repository/<org>/<repo>/tag response
#[derive(Debug, Deserialize)]
pub struct TagList {
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<RawTag>,
}

/// A tag as the registry returns it, before enrichment
#[derive(Debug, Clone, Deserialize)]
pub struct RawTag {
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub manifest_digest: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub last_modified: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub size: f64,
    #[serde(default)]
    pub expired: bool,
}

/// GET /repository/<org>/<repo>/manifest/<digest>/security response
#[derive(Debug, Default, Deserialize)]
pub struct SecurityScan {
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: String,
    #[serde(default)]
    pub data: Option<ScanData>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanData {
    #[serde(rename = "Layer", default)]
    pub layer: Option<ScanLayer>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanLayer {
    #[serde(rename = "Features", default, deserialize_with = "null_as_default")]
    pub features: Vec<Feature>,
}

/// A software component detected in an image layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename(deserialize = "Name"), default)]
    pub name: String,
    #[serde(rename(deserialize = "Version"), default)]
    pub version: String,
    #[serde(
        rename(deserialize = "BaseScores"),
        default,
        deserialize_with = "null_as_default"
    )]
    pub base_scores: Vec<f64>,
    #[serde(
        rename(deserialize = "CVEIds"),
        default,
        deserialize_with = "null_as_default"
    )]
    pub cve_ids: Vec<String>,
    #[serde(
        rename(deserialize = "Vulnerabilities"),
        default,
        deserialize_with = "null_as_default"
    )]
    pub findings: Vec<Finding>,
}

impl Feature {
    /// A feature carrying no findings, scores or CVE ids says nothing about risk.
    pub fn is_relevant(&self) -> bool {
        !(self.findings.is_empty() && self.base_scores.is_empty() && self.cve_ids.is_empty())
    }
}

/// A single vulnerability attached to a feature
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(rename(deserialize = "Name"), default)]
    pub name: String,
    #[serde(rename(deserialize = "Link"), default)]
    pub link: String,
    #[serde(rename(deserialize = "Description"), default)]
    pub description: String,
    #[serde(
        rename(deserialize = "FixedBy"),
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub fixed_by: Option<String>,
    #[serde(rename(deserialize = "Severity"), default)]
    pub severity: String,
}

impl Finding {
    pub fn severity(&self) -> Option<Severity> {
        Severity::parse(&self.severity)
    }
}

/// Normalized scan report attached to a tag
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VulnerabilityReport {
    pub status: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<Feature>,
}

impl VulnerabilityReport {
    pub fn status_only(status: &str) -> Self {
        Self {
            status: status.to_string(),
            features: Vec::new(),
        }
    }

    pub fn is_scanned(&self) -> bool {
        self.status == STATUS_SCANNED
    }
}

/// A tag enriched with vulnerability data and derived fields
#[derive(Debug, Clone, Serialize)]
pub struct Tag {
    pub repository: String,
    pub name: String,
    pub manifest_digest: String,
    pub last_modified: String,
    pub size_mb: f64,
    pub expired: bool,
    pub vulnerabilities: VulnerabilityReport,
    pub highest_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highest_severity: Option<Severity>,
    pub age: u64,
}

impl Tag {
    /// Stamp repository, age and size onto a raw tag. Size conversion happens
    /// here and nowhere else.
    pub fn from_raw(raw: RawTag, repository: &str, age: u64) -> Self {
        Self {
            repository: repository.to_string(),
            name: raw.name,
            manifest_digest: raw.manifest_digest,
            last_modified: raw.last_modified,
            size_mb: megabytes(raw.size),
            expired: raw.expired,
            vulnerabilities: VulnerabilityReport::default(),
            highest_score: 0.0,
            highest_severity: None,
            age,
        }
    }
}

/// Bytes to megabytes, truncated to two decimals
pub fn megabytes(bytes: f64) -> f64 {
    (bytes / (1024.0 * 1024.0) * 100.0).trunc() / 100.0
}

/// Why a tag was left out of an enriched listing
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// Fetching or decoding the scan report failed
    Scan(String),
    /// The scanner has not (successfully) processed the manifest
    Unscanned(String),
    /// Nothing in the report passed the severity/score floors
    Filtered,
    /// The fan-out deadline expired before the item finished
    Cancelled,
    /// The worker task itself failed
    Aborted(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Scan(e) => write!(f, "scan report unavailable: {}", e),
            SkipReason::Unscanned(status) => write!(f, "scan status is '{}'", status),
            SkipReason::Filtered => write!(f, "no finding matches the filters"),
            SkipReason::Cancelled => write!(f, "cancelled"),
            SkipReason::Aborted(e) => write!(f, "task failed: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedTag {
    pub name: String,
    pub reason: SkipReason,
}

/// Result of listing one repository's tags
#[derive(Debug, Default, Serialize)]
pub struct TagResults {
    pub tags: Vec<Tag>,
    #[serde(skip)]
    pub skipped: Vec<SkippedTag>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Repository {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Organization {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<Repository>,
}

#[derive(Debug, Default, Serialize)]
pub struct OrgSet {
    pub organizations: Vec<Organization>,
}

/// GET /organization/<org>/prototypes response
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Prototypes {
    #[serde(default, deserialize_with = "null_as_default")]
    pub prototypes: Vec<Prototype>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Prototype {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activating_user: Option<serde_json::Value>,
    pub delegate: Delegate,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Delegate {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub is_robot: bool,
    #[serde(default)]
    pub is_org_member: bool,
    #[serde(default)]
    pub avatar: Avatar,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Avatar {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub kind: String,
}

/// GET /repository/<org>/<repo>/notification/ response
#[derive(Debug, Deserialize)]
pub struct NotificationList {
    #[serde(default, deserialize_with = "null_as_default")]
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default)]
    pub uuid: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub number_of_failures: u32,
    #[serde(default, skip_deserializing)]
    pub repository: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_megabytes_truncates_to_two_decimals() {
        assert_eq!(megabytes(1024.0 * 1024.0), 1.0);
        // 1.5 MiB + a few bytes stays at 1.5
        assert_eq!(megabytes(1_572_870.0), 1.5);
        // 2.999 MiB truncates, does not round
        assert_eq!(megabytes(3_144_678.0), 2.99);
        assert_eq!(megabytes(0.0), 0.0);
    }

    #[test]
    fn test_security_scan_decodes_quay_shape() {
        let body = r#"{
            "status": "scanned",
            "data": {"Layer": {"Features": [
                {"Name": "openssl", "Version": "1.1", "BaseScores": [7.5], "CVEIds": ["CVE-1"],
                 "Vulnerabilities": [{"Name": "CVE-1", "Link": "l", "Description": "d",
                                      "FixedBy": "1.2", "Severity": "High"}]},
                {"Name": "zlib", "Version": "1", "BaseScores": null, "CVEIds": null,
                 "Vulnerabilities": null}
            ]}}
        }"#;
        let scan: SecurityScan = serde_json::from_str(body).unwrap();
        assert_eq!(scan.status, "scanned");
        let features = scan.data.unwrap().layer.unwrap().features;
        assert_eq!(features.len(), 2);
        assert_eq!(features[0].findings[0].severity(), Some(Severity::High));
        assert_eq!(features[0].findings[0].fixed_by.as_deref(), Some("1.2"));
        assert!(features[0].is_relevant());
        assert!(!features[1].is_relevant());
    }

    #[test]
    fn test_tag_list_tolerates_missing_fields() {
        let body = r#"{"tags": [{"name": "v1"}], "page": 1, "has_additional": false}"#;
        let list: TagList = serde_json::from_str(body).unwrap();
        assert_eq!(list.tags.len(), 1);
        assert_eq!(list.tags[0].manifest_digest, "");
        assert_eq!(list.tags[0].size, 0.0);
    }

    #[test]
    fn test_status_only_report_serializes_without_features() {
        let report = VulnerabilityReport::status_only("scanned");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json, serde_json::json!({"status": "scanned"}));
    }
}
