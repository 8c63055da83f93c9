use std::sync::LazyLock;

use regex::Regex;

use crate::error::AppError;
use crate::models::{Feature, SecurityScan, VulnerabilityReport, STATUS_SCANNED};
use crate::registry::RegistryClient;
use crate::severity::Severity;

static SENTENCE_BREAK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\. ").unwrap());
static BLANK_LINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n").unwrap());

/// GET the security report of one manifest and normalize it
pub async fn fetch_report(
    client: &RegistryClient,
    org: &str,
    repo: &str,
    digest: &str,
) -> Result<VulnerabilityReport, AppError> {
    let path = format!("/repository/{}/{}/manifest/{}/security", org, repo, digest);
    let resp = client.get(&path).await?;
    let scan: SecurityScan =
        resp.expect_json(&format!("security report of {}/{}@{}", org, repo, digest))?;
    Ok(normalize(scan))
}

/// Reduce a raw scan to its status and the features that carry any risk data.
/// A non-"scanned" status yields a status-only report.
pub fn normalize(scan: SecurityScan) -> VulnerabilityReport {
    if scan.status != STATUS_SCANNED {
        return VulnerabilityReport::status_only(&scan.status);
    }
    let features = scan
        .data
        .and_then(|d| d.layer)
        .map(|l| l.features)
        .unwrap_or_default()
        .into_iter()
        .filter(Feature::is_relevant)
        .collect();

    VulnerabilityReport {
        status: scan.status,
        features,
    }
}

/// Highest base score and highest severity across all features
pub fn highest_score_and_severity(features: &[Feature]) -> (f64, Option<Severity>) {
    let score = features
        .iter()
        .flat_map(|f| f.base_scores.iter().copied())
        .fold(0.0_f64, f64::max);
    let severity = features
        .iter()
        .flat_map(|f| f.findings.iter())
        .filter_map(|v| v.severity())
        .max();
    (score, severity)
}

/// Reflow a finding description for terminal display: one sentence per line,
/// no blank-line runs, literal `\n` sequences expanded, bullets indented.
pub fn format_description(description: &str) -> String {
    let text = SENTENCE_BREAK.replace_all(description, ".\n");
    let text = BLANK_LINES.replace_all(&text, "\n");
    let text = text.replace("\\n", "\n");
    text.replace('*', "  *")
}
