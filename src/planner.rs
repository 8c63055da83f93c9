use std::fmt;
use std::io::Write;

use regex::Regex;
use tracing::debug;

use crate::error::AppError;
use crate::operations::{Operations, RepositoryQuery};
use crate::severity::{rank, Severity};
use crate::usage::UsageLookup;

/// Criteria a tag has to meet to become a deletion candidate
#[derive(Debug, Clone)]
pub struct DeletionCriteria {
    repo: Regex,
    tag: Regex,
    severity: Option<Severity>,
    /// Minimum age in days; 0 disables the check
    min_age: u64,
}

impl DeletionCriteria {
    /// Compile both patterns; an empty pattern matches everything
    pub fn new(
        repo_pattern: &str,
        tag_pattern: &str,
        severity: Option<Severity>,
        min_age: u64,
    ) -> Result<Self, AppError> {
        Ok(Self {
            repo: Regex::new(repo_pattern)?,
            tag: Regex::new(tag_pattern)?,
            severity,
            min_age,
        })
    }
}

/// One line of a deletion plan
#[derive(Debug, Clone, PartialEq)]
pub enum PlanEntry {
    /// The tag is deployed somewhere and is kept
    InUse {
        org: String,
        repo: String,
        tag: String,
        cluster: String,
        namespace: String,
        url: String,
    },
    /// The tag can be deleted with the rendered command
    Delete {
        org: String,
        repo: String,
        tag: String,
        age: u64,
        severity: Option<Severity>,
    },
}

impl fmt::Display for PlanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanEntry::InUse {
                org,
                repo,
                tag,
                cluster,
                namespace,
                url,
            } => write!(
                f,
                "# {}/{}:{} is used in cluster {} in namespace {} - Url: {}",
                org, repo, tag, cluster, namespace, url
            ),
            PlanEntry::Delete {
                org,
                repo,
                tag,
                age,
                severity,
            } => {
                let command = format!("qc -o {:<5} -r {:<36} -t {:<25} -d", org, repo, tag);
                let severity = severity.map(|s| s.to_string()).unwrap_or_default();
                write!(
                    f,
                    "{:<80}   # Age: {:>4}, Severity {:<10}",
                    command, age, severity
                )
            }
        }
    }
}

/// `https://quay.example.com/` -> `quay.example.com`
fn registry_host(registry_url: &str) -> &str {
    let host = registry_url
        .split_once("://")
        .map_or(registry_url, |(_, rest)| rest);
    host.trim_end_matches('/')
}

/// Build the deletion plan for `org`.
///
/// Every tag of every repository is considered, not only the youngest. Tags
/// found in the usage report are reported as in use before any other
/// criterion is checked.
pub async fn plan_deletions(
    ops: &Operations,
    org: &str,
    registry_url: &str,
    criteria: &DeletionCriteria,
    usage: &dyn UsageLookup,
) -> Result<Vec<PlanEntry>, AppError> {
    let floor = criteria.severity.map(|s| s.rank());
    let host = registry_host(registry_url);

    let query = RepositoryQuery {
        details: true,
        tag_pattern: None,
        only_youngest: false,
    };
    let orgs = ops.list_organization_repositories(org, &query).await?;

    let mut plan = Vec::new();
    for organization in &orgs.organizations {
        for repo in &organization.repositories {
            if !criteria.repo.is_match(&repo.name) {
                continue;
            }
            for tag in &repo.tags {
                let cluster_ref = format!("{}-images/{}:{}", organization.name, repo.name, tag.name);
                let registry_ref =
                    format!("{}/{}/{}:{}", host, organization.name, repo.name, tag.name);

                let in_use = usage
                    .find(&cluster_ref)
                    .or_else(|| usage.find(&registry_ref));
                if let Some(hit) = in_use {
                    plan.push(PlanEntry::InUse {
                        org: organization.name.clone(),
                        repo: repo.name.clone(),
                        tag: tag.name.clone(),
                        cluster: hit.cluster.clone(),
                        namespace: hit.used_in_namespace.clone(),
                        url: hit.registry_url.clone(),
                    });
                    continue;
                }

                if !criteria.tag.is_match(&tag.name) {
                    continue;
                }
                if let Some(floor) = floor {
                    if rank(tag.highest_severity) < floor {
                        debug!("{}:{} is below the severity floor", repo.name, tag.name);
                        continue;
                    }
                }
                if criteria.min_age > 0 && tag.age < criteria.min_age {
                    continue;
                }

                plan.push(PlanEntry::Delete {
                    org: organization.name.clone(),
                    repo: repo.name.clone(),
                    tag: tag.name.clone(),
                    age: tag.age,
                    severity: tag.highest_severity,
                });
            }
        }
    }
    Ok(plan)
}

pub fn write_plan<W: Write>(entries: &[PlanEntry], mut out: W) -> std::io::Result<()> {
    for entry in entries {
        writeln!(out, "{}", entry)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::tests::{
        mount_repositories, mount_security, mount_tags, ops_for, scanned, tag_json, AGE_10,
        AGE_100, AGE_60,
    };
    use crate::usage::{ImageToolReport, ImageUsage};
    use wiremock::MockServer;

    fn usage(urls: &[&str]) -> ImageToolReport {
        ImageToolReport::from_entries(
            urls.iter()
                .map(|u| ImageUsage {
                    cluster: "prod".to_string(),
                    used_in_namespace: "team-prod".to_string(),
                    registry_url: u.to_string(),
                    ..Default::default()
                })
                .collect(),
        )
    }

    async fn fixture() -> MockServer {
        let server = MockServer::start().await;
        mount_repositories(&server, "team", &["app", "db"]).await;
        mount_tags(
            &server,
            "team",
            "app",
            vec![
                tag_json("v1", "a1", AGE_100),
                tag_json("v2", "a2", AGE_60),
                tag_json("v3", "a3", AGE_10),
            ],
        )
        .await;
        mount_security(&server, "team", "app", "a1", scanned(9.8, "critical")).await;
        mount_security(&server, "team", "app", "a2", scanned(5.0, "medium")).await;
        mount_security(&server, "team", "app", "a3", scanned(8.0, "high")).await;
        mount_tags(&server, "team", "db", vec![tag_json("v1", "b1", AGE_100)]).await;
        mount_security(&server, "team", "db", "b1", scanned(7.0, "high")).await;
        server
    }

    fn criteria(repo: &str, severity: Option<Severity>, min_age: u64) -> DeletionCriteria {
        DeletionCriteria::new(repo, "", severity, min_age).unwrap()
    }

    fn deleted(plan: &[PlanEntry]) -> Vec<String> {
        let mut names: Vec<_> = plan
            .iter()
            .filter_map(|e| match e {
                PlanEntry::Delete { repo, tag, .. } => Some(format!("{}:{}", repo, tag)),
                PlanEntry::InUse { .. } => None,
            })
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_plan_applies_every_criterion() {
        let server = fixture().await;
        let ops = ops_for(&server);

        let plan = plan_deletions(
            &ops,
            "team",
            "https://quay.example.com",
            &criteria("^app$", Some(Severity::High), 30),
            &usage(&[]),
        )
        .await
        .unwrap();

        // v2 is medium, v3 is too young, db is excluded by the pattern
        assert_eq!(deleted(&plan), vec!["app:v1"]);
    }

    #[tokio::test]
    async fn test_tag_in_use_is_never_a_candidate() {
        let server = fixture().await;
        let ops = ops_for(&server);

        let plan = plan_deletions(
            &ops,
            "team",
            "https://quay.example.com/",
            &criteria("^app$", None, 0),
            &usage(&["quay.example.com/team/app:v1"]),
        )
        .await
        .unwrap();

        assert_eq!(deleted(&plan), vec!["app:v2", "app:v3"]);
        let in_use: Vec<_> = plan
            .iter()
            .filter(|e| matches!(e, PlanEntry::InUse { .. }))
            .map(|e| e.to_string())
            .collect();
        assert_eq!(
            in_use,
            vec!["# team/app:v1 is used in cluster prod in namespace team-prod - Url: quay.example.com/team/app:v1"]
        );
    }

    #[tokio::test]
    async fn test_cluster_reference_counts_as_in_use() {
        let server = fixture().await;
        let ops = ops_for(&server);

        let plan = plan_deletions(
            &ops,
            "team",
            "https://quay.example.com",
            &criteria("^db$", None, 0),
            &usage(&["image-registry.svc:5000/team-images/db:v1"]),
        )
        .await
        .unwrap();
        assert!(deleted(&plan).is_empty());
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_invalid_patterns_are_rejected() {
        let err = DeletionCriteria::new("(", "", None, 0).unwrap_err();
        assert!(matches!(err, AppError::InvalidPattern(_)));
        let err = DeletionCriteria::new("^app$", "[", None, 0).unwrap_err();
        assert!(matches!(err, AppError::InvalidPattern(_)));
    }

    #[tokio::test]
    async fn test_tag_pattern_narrows_candidates() {
        let server = fixture().await;
        let ops = ops_for(&server);

        let plan = plan_deletions(
            &ops,
            "team",
            "https://quay.example.com",
            &DeletionCriteria::new("", "^v[12]$", None, 0).unwrap(),
            &usage(&["quay.example.com/team/db:v1"]),
        )
        .await
        .unwrap();
        assert_eq!(deleted(&plan), vec!["app:v1", "app:v2"]);
    }

    #[test]
    fn test_delete_line_format() {
        let entry = PlanEntry::Delete {
            org: "team".to_string(),
            repo: "app".to_string(),
            tag: "v1".to_string(),
            age: 100,
            severity: Some(Severity::Critical),
        };
        let line = entry.to_string();
        let command = format!("qc -o {:<5} -r {:<36} -t {:<25} -d", "team", "app", "v1");
        assert_eq!(
            line,
            format!("{}   # Age:  100, Severity critical  ", command)
        );

        let short = PlanEntry::Delete {
            org: "t".to_string(),
            repo: "a".to_string(),
            tag: "v".to_string(),
            age: 7,
            severity: None,
        }
        .to_string();
        assert!(short.contains("   # Age:    7, Severity "));

        let mut out = Vec::new();
        write_plan(&[entry], &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), format!("{}\n", line));
    }

    #[test]
    fn test_registry_host() {
        assert_eq!(registry_host("https://quay.example.com/"), "quay.example.com");
        assert_eq!(registry_host("quay.example.com"), "quay.example.com");
    }
}
