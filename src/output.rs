use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::PathBuf;

use chrono::{DateTime, Local};
use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;

use crate::error::AppError;
use crate::models::{Notification, OrgSet, Prototypes, Tag};
use crate::severity::Severity;
use crate::vulnerability::format_description;

const RULE: &str = "-----------------------------";

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    #[default]
    Yaml,
}

/// Writes command results in the selected format to stdout or a file
#[derive(Debug, Clone)]
pub struct Renderer {
    format: OutputFormat,
    pretty: bool,
    output_file: Option<PathBuf>,
}

impl Renderer {
    pub fn new(format: OutputFormat, pretty: bool, output_file: Option<PathBuf>) -> Self {
        Self {
            format,
            pretty,
            output_file,
        }
    }

    /// Serialize `data`, or lay it out with `text` in text mode
    pub fn render<T, F>(&self, data: &T, text: F) -> Result<String, AppError>
    where
        T: Serialize,
        F: FnOnce(&T) -> String,
    {
        Ok(match self.format {
            OutputFormat::Json if self.pretty => serde_json::to_string_pretty(data)? + "\n",
            OutputFormat::Json => serde_json::to_string(data)? + "\n",
            OutputFormat::Yaml => serde_yaml::to_string(data)?,
            OutputFormat::Text => text(data),
        })
    }

    pub fn emit<T, F>(&self, data: &T, text: F) -> Result<(), AppError>
    where
        T: Serialize,
        F: FnOnce(&T) -> String,
    {
        let content = self.render(data, text)?;
        self.write_raw(&content)
    }

    /// Write pre-rendered content unchanged
    pub fn write_raw(&self, content: &str) -> Result<(), AppError> {
        match &self.output_file {
            Some(path) => fs::write(path, content)?,
            None => {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(content.as_bytes())?;
                stdout.flush()?;
            }
        }
        Ok(())
    }
}

fn paint_severity(severity: Option<Severity>, width: usize) -> String {
    let text = format!(
        "{:<width$}",
        severity.map(|s| s.to_string()).unwrap_or_default(),
        width = width
    );
    match severity {
        Some(Severity::Critical) => text.red().bold().to_string(),
        Some(Severity::High) => text.red().to_string(),
        Some(Severity::Medium) => text.yellow().to_string(),
        _ => text,
    }
}

fn truncate(value: &str, width: usize) -> &str {
    match value.char_indices().nth(width) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

fn local_time(last_modified: &str) -> String {
    match DateTime::parse_from_rfc2822(last_modified) {
        Ok(ts) => ts
            .with_timezone(&Local)
            .format("%d.%m.%Y-%H:%M:%S")
            .to_string(),
        Err(_) => last_modified.to_string(),
    }
}

/// Tag table. The overview (one row per repository) is sorted by repository,
/// otherwise rows are sorted by age and followed by their features.
pub fn tags_table(tags: &[Tag], headline: &str, overview: bool) -> String {
    let mut rows: Vec<&Tag> = tags.iter().collect();
    if overview {
        rows.sort_by(|a, b| a.repository.cmp(&b.repository));
    } else {
        rows.sort_by_key(|t| t.age);
    }

    let mut out = String::new();
    let _ = writeln!(out, "{}", headline.bold());
    let _ = writeln!(
        out,
        "{:<30}  {:<20}  {:<7}  {:<9}  {:<5}  {:<10}  {:>7}  {:<19}  {:>10}  {}",
        "Repo", "Tag", "Expired", "Status", "Score", "Severity", "Age [D]", "LastModified", "Size [Mb]", "Digest"
    );
    let _ = writeln!(out, "{}", RULE.repeat(7));

    for tag in rows {
        let _ = writeln!(
            out,
            "{:<30}  {:<20}  {:<7}  {:<9}  {:>5.2}  {}  {:>7}  {:<19}  {:>10.2}  {}",
            truncate(&tag.repository, 30),
            truncate(&tag.name, 20),
            if tag.expired { "Yes" } else { "No" },
            truncate(&tag.vulnerabilities.status, 9),
            tag.highest_score,
            paint_severity(tag.highest_severity, 10),
            tag.age,
            local_time(&tag.last_modified),
            tag.size_mb,
            tag.manifest_digest.dimmed()
        );

        if overview {
            continue;
        }
        for feature in &tag.vulnerabilities.features {
            let _ = writeln!(
                out,
                "        Feature: {} Version: {}  BaseScore: {:?}",
                feature.name.bold(),
                feature.version,
                feature.base_scores
            );
            for finding in &feature.findings {
                let _ = writeln!(
                    out,
                    "            {}  {}",
                    finding.name,
                    paint_severity(finding.severity(), 0)
                );
                if let Some(fixed_by) = &finding.fixed_by {
                    let _ = writeln!(out, "            fixed by: {}", fixed_by);
                }
                if !finding.link.is_empty() {
                    let _ = writeln!(out, "            {}", finding.link.dimmed());
                }
                for line in format_description(&finding.description).lines() {
                    let _ = writeln!(out, "              {}", line);
                }
            }
        }
    }
    out
}

/// Organisation / repository list
pub fn org_list(orgs: &OrgSet) -> String {
    let width = orgs
        .organizations
        .iter()
        .map(|o| o.name.len())
        .max()
        .unwrap_or(0)
        .max("Organisation".len());

    let mut out = String::new();
    let header = format!("{:<width$}  {}", "Organisation", "Repository", width = width);
    let _ = writeln!(out, "{}", header.bold());
    let _ = writeln!(out, "{:<width$}  {}", RULE, RULE.repeat(4), width = width);
    for org in &orgs.organizations {
        if org.repositories.is_empty() {
            let _ = writeln!(out, "{}", org.name);
            continue;
        }
        let mut names: Vec<&str> = org.repositories.iter().map(|r| r.name.as_str()).collect();
        names.sort_unstable();
        for name in names {
            let _ = writeln!(out, "{:<width$}  {}", org.name, name, width = width);
        }
    }
    out
}

pub fn users_table(users: &Prototypes) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", "Users".bold());
    let _ = writeln!(
        out,
        "{:<15}  {:<25} {:<10} {:<15} {:<25}",
        "Kind", "Name", "Role", "AvatarKind", "AvatarName"
    );
    let _ = writeln!(out, "{}", RULE.repeat(3));
    for user in &users.prototypes {
        let delegate = &user.delegate;
        let _ = writeln!(
            out,
            "{:<15}  {:<25} {:<10} {:<15} {:<25}",
            delegate.kind, delegate.name, user.role, delegate.avatar.kind, delegate.avatar.name
        );
    }
    out
}

pub fn notifications_table(notifications: &Vec<Notification>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", "Notifications".bold());
    let _ = writeln!(
        out,
        "{:<30}  {:<30}  {:<20}  {:<10}  {:>8}",
        "Repository", "Title", "Event", "Method", "Failures"
    );
    let _ = writeln!(out, "{}", RULE.repeat(4));
    for n in notifications {
        let failures = if n.number_of_failures > 0 {
            format!("{:>8}", n.number_of_failures).red().to_string()
        } else {
            format!("{:>8}", n.number_of_failures)
        };
        let _ = writeln!(
            out,
            "{:<30}  {:<30}  {:<20}  {:<10}  {}",
            n.repository, n.title, n.event, n.method, failures
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Feature, Finding, Organization, Repository, VulnerabilityReport};
    use tempfile::TempDir;

    fn tag(repo: &str, name: &str, age: u64) -> Tag {
        Tag {
            repository: repo.to_string(),
            name: name.to_string(),
            manifest_digest: format!("sha256:{}", name),
            last_modified: "Mon, 01 Jan 2024 00:00:00 +0000".to_string(),
            size_mb: 1.5,
            expired: false,
            vulnerabilities: VulnerabilityReport::status_only("scanned"),
            highest_score: 0.0,
            highest_severity: None,
            age,
        }
    }

    #[test]
    fn test_tags_sorted_by_age() {
        let tags = vec![tag("app", "old", 50), tag("app", "new", 2)];
        let out = tags_table(&tags, "Tags", false);
        let new = out.find("sha256:new").unwrap();
        let old = out.find("sha256:old").unwrap();
        assert!(new < old);
    }

    #[test]
    fn test_overview_sorted_by_repository() {
        let tags = vec![tag("zeta", "v1", 1), tag("alpha", "v9", 90)];
        let out = tags_table(&tags, "Overview", true);
        assert!(out.find("alpha").unwrap() < out.find("zeta").unwrap());
    }

    #[test]
    fn test_descriptions_are_reflowed_for_display() {
        let mut t = tag("app", "v1", 1);
        t.vulnerabilities.features = vec![Feature {
            name: "openssl".to_string(),
            findings: vec![Finding {
                name: "CVE-1".to_string(),
                description: "First. Second.".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }];
        let out = tags_table(&[t.clone()], "Tags", false);
        assert!(out.contains("              First.\n              Second."));
        // the data itself is untouched
        assert_eq!(
            t.vulnerabilities.features[0].findings[0].description,
            "First. Second."
        );
        // the overview leaves features out
        assert!(!tags_table(&[t], "Overview", true).contains("CVE-1"));
    }

    #[test]
    fn test_org_list() {
        let orgs = OrgSet {
            organizations: vec![
                Organization {
                    name: "team".to_string(),
                    repositories: vec![
                        Repository {
                            name: "web".to_string(),
                            tags: vec![],
                        },
                        Repository {
                            name: "api".to_string(),
                            tags: vec![],
                        },
                    ],
                },
                Organization {
                    name: "lonely".to_string(),
                    repositories: vec![],
                },
            ],
        };
        let out = org_list(&orgs);
        assert!(out.find("api").unwrap() < out.find("web").unwrap());
        assert!(out.lines().any(|l| l == "lonely"));
    }

    #[test]
    fn test_render_formats() {
        let orgs = OrgSet {
            organizations: vec![Organization {
                name: "team".to_string(),
                repositories: vec![],
            }],
        };
        let json = Renderer::new(OutputFormat::Json, false, None)
            .render(&orgs, org_list)
            .unwrap();
        assert_eq!(json, "{\"organizations\":[{\"name\":\"team\"}]}\n");

        let yaml = Renderer::new(OutputFormat::Yaml, false, None)
            .render(&orgs, org_list)
            .unwrap();
        assert_eq!(yaml, "organizations:\n- name: team\n");

        let pretty = Renderer::new(OutputFormat::Json, true, None)
            .render(&orgs, org_list)
            .unwrap();
        assert!(pretty.contains("\n  \"organizations\""));
    }

    #[test]
    fn test_output_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.json");
        let renderer = Renderer::new(OutputFormat::Json, false, Some(path.clone()));
        renderer.emit(&vec!["a", "b"], |_| String::new()).unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "[\"a\",\"b\"]\n");
    }
}
