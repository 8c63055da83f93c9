use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::filter::{TagMatcher, VulnerabilityFilter};
use crate::models::{
    Notification, NotificationList, OrgSet, Organization, OrganizationList, Prototypes, RawTag,
    Repository, RepositoryList, SkipReason, SkippedTag, Tag, TagList, TagResults,
    VulnerabilityReport,
};
use crate::registry::RegistryClient;
use crate::vulnerability::{fetch_report, highest_score_and_severity};

/// What to do with a tag whose scan status is not "scanned"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnscannedPolicy {
    /// Leave it out of enriched listings
    #[default]
    Skip,
    /// Keep it with its status and no vulnerability data, unless a
    /// severity/score filter is active
    Include,
}

/// Parameters for listing the tags of one repository
#[derive(Debug, Clone, Default)]
pub struct TagQuery {
    pub tag_pattern: Option<String>,
    pub filter: VulnerabilityFilter,
    pub details: bool,
    pub only_youngest: bool,
}

/// Parameters for listing the repositories of one organization
#[derive(Debug, Clone, Default)]
pub struct RepositoryQuery {
    pub details: bool,
    pub tag_pattern: Option<String>,
    pub only_youngest: bool,
}

impl RepositoryQuery {
    /// With details and no explicit tag filter, only each repository's youngest tag is enriched.
    pub fn new(details: bool, tag_pattern: Option<String>) -> Self {
        let only_youngest = details && tag_pattern.as_deref().map_or(true, str::is_empty);
        Self {
            details,
            tag_pattern,
            only_youngest,
        }
    }
}

/// Registry operations. Clones share the client, the clock and the
/// cancellation token.
#[derive(Debug, Clone)]
pub struct Operations {
    client: Arc<RegistryClient>,
    unscanned: UnscannedPolicy,
    now: DateTime<Utc>,
    cancel: CancellationToken,
}

impl Operations {
    pub fn new(client: Arc<RegistryClient>) -> Self {
        Self {
            client,
            unscanned: UnscannedPolicy::default(),
            now: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_unscanned_policy(mut self, policy: UnscannedPolicy) -> Self {
        self.unscanned = policy;
        self
    }

    /// Fix the reference time used for tag ages
    #[cfg(test)]
    pub fn with_clock(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Cancel all outstanding per-item work once `timeout` has elapsed
    pub fn cancel_after(&self, timeout: Duration) {
        let token = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    warn!("Deadline of {:?} reached, cancelling outstanding requests", timeout);
                    token.cancel();
                }
            }
        });
    }

    #[cfg(test)]
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whole days between `last_modified` (RFC 1123/2822) and the operation clock.
    /// Unparseable timestamps count as age 0.
    pub fn age_in_days(&self, last_modified: &str) -> u64 {
        match DateTime::parse_from_rfc2822(last_modified) {
            Ok(ts) => (self.now - ts.with_timezone(&Utc)).num_days().max(0) as u64,
            Err(e) => {
                debug!("Failed to parse last_modified '{}': {}", last_modified, e);
                0
            }
        }
    }

    /// GET /superuser/organizations/
    pub async fn list_organizations(&self) -> Result<OrgSet, AppError> {
        let resp = self.client.get("/superuser/organizations/").await?;
        let list: OrganizationList = resp.expect_json("list organizations")?;
        Ok(OrgSet {
            organizations: list
                .organizations
                .into_iter()
                .map(|o| Organization {
                    name: o.name,
                    repositories: Vec::new(),
                })
                .collect(),
        })
    }

    /// Fetch a repository's tags and enrich every matching one with its
    /// vulnerability data, one task per tag.
    pub async fn list_repository_tags(
        &self,
        org: &str,
        repo: &str,
        query: &TagQuery,
    ) -> Result<TagResults, AppError> {
        debug!("Listing tags of {}/{} with {:?}", org, repo, query);
        let resp = self
            .client
            .get(&format!("/repository/{}/{}/tag", org, repo))
            .await?;
        let list: TagList = resp.expect_json(&format!("list tags of {}/{}", org, repo))?;

        let mut tags: Vec<(RawTag, u64)> = list
            .tags
            .into_iter()
            .map(|t| {
                let age = self.age_in_days(&t.last_modified);
                (t, age)
            })
            .collect();

        if query.only_youngest {
            // min_by_key keeps the first of equally young tags
            let youngest = tags
                .iter()
                .enumerate()
                .min_by_key(|(_, (_, age))| *age)
                .map(|(idx, _)| idx);
            match youngest {
                Some(idx) => tags = vec![tags.swap_remove(idx)],
                None => return Ok(TagResults::default()),
            }
        }

        let matcher = TagMatcher::new(query.tag_pattern.as_deref());
        let mut handles = Vec::with_capacity(tags.len());

        for (raw, age) in tags {
            if !matcher.matches(&raw.name) {
                continue;
            }
            let ops = self.clone();
            let org = org.to_string();
            let repo = repo.to_string();
            let query = query.clone();
            let name = raw.name.clone();

            handles.push((
                name,
                tokio::spawn(async move {
                    let token = ops.cancel.clone();
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => Err(SkipReason::Cancelled),
                        result = ops.enrich_tag(&org, &repo, raw, age, &query) => result,
                    }
                }),
            ));
        }

        let mut results = TagResults::default();
        for (name, handle) in handles {
            let reason = match handle.await {
                Ok(Ok(tag)) => {
                    results.tags.push(tag);
                    continue;
                }
                Ok(Err(reason)) => reason,
                Err(e) => SkipReason::Aborted(e.to_string()),
            };
            debug!("Skipping {}/{}:{}: {}", org, repo, name, reason);
            results.skipped.push(SkippedTag { name, reason });
        }

        Ok(results)
    }

    async fn enrich_tag(
        &self,
        org: &str,
        repo: &str,
        raw: RawTag,
        age: u64,
        query: &TagQuery,
    ) -> Result<Tag, SkipReason> {
        let report = fetch_report(&self.client, org, repo, &raw.manifest_digest)
            .await
            .map_err(|e| SkipReason::Scan(e.to_string()))?;

        let mut tag = Tag::from_raw(raw, repo, age);

        if !report.is_scanned() {
            if self.unscanned == UnscannedPolicy::Include && !query.filter.is_active() {
                tag.vulnerabilities = VulnerabilityReport::status_only(&report.status);
                return Ok(tag);
            }
            return Err(SkipReason::Unscanned(report.status));
        }

        let (score, severity) = highest_score_and_severity(&report.features);
        tag.highest_score = score;
        tag.highest_severity = severity;

        let features = if query.filter.is_active() {
            query
                .filter
                .apply(&report.features)
                .ok_or(SkipReason::Filtered)?
        } else {
            report.features
        };

        tag.vulnerabilities = if query.details {
            VulnerabilityReport {
                status: report.status,
                features,
            }
        } else {
            VulnerabilityReport::status_only(&report.status)
        };

        Ok(tag)
    }

    /// GET /repository?namespace=<org>, optionally enriching every repository
    /// with its tags, one task per repository. Repositories that fail or end
    /// up without tags are dropped.
    pub async fn list_organization_repositories(
        &self,
        org: &str,
        query: &RepositoryQuery,
    ) -> Result<OrgSet, AppError> {
        debug!("Listing repositories of {} with {:?}", org, query);
        let resp = self
            .client
            .get(&format!("/repository?namespace={}", org))
            .await?;
        let list: RepositoryList = resp.expect_json(&format!("list repositories of {}", org))?;

        let mut organization = Organization {
            name: org.to_string(),
            repositories: list
                .repositories
                .into_iter()
                .map(|r| Repository {
                    name: r.name,
                    tags: Vec::new(),
                })
                .collect(),
        };

        if query.details {
            let tag_query = TagQuery {
                tag_pattern: query.tag_pattern.clone(),
                filter: VulnerabilityFilter::default(),
                details: false,
                only_youngest: query.only_youngest,
            };

            let mut handles = Vec::with_capacity(organization.repositories.len());
            for repo in organization.repositories.drain(..) {
                let ops = self.clone();
                let org = org.to_string();
                let tag_query = tag_query.clone();

                handles.push(tokio::spawn(async move {
                    let token = ops.cancel.clone();
                    let result = tokio::select! {
                        biased;
                        _ = token.cancelled() => None,
                        r = ops.list_repository_tags(&org, &repo.name, &tag_query) => Some(r),
                    };
                    (repo, result)
                }));
            }

            let mut enriched = Vec::new();
            for handle in handles {
                match handle.await {
                    Ok((mut repo, Some(Ok(tags)))) => {
                        if tags.tags.is_empty() {
                            debug!("Repository {} has no usable tags", repo.name);
                            continue;
                        }
                        repo.tags = tags.tags;
                        enriched.push(repo);
                    }
                    Ok((repo, Some(Err(e)))) => {
                        warn!("Failed to list tags for repository {}: {}", repo.name, e);
                    }
                    Ok((repo, None)) => {
                        warn!("Listing tags for repository {} was cancelled", repo.name);
                    }
                    Err(e) => warn!("Repository task failed: {}", e),
                }
            }
            organization.repositories = enriched;
        }

        Ok(OrgSet {
            organizations: vec![organization],
        })
    }

    /// Like `list_organization_repositories`, keeping only repositories whose
    /// name matches `pattern`
    pub async fn list_repositories_by_pattern(
        &self,
        org: &str,
        pattern: &str,
        query: &RepositoryQuery,
    ) -> Result<OrgSet, AppError> {
        let re = Regex::new(pattern)?;
        let mut orgs = self.list_organization_repositories(org, query).await?;
        for organization in &mut orgs.organizations {
            organization.repositories.retain(|r| re.is_match(&r.name));
        }
        Ok(orgs)
    }

    /// DELETE /repository/<org>/<repo>/tag/<tag>
    pub async fn delete_tag(&self, org: &str, repo: &str, tag: &str) -> Result<String, AppError> {
        let resp = self
            .client
            .delete(&format!("/repository/{}/{}/tag/{}", org, repo, tag))
            .await?;
        if !resp.is_success() {
            return Err(AppError::Status {
                context: format!("delete tag {}/{}:{}", org, repo, tag),
                status: resp.status,
            });
        }
        Ok(resp.body)
    }

    /// GET /organization/<org>/prototypes
    pub async fn get_users(&self, org: &str) -> Result<Prototypes, AppError> {
        let resp = self
            .client
            .get(&format!("/organization/{}/prototypes", org))
            .await?;
        resp.expect_json(&format!("list users of {}", org))
    }

    /// Notifications of every repository of `org`, fetched one repository at a time
    pub async fn list_notifications(&self, org: &str) -> Result<Vec<Notification>, AppError> {
        let orgs = self
            .list_organization_repositories(org, &RepositoryQuery::default())
            .await?;

        let mut all = Vec::new();
        for repository in orgs.organizations.iter().flat_map(|o| &o.repositories) {
            let resp = self
                .client
                .get(&format!(
                    "/repository/{}/{}/notification/",
                    org, repository.name
                ))
                .await?;
            let list: NotificationList = resp.expect_json(&format!(
                "list notifications of {}/{}",
                org, repository.name
            ))?;
            all.extend(list.notifications.into_iter().map(|mut n| {
                n.repository = repository.name.clone();
                n
            }));
        }
        Ok(all)
    }
}
