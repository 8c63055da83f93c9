use regex::Regex;
use tracing::warn;

use crate::models::Feature;
use crate::severity::{rank, Severity};

/// Severity and base-score floors applied to a tag's findings
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VulnerabilityFilter {
    pub severity: Option<Severity>,
    pub min_score: f64,
}

impl VulnerabilityFilter {
    pub fn new(severity: Option<Severity>, min_score: f64) -> Self {
        Self {
            severity,
            min_score,
        }
    }

    pub fn is_active(&self) -> bool {
        self.severity.is_some() || self.min_score > 0.0
    }

    /// Keep, per feature, the findings that satisfy both floors at once. The
    /// score floor is met when any of the feature's scores exceeds it; the
    /// severity floor is checked per finding. Features left without findings
    /// are dropped. `None` means nothing survived and the tag is rejected.
    pub fn apply(&self, features: &[Feature]) -> Option<Vec<Feature>> {
        let floor = rank(self.severity);
        let kept: Vec<Feature> = features
            .iter()
            .filter_map(|feature| {
                let score_ok = self.min_score <= 0.0
                    || feature.base_scores.iter().any(|s| *s > self.min_score);
                let findings: Vec<_> = feature
                    .findings
                    .iter()
                    .filter(|v| {
                        let severity_ok = self.severity.is_none() || rank(v.severity()) >= floor;
                        severity_ok && score_ok
                    })
                    .cloned()
                    .collect();
                if findings.is_empty() {
                    None
                } else {
                    Some(Feature {
                        findings,
                        ..feature.clone()
                    })
                }
            })
            .collect();

        if kept.is_empty() {
            None
        } else {
            Some(kept)
        }
    }
}

/// Tag-name matcher: an empty pattern matches everything; a pattern that does
/// not compile matches nothing.
#[derive(Debug, Clone)]
pub enum TagMatcher {
    All,
    Pattern(Regex),
    Nothing,
}

impl TagMatcher {
    pub fn new(pattern: Option<&str>) -> Self {
        match pattern {
            None | Some("") => TagMatcher::All,
            Some(p) => match Regex::new(p) {
                Ok(re) => TagMatcher::Pattern(re),
                Err(e) => {
                    warn!("Tag pattern '{}' is invalid, no tag will match: {}", p, e);
                    TagMatcher::Nothing
                }
            },
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            TagMatcher::All => true,
            TagMatcher::Pattern(re) => re.is_match(name),
            TagMatcher::Nothing => false,
        }
    }
}
