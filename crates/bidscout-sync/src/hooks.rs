//! Dedup and enrichment hooks applied to the merged record set before upload.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use bidscout_core::BidRecord;
use serde::Deserialize;

pub trait DedupHook: Send + Sync {
    fn apply(&self, records: Vec<BidRecord>) -> Result<Vec<BidRecord>>;
}

pub trait EnrichmentHook: Send + Sync {
    fn apply(&self, records: Vec<BidRecord>) -> Result<Vec<BidRecord>>;
}

/// Keeps the first record seen for each (portal id, detail URL).
#[derive(Debug, Default)]
pub struct NaturalKeyDedup;

impl DedupHook for NaturalKeyDedup {
    fn apply(&self, records: Vec<BidRecord>) -> Result<Vec<BidRecord>> {
        let mut seen = HashSet::new();
        Ok(records.into_iter().filter(|r| seen.insert(r.key())).collect())
    }
}

#[derive(Debug, Default)]
pub struct NoopEnrichmentHook;

impl EnrichmentHook for NoopEnrichmentHook {
    fn apply(&self, records: Vec<BidRecord>) -> Result<Vec<BidRecord>> {
        Ok(records)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct EnrichmentRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    categories: Vec<CategoryRule>,
    #[serde(default)]
    risks: Vec<RiskRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct CategoryRule {
    category: String,
    contains_any: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RiskRule {
    risk_tag: String,
    contains_any: Vec<String>,
}

/// Keyword rules from `rules/enrichment.yaml`. First matching rule wins; values already set
/// by an upstream categorizer are left alone.
#[derive(Debug, Clone)]
pub struct KeywordRulesEnrichment {
    categories: Vec<CategoryRule>,
    risks: Vec<RiskRule>,
}

impl KeywordRulesEnrichment {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let file: EnrichmentRulesFile = serde_yaml::from_str(text).context("parsing enrichment rules")?;
        Ok(Self {
            categories: file.categories,
            risks: file.risks,
        })
    }

    /// `Ok(None)` when the workspace has no rules file.
    pub fn from_workspace_root(root: &Path) -> Result<Option<Self>> {
        let path = root.join("rules").join("enrichment.yaml");
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text)
            .with_context(|| format!("loading {}", path.display()))
            .map(Some)
    }
}

/// Keyword rules when the workspace has them, otherwise a no-op hook.
pub fn enrichment_from_workspace(root: &Path) -> Result<Box<dyn EnrichmentHook>> {
    Ok(match KeywordRulesEnrichment::from_workspace_root(root)? {
        Some(rules) => Box::new(rules),
        None => Box::new(NoopEnrichmentHook),
    })
}

fn matches_any(haystack: &str, needles: &[String]) -> bool {
    needles
        .iter()
        .any(|needle| haystack.contains(&needle.to_ascii_lowercase()))
}

impl EnrichmentHook for KeywordRulesEnrichment {
    fn apply(&self, mut records: Vec<BidRecord>) -> Result<Vec<BidRecord>> {
        for record in &mut records {
            let combined = format!(
                "{} {}",
                record.title,
                record.description.as_deref().unwrap_or_default()
            )
            .to_ascii_lowercase();

            if record.category.is_none() {
                record.category = self
                    .categories
                    .iter()
                    .find(|rule| matches_any(&combined, &rule.contains_any))
                    .map(|rule| rule.category.clone());
            }
            if record.risk_tag.is_none() {
                record.risk_tag = self
                    .risks
                    .iter()
                    .find(|rule| matches_any(&combined, &rule.contains_any))
                    .map(|rule| rule.risk_tag.clone());
            }
        }
        Ok(records)
    }
}
