//! Run configuration: environment layer plus the `portals.yaml` registry.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use bidscout_core::{CutoffError, CutoffMode};
use bidscout_drivers::ListingTarget;
use bidscout_storage::{AirtableConfig, BackoffPolicy};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a valid {expected}")]
    InvalidVar {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error(transparent)]
    Cutoff(#[from] CutoffError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortalMode {
    #[default]
    Live,
    Fixture,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub city: Option<String>,
    pub listing_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalConfig {
    pub portal_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub mode: PortalMode,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl PortalConfig {
    pub fn listing_targets(&self) -> Vec<ListingTarget> {
        self.targets
            .iter()
            .map(|t| ListingTarget {
                city: t.city.clone(),
                listing_url: t.listing_url.clone(),
            })
            .collect()
    }
}

/// Remote field names for each record attribute. Unset optional fields are not sent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreFields {
    pub title: String,
    pub description: String,
    pub posted_on: String,
    pub due_on: String,
    pub detail_url: String,
    pub agency: Option<String>,
    pub category: Option<String>,
    pub risk_tag: Option<String>,
}

impl Default for StoreFields {
    fn default() -> Self {
        Self {
            title: "Project Name".to_string(),
            description: "Summary".to_string(),
            posted_on: "Published Date".to_string(),
            due_on: "Due Date".to_string(),
            detail_url: "Link".to_string(),
            agency: None,
            category: None,
            risk_tag: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalRegistry {
    pub portals: Vec<PortalConfig>,
    #[serde(default)]
    pub store_fields: StoreFields,
}

impl PortalRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing portal registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &PortalConfig> {
        self.portals.iter().filter(|p| p.enabled)
    }

    pub fn get(&self, portal_id: &str) -> Option<&PortalConfig> {
        self.portals.iter().find(|p| p.portal_id == portal_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    #[default]
    Automatic,
    Interactive,
    Off,
}

impl FromStr for RetryMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "automatic" => Ok(RetryMode::Automatic),
            "interactive" => Ok(RetryMode::Interactive),
            "off" | "none" => Ok(RetryMode::Off),
            other => Err(format!("unknown retry mode {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub workspace_root: PathBuf,
    pub output_dir: PathBuf,
    pub cutoff_mode: CutoffMode,
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_mode: RetryMode,
    pub intervention_wait: Duration,
    pub max_concurrent_portals: usize,
    pub max_connections: usize,
    /// Detail fetch pool size, and concurrent requests allowed per portal host.
    pub detail_workers: usize,
    pub user_agent: String,
    pub http_timeout: Duration,
    pub store: Option<AirtableConfig>,
    pub debug: bool,
    pub retry_backoff: BackoffPolicy,
    pub upload_backoff: BackoffPolicy,
    pub batch_pause: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            output_dir: PathBuf::from("./output"),
            cutoff_mode: CutoffMode::default(),
            batch_size: 10,
            max_retries: 3,
            retry_mode: RetryMode::Automatic,
            intervention_wait: Duration::from_secs(300),
            max_concurrent_portals: 4,
            max_connections: 8,
            detail_workers: 4,
            user_agent: "bidscout/0.1".to_string(),
            http_timeout: Duration::from_secs(30),
            store: None,
            debug: false,
            retry_backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(8),
                jitter: Duration::from_millis(250),
            },
            upload_backoff: BackoffPolicy {
                max_retries: 4,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                jitter: Duration::from_millis(250),
            },
            batch_pause: Duration::from_millis(200),
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidVar {
                var,
                expected,
                value,
            }),
        _ => Ok(None),
    }
}

fn truthy(value: Option<String>) -> bool {
    value
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

impl RunConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let workspace_root = lookup("BIDSCOUT_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or(defaults.workspace_root);
        let output_dir = lookup("BIDSCOUT_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| workspace_root.join("output"));

        let since = parse_var::<NaiveDate>(&lookup, "BID_FILTER_DATE", "date (YYYY-MM-DD)")?;
        let days = parse_var::<u32>(&lookup, "BID_FILTER_DAYS", "day count")?;
        let cutoff_mode = CutoffMode::from_options(since, days)?;

        let store = match (lookup("AIRTABLE_ACCESS_TOKEN"), lookup("AIRTABLE_BASE_ID")) {
            (Some(token), Some(base)) if !token.trim().is_empty() && !base.trim().is_empty() => {
                let table = lookup("AIRTABLE_TABLE_NAME").unwrap_or_else(|| "Government Bids".to_string());
                Some(AirtableConfig::new(token.trim(), base.trim(), table))
            }
            _ => None,
        };

        Ok(Self {
            workspace_root,
            output_dir,
            cutoff_mode,
            batch_size: parse_var(&lookup, "BIDSCOUT_BATCH_SIZE", "batch size")?
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.batch_size),
            max_retries: parse_var(&lookup, "BIDSCOUT_MAX_RETRIES", "retry count")?
                .unwrap_or(defaults.max_retries),
            retry_mode: defaults.retry_mode,
            intervention_wait: parse_var(&lookup, "BIDSCOUT_INTERVENTION_WAIT_SECS", "second count")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.intervention_wait),
            max_concurrent_portals: parse_var(&lookup, "BIDSCOUT_MAX_CONCURRENT_PORTALS", "portal count")?
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_concurrent_portals),
            max_connections: parse_var(&lookup, "BIDSCOUT_MAX_CONNECTIONS", "connection count")?
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_connections),
            detail_workers: parse_var(&lookup, "BIDSCOUT_DETAIL_WORKERS", "worker count")?
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.detail_workers),
            user_agent: lookup("BIDSCOUT_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout: parse_var(&lookup, "BIDSCOUT_HTTP_TIMEOUT_SECS", "second count")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            store,
            debug: truthy(lookup("BIDSCOUT_DEBUG")),
            retry_backoff: defaults.retry_backoff,
            upload_backoff: defaults.upload_backoff,
            batch_pause: defaults.batch_pause,
        })
    }

    pub fn portals_path(&self) -> PathBuf {
        self.workspace_root.join("portals.yaml")
    }

    pub fn fixtures_dir(&self) -> PathBuf {
        self.workspace_root.join("fixtures")
    }
}
