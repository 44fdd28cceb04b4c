//! Where driver pages come from: the live HTTP fetcher or recorded fixtures.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bidscout_core::ErrorKind;
use bidscout_storage::{ArtifactStore, FetchError, HttpFetcher};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::DriverError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Final URL after redirects; relative links resolve against it.
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, portal_id: &str, url: &str) -> Result<Page, DriverError>;
}

const CHALLENGE_MARKERS: &[&str] = &[
    "g-recaptcha",
    "h-captcha",
    "cf-challenge",
    "captcha-container",
    "verify you are human",
];

/// Bot-check pages that only a person can clear.
pub fn looks_like_challenge(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    CHALLENGE_MARKERS.iter().any(|m| lower.contains(m))
}

#[derive(Debug, Clone)]
pub struct HttpPageSource {
    fetcher: Arc<HttpFetcher>,
    run_id: Uuid,
    captures: Option<ArtifactStore>,
}

impl HttpPageSource {
    pub fn new(fetcher: Arc<HttpFetcher>, run_id: Uuid) -> Self {
        Self {
            fetcher,
            run_id,
            captures: None,
        }
    }

    /// Keep a copy of every fetched page (debug mode).
    pub fn with_captures(mut self, store: ArtifactStore) -> Self {
        self.captures = Some(store);
        self
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch(&self, portal_id: &str, url: &str) -> Result<Page, DriverError> {
        let resp = self.fetcher.fetch_bytes(self.run_id, portal_id, url).await?;
        if let Some(store) = &self.captures {
            match store
                .store_page(resp.fetched_at, portal_id, "html", &resp.body)
                .await
            {
                Ok(artifact) => debug!(
                    portal_id,
                    url,
                    path = %artifact.relative_path.display(),
                    "captured page"
                ),
                Err(err) => warn!(portal_id, url, error = %err, "page capture failed"),
            }
        }

        let body = String::from_utf8_lossy(&resp.body).into_owned();
        if looks_like_challenge(&body) {
            return Err(DriverError::NeedsIntervention {
                url: url.to_string(),
            });
        }
        Ok(Page {
            url: resp.final_url,
            body,
            fetched_at: resp.fetched_at,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum FixtureEntry {
    File(String),
    Status { status: u16 },
}

/// Serves pages recorded under `<root>/<portal_id>/`, indexed by `pages.json`
/// (`{"<url>": "listing-1.html"}` or `{"<url>": {"status": 503}}` to replay a failure).
#[derive(Debug, Clone)]
pub struct FixturePageSource {
    root: PathBuf,
}

impl FixturePageSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn index(&self, portal_id: &str) -> anyhow::Result<HashMap<String, FixtureEntry>> {
        let path = self.root.join(portal_id).join("pages.json");
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading fixture index {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing fixture index {}", path.display()))
    }
}

#[async_trait]
impl PageSource for FixturePageSource {
    async fn fetch(&self, portal_id: &str, url: &str) -> Result<Page, DriverError> {
        let index = self.index(portal_id).await?;
        let entry = index.get(url).ok_or_else(|| DriverError::Page {
            url: url.to_string(),
            kind: ErrorKind::UnrecoverableParse,
            message: "no fixture recorded for url".to_string(),
        })?;
        let file = match entry {
            FixtureEntry::File(file) => file,
            FixtureEntry::Status { status } => {
                return Err(DriverError::Fetch(FetchError::HttpStatus {
                    status: *status,
                    url: url.to_string(),
                }))
            }
        };

        let path = self.root.join(portal_id).join(file);
        let body = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading fixture page {}", path.display()))?;
        if looks_like_challenge(&body) {
            return Err(DriverError::NeedsIntervention {
                url: url.to_string(),
            });
        }
        Ok(Page {
            url: url.to_string(),
            body,
            fetched_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_markers_are_case_insensitive() {
        assert!(looks_like_challenge("<div class=\"g-recaptcha\"></div>"));
        assert!(looks_like_challenge("<p>Verify you are HUMAN</p>"));
        assert!(!looks_like_challenge("<table><tr><td>Bid 1</td></tr></table>"));
    }
}
