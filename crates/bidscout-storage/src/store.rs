//! Remote record store: the seam the upload batcher submits batches through.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bidscout_core::ErrorKind;
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

/// A single remote field value. Dates serialize as `YYYY-MM-DD`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Date(NaiveDate),
    Text(String),
}

impl FieldValue {
    pub fn to_json(&self) -> JsonValue {
        match self {
            FieldValue::Date(d) => JsonValue::String(d.format("%Y-%m-%d").to_string()),
            FieldValue::Text(s) => JsonValue::String(s.clone()),
        }
    }
}

/// Remote representation of one record: field name to value.
pub type StoreRecord = BTreeMap<String, FieldValue>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rate limited by record store (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("record store rejected batch with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("record store transport error: {0}")]
    Transport(String),
    #[error("unexpected record store response: {0}")]
    InvalidResponse(String),
}

impl StoreError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, StoreError::RateLimited { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::RateLimited { .. } => ErrorKind::RateLimit,
            StoreError::Rejected { status, .. } => crate::error_kind_for_status(*status),
            StoreError::Transport(_) => ErrorKind::TransientNetwork,
            StoreError::InvalidResponse(_) => ErrorKind::UnrecoverableParse,
        }
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create records in one request. Returns how many the store acknowledged.
    async fn create_records(&self, batch: &[StoreRecord]) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone)]
pub struct AirtableConfig {
    pub access_token: String,
    pub base_id: String,
    pub table_name: String,
    pub api_root: String,
    pub timeout: Duration,
}

impl AirtableConfig {
    pub fn new(access_token: impl Into<String>, base_id: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            base_id: base_id.into(),
            table_name: table_name.into(),
            api_root: "https://api.airtable.com/v0".to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn endpoint(&self) -> String {
        format!(
            "{}/{}/{}",
            self.api_root.trim_end_matches('/'),
            self.base_id,
            self.table_name.replace(' ', "%20")
        )
    }
}

#[derive(Debug)]
pub struct AirtableStore {
    client: reqwest::Client,
    config: AirtableConfig,
}

impl AirtableStore {
    pub fn new(config: AirtableConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building record store client")?;
        Ok(Self { client, config })
    }

    pub fn payload(batch: &[StoreRecord]) -> JsonValue {
        let records = batch
            .iter()
            .map(|record| {
                let fields = record
                    .iter()
                    .map(|(name, value)| (name.clone(), value.to_json()))
                    .collect::<serde_json::Map<_, _>>();
                json!({ "fields": fields })
            })
            .collect::<Vec<_>>();
        json!({ "records": records })
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<JsonValue>(body)
        .ok()
        .and_then(|v| v.get("error").cloned())
        .map(|e| match e {
            JsonValue::String(s) => s,
            other => other
                .get("message")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string)
                .unwrap_or_else(|| other.to_string()),
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}

#[async_trait]
impl RecordStore for AirtableStore {
    async fn create_records(&self, batch: &[StoreRecord]) -> Result<usize, StoreError> {
        let resp = self
            .client
            .post(self.config.endpoint())
            .bearer_auth(&self.config.access_token)
            .json(&Self::payload(batch))
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(StoreError::RateLimited {
                retry_after: retry_after(resp.headers()),
            });
        }

        let body = resp
            .text()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        let value: JsonValue = serde_json::from_str(&body)
            .map_err(|e| StoreError::InvalidResponse(e.to_string()))?;
        let created = value
            .get("records")
            .and_then(JsonValue::as_array)
            .map(Vec::len)
            .ok_or_else(|| StoreError::InvalidResponse("missing records array".to_string()))?;
        debug!(submitted = batch.len(), created, "record store acknowledged batch");
        Ok(created)
    }
}
