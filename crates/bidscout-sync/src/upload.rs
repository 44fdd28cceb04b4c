//! Store record preparation and the sequential upload batcher.

use std::time::Duration;

use bidscout_core::{BidRecord, ErrorKind, RecordKey};
use bidscout_storage::{BackoffPolicy, FieldValue, RecordStore, StoreError, StoreRecord};
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::StoreFields;

const SUMMARY_LIMIT: usize = 1000;
const TEXT_LIMIT: usize = 50_000;

/// Split off records missing a title or detail URL; returns the kept set and the drop count.
pub fn partition_complete(records: Vec<BidRecord>) -> (Vec<BidRecord>, usize) {
    let before = records.len();
    let kept: Vec<BidRecord> = records
        .into_iter()
        .filter(|r| {
            let ok = r.is_complete();
            if !ok {
                warn!(portal_id = %r.portal_id, url = %r.detail_url, "dropping incomplete record");
            }
            ok
        })
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

fn clean(value: &str) -> Option<&str> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("n/a") {
        None
    } else {
        Some(value)
    }
}

fn truncate_chars(value: &str, limit: usize, suffix: &str) -> String {
    match value.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}{suffix}", &value[..idx]),
        None => value.to_string(),
    }
}

/// Maps records onto the remote field set configured in `store_fields`.
#[derive(Debug, Clone)]
pub struct FieldMapper {
    fields: StoreFields,
}

impl FieldMapper {
    pub fn new(fields: StoreFields) -> Self {
        Self { fields }
    }

    fn put_text(out: &mut StoreRecord, field: &str, value: Option<&str>) {
        if let Some(value) = value.and_then(clean) {
            out.insert(
                field.to_string(),
                FieldValue::Text(truncate_chars(value, TEXT_LIMIT, "... [truncated]")),
            );
        }
    }

    pub fn map(&self, record: &BidRecord) -> StoreRecord {
        let mut out = StoreRecord::new();
        Self::put_text(&mut out, &self.fields.title, Some(&record.title));

        let summary = record
            .description
            .as_deref()
            .and_then(clean)
            .or_else(|| clean(&record.title));
        if let Some(summary) = summary {
            out.insert(
                self.fields.description.clone(),
                FieldValue::Text(truncate_chars(summary, SUMMARY_LIMIT, "...")),
            );
        }

        if let Some(date) = record.posted_on {
            out.insert(self.fields.posted_on.clone(), FieldValue::Date(date));
        }
        if let Some(date) = record.due_on {
            out.insert(self.fields.due_on.clone(), FieldValue::Date(date));
        }
        Self::put_text(&mut out, &self.fields.detail_url, Some(&record.detail_url));

        if let Some(field) = &self.fields.agency {
            Self::put_text(&mut out, field, record.agency.as_deref());
        }
        if let Some(field) = &self.fields.category {
            Self::put_text(&mut out, field, record.category.as_deref());
        }
        if let Some(field) = &self.fields.risk_tag {
            Self::put_text(&mut out, field, record.risk_tag.as_deref());
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub key: RecordKey,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// 1-based.
    pub index: usize,
    pub size: usize,
    pub attempts: usize,
    pub created: usize,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
}

impl BatchReport {
    pub fn is_failed(&self) -> bool {
        self.created < self.size
    }
}

/// Invariant: `success_count + failure_count == submitted`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub submitted: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub errors: Vec<RecordFailure>,
    pub batches: Vec<BatchReport>,
    /// No store configured; nothing was sent.
    pub skipped: bool,
}

impl UploadResult {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn failed_for(&self, portal_id: &str) -> usize {
        self.errors.iter().filter(|e| e.key.portal_id == portal_id).count()
    }
}

pub struct UploadBatcher<'a> {
    store: &'a dyn RecordStore,
    mapper: FieldMapper,
    batch_size: usize,
    backoff: BackoffPolicy,
    pause: Duration,
}

impl<'a> UploadBatcher<'a> {
    pub fn new(store: &'a dyn RecordStore, mapper: FieldMapper, batch_size: usize) -> Self {
        Self {
            store,
            mapper,
            batch_size: batch_size.max(1),
            backoff: BackoffPolicy::default(),
            pause: Duration::from_millis(200),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Pause between consecutive batches.
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    /// Submit batches one after another. A failed batch never rolls back earlier ones.
    pub async fn upload(&self, records: &[BidRecord]) -> UploadResult {
        let mut result = UploadResult {
            submitted: records.len(),
            ..UploadResult::default()
        };

        for (i, chunk) in records.chunks(self.batch_size).enumerate() {
            if i > 0 && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
            let index = i + 1;
            let report = self
                .submit_batch(index, chunk)
                .instrument(info_span!("upload_batch", batch = index, size = chunk.len()))
                .await;

            result.success_count += report.created;
            result.failure_count += chunk.len() - report.created;
            let message = report.error.clone().unwrap_or_default();
            for record in &chunk[report.created..] {
                result.errors.push(RecordFailure {
                    key: record.key(),
                    message: message.clone(),
                });
            }
            result.batches.push(report);
        }

        info!(
            submitted = result.submitted,
            success = result.success_count,
            failed = result.failure_count,
            batches = result.batches.len(),
            "upload finished"
        );
        result
    }

    async fn submit_batch(&self, index: usize, chunk: &[BidRecord]) -> BatchReport {
        let payload: Vec<StoreRecord> = chunk.iter().map(|r| self.mapper.map(r)).collect();
        let mut attempts = 0usize;
        loop {
            attempts += 1;
            match self.store.create_records(&payload).await {
                Ok(created) => {
                    let created = created.min(chunk.len());
                    let missing = chunk.len() - created;
                    if missing > 0 {
                        warn!(created, missing, "store acknowledged part of the batch");
                    }
                    return BatchReport {
                        index,
                        size: chunk.len(),
                        attempts,
                        created,
                        error_kind: None,
                        error: (missing > 0).then(|| "missing from store response".to_string()),
                    };
                }
                Err(err) if err.is_rate_limit() && attempts <= self.backoff.max_retries => {
                    let delay = match &err {
                        StoreError::RateLimited {
                            retry_after: Some(after),
                        } => (*after).min(self.backoff.max_delay),
                        _ => self.backoff.jittered_delay(attempts - 1),
                    };
                    warn!(attempt = attempts, delay_ms = delay.as_millis() as u64, "rate limited; retrying batch");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(error_kind = %err.kind(), attempts, error = %err, "batch failed");
                    return BatchReport {
                        index,
                        size: chunk.len(),
                        attempts,
                        created: 0,
                        error_kind: Some(err.kind()),
                        error: Some(err.to_string()),
                    };
                }
            }
        }
    }
}
