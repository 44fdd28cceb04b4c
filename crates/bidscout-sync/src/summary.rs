//! Run summary: per-portal terminal status and grand totals from final counts.

use std::collections::BTreeMap;
use std::fmt;

use bidscout_core::{BidRecord, FailedPage, PortalFault, ScrapeResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::retry::RetryOutcome;
use crate::upload::UploadResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortalStatus {
    Success,
    SuccessWithErrors,
    Failed,
}

impl fmt::Display for PortalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PortalStatus::Success => "success",
            PortalStatus::SuccessWithErrors => "success-with-errors",
            PortalStatus::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalSummary {
    pub portal_id: String,
    pub display_name: String,
    pub multi_agency: bool,
    pub status: PortalStatus,
    /// Records in the final, deduplicated set.
    pub records: usize,
    pub uploaded: usize,
    pub upload_failed: usize,
    /// Per-city record counts; empty for single-agency portals.
    pub cities: BTreeMap<String, usize>,
    pub failed_pages: usize,
    pub recovered_pages: usize,
    pub excluded_by_cutoff: usize,
    pub error: Option<PortalFault>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub portals: usize,
    pub succeeded: usize,
    pub with_errors: usize,
    pub failed: usize,
    pub records: usize,
    pub uploaded: usize,
    pub upload_failed: usize,
    pub failed_pages: usize,
    pub recovered_pages: usize,
    pub excluded_by_cutoff: usize,
    pub dropped_incomplete: usize,
    pub duplicates_removed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cutoff: NaiveDate,
    pub portals: Vec<PortalSummary>,
    pub upload: UploadResult,
    pub still_failed: Vec<FailedPage>,
    pub totals: Totals,
}

impl RunSummary {
    pub fn portal(&self, portal_id: &str) -> Option<&PortalSummary> {
        self.portals.iter().find(|p| p.portal_id == portal_id)
    }

    /// One line per failure, naming its scope and error kind.
    pub fn failure_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for portal in &self.portals {
            if let Some(fault) = &portal.error {
                lines.push(format!("{}: failed [{}] {}", portal.portal_id, fault.kind, fault.message));
            }
        }
        for page in &self.still_failed {
            lines.push(format!("{}: {} {}", page.scope(), page.error_kind, page.url));
        }
        for batch in self.upload.batches.iter().filter(|b| b.is_failed()) {
            let kind = batch.error_kind.map(|k| k.as_str()).unwrap_or("partial_ack");
            lines.push(format!(
                "upload/batch {}: {} {}",
                batch.index,
                kind,
                batch.error.as_deref().unwrap_or_default()
            ));
        }
        lines
    }
}

#[derive(Debug, Default)]
struct PortalSlot {
    display_name: String,
    multi_agency: bool,
    fatal: Option<PortalFault>,
    excluded_by_cutoff: usize,
    recovered_pages: usize,
}

/// Folds scrape results, retry outcomes and the upload result into a `RunSummary`.
#[derive(Debug)]
pub struct SummaryAggregator {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    cutoff: NaiveDate,
    portals: BTreeMap<String, PortalSlot>,
}

impl SummaryAggregator {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>, cutoff: NaiveDate) -> Self {
        Self {
            run_id,
            started_at,
            cutoff,
            portals: BTreeMap::new(),
        }
    }

    fn slot(&mut self, portal_id: &str) -> &mut PortalSlot {
        self.portals
            .entry(portal_id.to_string())
            .or_insert_with(|| PortalSlot {
                display_name: portal_id.to_string(),
                ..PortalSlot::default()
            })
    }

    pub fn add_scrape(&mut self, result: &ScrapeResult) {
        let slot = self.slot(&result.portal_id);
        slot.display_name = result.display_name.clone();
        slot.multi_agency = result.multi_agency;
        slot.fatal = result.fatal.clone();
        slot.excluded_by_cutoff += result.excluded_by_cutoff;
    }

    pub fn add_retry(&mut self, outcome: &RetryOutcome) {
        for page in &outcome.resolved {
            self.slot(&page.portal_id).recovered_pages += 1;
        }
        for (portal_id, n) in &outcome.excluded_by_cutoff {
            self.slot(portal_id).excluded_by_cutoff += n;
        }
    }

    /// `final_records` is the deduplicated set that was handed to the upload batcher.
    pub fn finish(
        mut self,
        final_records: &[BidRecord],
        still_failed: Vec<FailedPage>,
        upload: UploadResult,
        dropped_incomplete: usize,
        duplicates_removed: usize,
    ) -> RunSummary {
        let mut records: BTreeMap<String, Vec<&BidRecord>> = BTreeMap::new();
        for record in final_records {
            records.entry(record.portal_id.clone()).or_default().push(record);
        }
        let mut failed_pages: BTreeMap<String, usize> = BTreeMap::new();
        for page in &still_failed {
            *failed_pages.entry(page.portal_id.clone()).or_default() += 1;
        }
        for portal_id in records.keys().chain(failed_pages.keys()) {
            if !self.portals.contains_key(portal_id) {
                self.slot(portal_id);
            }
        }

        let mut totals = Totals {
            dropped_incomplete,
            duplicates_removed,
            ..Totals::default()
        };
        let mut portals = Vec::with_capacity(self.portals.len());
        for (portal_id, slot) in self.portals {
            let portal_records = records.remove(&portal_id).unwrap_or_default();
            let count = portal_records.len();
            let upload_failed = upload.failed_for(&portal_id);
            let uploaded = if upload.skipped { 0 } else { count.saturating_sub(upload_failed) };
            let failed = failed_pages.get(&portal_id).copied().unwrap_or(0);

            let mut cities = BTreeMap::new();
            if slot.multi_agency {
                for record in &portal_records {
                    *cities.entry(record.city_bucket().to_string()).or_default() += 1;
                }
            }

            let status = if slot.fatal.is_some() {
                PortalStatus::Failed
            } else if failed > 0 || upload_failed > 0 {
                PortalStatus::SuccessWithErrors
            } else {
                PortalStatus::Success
            };
            match status {
                PortalStatus::Success => totals.succeeded += 1,
                PortalStatus::SuccessWithErrors => totals.with_errors += 1,
                PortalStatus::Failed => totals.failed += 1,
            }
            totals.records += count;
            totals.uploaded += uploaded;
            totals.upload_failed += upload_failed;
            totals.failed_pages += failed;
            totals.recovered_pages += slot.recovered_pages;
            totals.excluded_by_cutoff += slot.excluded_by_cutoff;

            portals.push(PortalSummary {
                portal_id,
                display_name: slot.display_name,
                multi_agency: slot.multi_agency,
                status,
                records: count,
                uploaded,
                upload_failed,
                cities,
                failed_pages: failed,
                recovered_pages: slot.recovered_pages,
                excluded_by_cutoff: slot.excluded_by_cutoff,
                error: slot.fatal,
            });
        }
        totals.portals = portals.len();

        RunSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            cutoff: self.cutoff,
            portals,
            upload,
            still_failed,
            totals,
        }
    }
}
