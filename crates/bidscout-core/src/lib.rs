//! Core domain model for bidscout: bid records, scrape results, the error taxonomy,
//! the shared recency cutoff and the failed-page lifecycle.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub mod dates;
pub mod failure;
pub mod filter;

pub use dates::parse_posting_date;
pub use failure::{FailedPage, FailureRegistry, FailureState, PageKind, TransitionError};
pub use filter::{filter, Cutoff, CutoffError, CutoffMode, Dated, FilterOutcome, ListingOrder};

pub const CRATE_NAME: &str = "bidscout-core";

/// Failure taxonomy shared by drivers, the retry subsystem and the upload batcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientNetwork,
    RenderTimeout,
    UnrecoverableParse,
    AuthenticationRequired,
    RateLimit,
    InterventionTimeout,
    Cancelled,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::TransientNetwork | ErrorKind::RenderTimeout | ErrorKind::RateLimit
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::RenderTimeout => "render_timeout",
            ErrorKind::UnrecoverableParse => "unrecoverable_parse",
            ErrorKind::AuthenticationRequired => "authentication_required",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::InterventionTimeout => "intervention_timeout",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateConfidence {
    #[default]
    Parsed,
    /// Posting date could not be parsed; the record is kept rather than dropped.
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Contact {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Natural key of a bid record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub portal_id: String,
    pub detail_url: String,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.portal_id, self.detail_url)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidRecord {
    pub portal_id: String,
    pub title: String,
    /// City or agency that posted the bid.
    pub agency: Option<String>,
    pub detail_url: String,
    pub posted_on: Option<NaiveDate>,
    pub posted_raw: Option<String>,
    pub due_on: Option<NaiveDate>,
    pub due_raw: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub contact: Contact,
    pub category: Option<String>,
    pub risk_tag: Option<String>,
    #[serde(default)]
    pub date_confidence: DateConfidence,
    pub fetched_at: DateTime<Utc>,
}

impl BidRecord {
    pub fn new(
        portal_id: impl Into<String>,
        title: impl Into<String>,
        detail_url: impl Into<String>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            portal_id: portal_id.into(),
            title: title.into(),
            agency: None,
            detail_url: detail_url.into(),
            posted_on: None,
            posted_raw: None,
            due_on: None,
            due_raw: None,
            description: None,
            contact: Contact::default(),
            category: None,
            risk_tag: None,
            date_confidence: DateConfidence::Parsed,
            fetched_at,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            portal_id: self.portal_id.clone(),
            detail_url: self.detail_url.clone(),
        }
    }

    /// Title and detail URL are required before a record may leave the run.
    pub fn is_complete(&self) -> bool {
        !self.title.trim().is_empty() && !self.detail_url.trim().is_empty()
    }

    pub fn is_low_confidence(&self) -> bool {
        self.date_confidence == DateConfidence::Low
    }

    /// City subtotal bucket; single-agency portals bucket under the portal id.
    pub fn city_bucket(&self) -> &str {
        self.agency.as_deref().unwrap_or(&self.portal_id)
    }
}

impl Dated for BidRecord {
    fn posted_on(&self) -> Option<NaiveDate> {
        self.posted_on
    }

    fn mark_low_confidence(&mut self) {
        self.date_confidence = DateConfidence::Low;
    }
}

/// Portal-fatal error captured on a scrape result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalFault {
    pub kind: ErrorKind,
    pub message: String,
}

/// Output of one runner invocation for one portal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub portal_id: String,
    pub display_name: String,
    pub multi_agency: bool,
    pub records: Vec<BidRecord>,
    pub failed_pages: Vec<FailedPage>,
    pub cities: BTreeMap<String, usize>,
    pub fatal: Option<PortalFault>,
    pub listing_pages_fetched: usize,
    pub excluded_by_cutoff: usize,
    pub early_terminated: bool,
}

impl ScrapeResult {
    pub fn new(portal_id: impl Into<String>, display_name: impl Into<String>, multi_agency: bool) -> Self {
        Self {
            portal_id: portal_id.into(),
            display_name: display_name.into(),
            multi_agency,
            ..Default::default()
        }
    }

    pub fn push_record(&mut self, record: BidRecord) {
        if self.multi_agency {
            *self
                .cities
                .entry(record.city_bucket().to_string())
                .or_default() += 1;
        }
        self.records.push(record);
    }

    /// True when the detail URL was already collected or recorded as failed.
    pub fn has_detail(&self, url: &str) -> bool {
        self.records.iter().any(|r| r.detail_url == url)
            || self.failed_pages.iter().any(|p| p.url == url)
    }

    pub fn is_failed(&self) -> bool {
        self.fatal.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fetched_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 10, 8, 0, 0).single().unwrap()
    }

    #[test]
    fn natural_key_is_portal_and_detail_url() {
        let rec = BidRecord::new("planetbids", "Street Resurfacing", "https://x/bo-detail/1", fetched_at());
        assert_eq!(
            rec.key(),
            RecordKey {
                portal_id: "planetbids".into(),
                detail_url: "https://x/bo-detail/1".into()
            }
        );
        assert_eq!(rec.key().to_string(), "planetbids:https://x/bo-detail/1");
    }

    #[test]
    fn only_transient_kinds_are_retryable() {
        assert!(ErrorKind::TransientNetwork.is_retryable());
        assert!(ErrorKind::RenderTimeout.is_retryable());
        assert!(ErrorKind::RateLimit.is_retryable());
        assert!(!ErrorKind::UnrecoverableParse.is_retryable());
        assert!(!ErrorKind::AuthenticationRequired.is_retryable());
        assert!(!ErrorKind::InterventionTimeout.is_retryable());
    }

    #[test]
    fn multi_agency_results_count_per_city() {
        let mut result = ScrapeResult::new("planetbids", "PlanetBids", true);
        let mut a = BidRecord::new("planetbids", "A", "u1", fetched_at());
        a.agency = Some("Burbank".into());
        let mut b = BidRecord::new("planetbids", "B", "u2", fetched_at());
        b.agency = Some("Burbank".into());
        let mut c = BidRecord::new("planetbids", "C", "u3", fetched_at());
        c.agency = Some("Downey".into());
        result.push_record(a);
        result.push_record(b);
        result.push_record(c);
        assert_eq!(result.cities.get("Burbank"), Some(&2));
        assert_eq!(result.cities.get("Downey"), Some(&1));
        assert!(result.has_detail("u2"));
        assert!(!result.has_detail("u9"));
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::AuthenticationRequired).unwrap();
        assert_eq!(json, "\"authentication_required\"");
    }
}
