//! Shared recency cutoff and the date filter engine.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_LAST_DAYS: u32 = 42;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CutoffError {
    #[error("cutoff date and last-N-days are mutually exclusive; supply only one")]
    ConflictingModes,
    #[error("last-N-days must be at least 1, got {0}")]
    EmptyWindow(u32),
}

/// How the run cutoff is chosen. Exactly one mode applies to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutoffMode {
    Absolute(NaiveDate),
    LastDays(u32),
}

impl Default for CutoffMode {
    fn default() -> Self {
        CutoffMode::LastDays(DEFAULT_LAST_DAYS)
    }
}

impl CutoffMode {
    pub fn from_options(since: Option<NaiveDate>, last_days: Option<u32>) -> Result<Self, CutoffError> {
        match (since, last_days) {
            (Some(_), Some(_)) => Err(CutoffError::ConflictingModes),
            (Some(date), None) => Ok(CutoffMode::Absolute(date)),
            (None, Some(0)) => Err(CutoffError::EmptyWindow(0)),
            (None, Some(days)) => Ok(CutoffMode::LastDays(days)),
            (None, None) => Ok(CutoffMode::default()),
        }
    }

    /// Resolve once per run against the run start date.
    pub fn resolve(self, run_start: NaiveDate) -> Cutoff {
        let date = match self {
            CutoffMode::Absolute(date) => date,
            CutoffMode::LastDays(days) => run_start - Duration::days(i64::from(days)),
        };
        Cutoff { date, mode: self }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cutoff {
    date: NaiveDate,
    mode: CutoffMode,
}

impl Cutoff {
    pub fn on(date: NaiveDate) -> Self {
        Self {
            date,
            mode: CutoffMode::Absolute(date),
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn mode(&self) -> CutoffMode {
        self.mode
    }

    /// Inclusive boundary.
    pub fn admits(&self, date: NaiveDate) -> bool {
        date >= self.date
    }
}

/// Whether a portal's listing is provably sorted by posting date, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingOrder {
    PostedDescending,
    Unordered,
}

pub trait Dated {
    fn posted_on(&self) -> Option<NaiveDate>;
    fn mark_low_confidence(&mut self);
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome<T> {
    pub kept: Vec<T>,
    pub excluded: usize,
    pub low_confidence: usize,
    /// Set once an item strictly older than the cutoff is seen in a descending listing.
    pub early_terminate: bool,
}

/// Keep items dated on or after the cutoff.
///
/// Items without a parseable date are kept and flagged low-confidence. The whole slice is
/// always scanned, so `early_terminate` only tells the caller not to fetch further pages.
pub fn filter<T: Dated>(items: Vec<T>, cutoff: &Cutoff, order: ListingOrder) -> FilterOutcome<T> {
    let mut kept = Vec::with_capacity(items.len());
    let mut excluded = 0usize;
    let mut low_confidence = 0usize;
    let mut early_terminate = false;

    for mut item in items {
        match item.posted_on() {
            Some(date) if cutoff.admits(date) => kept.push(item),
            Some(_) => {
                excluded += 1;
                if order == ListingOrder::PostedDescending {
                    early_terminate = true;
                }
            }
            None => {
                item.mark_low_confidence();
                low_confidence += 1;
                kept.push(item);
            }
        }
    }

    FilterOutcome {
        kept,
        excluded,
        low_confidence,
        early_terminate,
    }
}
