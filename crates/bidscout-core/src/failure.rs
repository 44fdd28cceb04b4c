//! Failed pages and their retry lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    Listing,
    Detail,
}

/// `Pending -> InFlight -> {Recovered | Pending | PermanentlyFailed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureState {
    Pending,
    InFlight,
    Recovered,
    PermanentlyFailed,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid transition {from:?} -> {to:?} for {url}")]
pub struct TransitionError {
    pub url: String,
    pub from: FailureState,
    pub to: FailureState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedPage {
    pub id: Uuid,
    pub url: String,
    pub portal_id: String,
    pub city: Option<String>,
    pub kind: PageKind,
    pub error_kind: ErrorKind,
    pub last_error: String,
    pub attempts: u32,
    pub state: FailureState,
    /// Raw posting date seen on the listing row, carried to the recovered record.
    pub posted_hint: Option<String>,
    pub first_failed_at: DateTime<Utc>,
    #[serde(default)]
    pub resubmitted_from: Option<Uuid>,
}

impl FailedPage {
    pub fn new(
        portal_id: impl Into<String>,
        url: impl Into<String>,
        kind: PageKind,
        error_kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            portal_id: portal_id.into(),
            city: None,
            kind,
            error_kind,
            last_error: message.into(),
            attempts: 0,
            state: FailureState::Pending,
            posted_hint: None,
            first_failed_at: Utc::now(),
            resubmitted_from: None,
        }
    }

    pub fn with_city(mut self, city: Option<String>) -> Self {
        self.city = city;
        self
    }

    pub fn with_posted_hint(mut self, posted: Option<String>) -> Self {
        self.posted_hint = posted;
        self
    }

    /// Origin host used to serialize attempts; unparseable URLs share one bucket.
    pub fn host(&self) -> String {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
            .unwrap_or_default()
    }

    /// `portal` or `portal/city`, used in one-line failure reports and operator prompts.
    pub fn scope(&self) -> String {
        match &self.city {
            Some(city) => format!("{}/{}", self.portal_id, city),
            None => self.portal_id.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, FailureState::Recovered | FailureState::PermanentlyFailed)
    }

    pub fn is_outstanding(&self) -> bool {
        self.state != FailureState::Recovered
    }

    fn transition(&mut self, expect: FailureState, to: FailureState) -> Result<(), TransitionError> {
        if self.state != expect {
            return Err(TransitionError {
                url: self.url.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Pending -> InFlight; counts one attempt.
    pub fn dispatch(&mut self) -> Result<(), TransitionError> {
        self.transition(FailureState::Pending, FailureState::InFlight)?;
        self.attempts += 1;
        Ok(())
    }

    pub fn mark_recovered(&mut self) -> Result<(), TransitionError> {
        self.transition(FailureState::InFlight, FailureState::Recovered)
    }

    /// InFlight -> Pending while attempts remain and the error is retryable,
    /// otherwise InFlight -> PermanentlyFailed.
    pub fn mark_failed(
        &mut self,
        kind: ErrorKind,
        message: impl Into<String>,
        max_attempts: u32,
    ) -> Result<FailureState, TransitionError> {
        let next = if kind.is_retryable() && self.attempts < max_attempts {
            FailureState::Pending
        } else {
            FailureState::PermanentlyFailed
        };
        self.transition(FailureState::InFlight, next)?;
        self.error_kind = kind;
        self.last_error = message.into();
        Ok(next)
    }

    /// Pending -> PermanentlyFailed without an attempt, for errors retrying cannot fix.
    pub fn give_up(&mut self) -> Result<(), TransitionError> {
        self.transition(FailureState::Pending, FailureState::PermanentlyFailed)
    }

    /// Fresh Pending entry for an explicit resubmission; `self` is left untouched.
    pub fn resubmitted(&self) -> FailedPage {
        FailedPage {
            id: Uuid::new_v4(),
            attempts: 0,
            state: FailureState::Pending,
            resubmitted_from: Some(self.id),
            ..self.clone()
        }
    }
}

/// Run-wide failure registry. Drivers only append; the retry subsystem checks entries
/// out, owns them while retrying, and checks them back in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailureRegistry {
    entries: Vec<FailedPage>,
}

impl FailureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, page: FailedPage) {
        self.entries.push(page);
    }

    pub fn extend(&mut self, pages: impl IntoIterator<Item = FailedPage>) {
        self.entries.extend(pages);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[FailedPage] {
        &self.entries
    }

    /// Remove every Pending entry so exactly one retry worker owns it.
    pub fn checkout_pending(&mut self) -> Vec<FailedPage> {
        let (pending, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|p| p.state == FailureState::Pending);
        self.entries = rest;
        pending
    }

    pub fn check_in(&mut self, pages: impl IntoIterator<Item = FailedPage>) {
        self.entries.extend(pages);
    }

    pub fn outstanding(&self) -> Vec<FailedPage> {
        self.entries
            .iter()
            .filter(|p| p.is_outstanding())
            .cloned()
            .collect()
    }
}
