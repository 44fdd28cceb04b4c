//! Portal driver contract, the static driver registry and the page sources drivers read from.

use std::sync::Arc;

use async_trait::async_trait;
use bidscout_core::{Cutoff, ErrorKind, FailedPage, BidRecord, ScrapeResult};
use bidscout_storage::FetchError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod html;
pub mod profiles;
pub mod source;

pub use html::{parse_detail, parse_listing, HtmlPortalDriver, ListingPage, ListingRow};
pub use profiles::{profile_for, Capability, DetailSelectors, ListingSelectors, PortalProfile};
pub use source::{looks_like_challenge, FixturePageSource, HttpPageSource, Page, PageSource};

pub const CRATE_NAME: &str = "bidscout-drivers";

/// One listing entry point; multi-agency portals have one per city.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingTarget {
    pub city: Option<String>,
    pub listing_url: String,
}

#[derive(Debug, Clone)]
pub struct DriverContext {
    pub run_id: Uuid,
    pub cutoff: Cutoff,
    /// Year assumed for dates published without one.
    pub reference_year: i32,
    pub targets: Vec<ListingTarget>,
    pub max_listing_pages: usize,
    /// Detail fetch pool size for portals without session affinity.
    pub detail_workers: usize,
}

impl DriverContext {
    pub fn new(run_id: Uuid, cutoff: Cutoff, reference_year: i32, targets: Vec<ListingTarget>) -> Self {
        Self {
            run_id,
            cutoff,
            reference_year,
            targets,
            max_listing_pages: 50,
            detail_workers: 4,
        }
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{url}: {message}")]
    Page {
        url: String,
        kind: ErrorKind,
        message: String,
    },
    #[error("unexpected page structure at {url}: {reason}")]
    Parse { url: String, reason: String },
    #[error("authentication required: {reason}")]
    AuthenticationRequired { reason: String },
    #[error("manual intervention required at {url}")]
    NeedsIntervention { url: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DriverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriverError::Fetch(err) => err.kind(),
            DriverError::Page { kind, .. } => *kind,
            DriverError::Parse { .. } | DriverError::Other(_) => ErrorKind::UnrecoverableParse,
            DriverError::AuthenticationRequired { .. } => ErrorKind::AuthenticationRequired,
            DriverError::NeedsIntervention { .. } => ErrorKind::InterventionTimeout,
        }
    }

    /// Errors that end the owning portal's scrape instead of a single item.
    pub fn is_portal_fatal(&self) -> bool {
        matches!(self, DriverError::NeedsIntervention { .. })
            || self.kind() == ErrorKind::AuthenticationRequired
    }
}

/// What a targeted re-fetch of one failed page produced.
#[derive(Debug, Clone, Default)]
pub struct RefetchOutcome {
    pub records: Vec<BidRecord>,
    /// New failures found while re-walking a listing page.
    pub discovered: Vec<FailedPage>,
}

#[async_trait]
pub trait PortalDriver: Send + Sync {
    fn portal_id(&self) -> &'static str;
    fn profile(&self) -> &'static PortalProfile;

    /// Push records and failed pages into `out` as they are produced, so anything
    /// collected before a fatal error stays with the result.
    async fn scrape(&self, ctx: &DriverContext, out: &mut ScrapeResult) -> Result<(), DriverError>;

    /// Re-fetch a single failed page.
    async fn refetch(&self, ctx: &DriverContext, page: &FailedPage) -> Result<RefetchOutcome, DriverError>;
}

pub fn driver_for_portal(portal_id: &str, pages: Arc<dyn PageSource>) -> Option<Box<dyn PortalDriver>> {
    let profile = profile_for(portal_id)?;
    Some(Box::new(HtmlPortalDriver::new(profile, pages)))
}
