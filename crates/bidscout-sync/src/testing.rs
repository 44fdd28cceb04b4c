//! Scripted drivers and stores shared by the unit tests in this crate.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use bidscout_core::{BidRecord, ErrorKind, FailedPage, ListingOrder, ScrapeResult};
use bidscout_drivers::{
    Capability, DriverContext, DriverError, ListingSelectors, PortalDriver, PortalProfile, RefetchOutcome,
};
use bidscout_storage::{RecordStore, StoreError, StoreRecord};
use chrono::{NaiveDate, TimeZone, Utc};

pub static SCRIPTED_PROFILE: PortalProfile = PortalProfile {
    portal_id: "scripted",
    display_name: "Scripted",
    capability: Capability::SingleAgency,
    order: ListingOrder::Unordered,
    session_affinity: false,
    login_marker: None,
    listing: ListingSelectors {
        row: "tr",
        title: "td",
        link: "a",
        posted: None,
        due: None,
        agency: None,
        next_page: None,
    },
    detail: None,
};

/// Record posted 2025-06-05 at `https://<portal>/<slug>`.
pub fn bid(portal: &str, slug: &str) -> BidRecord {
    let fetched_at = Utc.with_ymd_and_hms(2025, 6, 10, 8, 0, 0).single().unwrap();
    let mut record = BidRecord::new(portal, format!("Bid {slug}"), format!("https://{portal}/{slug}"), fetched_at);
    record.posted_on = NaiveDate::from_ymd_opt(2025, 6, 5);
    record
}

pub fn failed(portal: &str, slug: &str, kind: ErrorKind) -> FailedPage {
    FailedPage::new(
        portal,
        format!("https://{portal}/{slug}"),
        bidscout_core::PageKind::Detail,
        kind,
        "scripted failure",
    )
}

pub enum ScriptStep {
    Yield(Vec<BidRecord>),
    FailPage(FailedPage),
    Fail(DriverError),
}

pub struct ScriptedDriver {
    portal_id: &'static str,
    runs: Mutex<VecDeque<Vec<ScriptStep>>>,
    refetches: Mutex<HashMap<String, VecDeque<Result<RefetchOutcome, DriverError>>>>,
    refetched: Mutex<Vec<String>>,
}

impl ScriptedDriver {
    pub fn new(portal_id: &'static str, steps: Vec<ScriptStep>) -> Self {
        Self {
            portal_id,
            runs: Mutex::new(VecDeque::from([steps])),
            refetches: Mutex::new(HashMap::new()),
            refetched: Mutex::new(Vec::new()),
        }
    }

    /// Steps for the next `scrape` call, used after an intervention resume.
    pub fn then_on_rerun(self, steps: Vec<ScriptStep>) -> Self {
        self.runs.lock().unwrap().push_back(steps);
        self
    }

    /// Queue one refetch reply for `url`; unscripted URLs fail with a transient error.
    pub fn on_refetch(self, url: &str, reply: Result<RefetchOutcome, DriverError>) -> Self {
        self.refetches
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub fn refetched(&self) -> Vec<String> {
        self.refetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl PortalDriver for ScriptedDriver {
    fn portal_id(&self) -> &'static str {
        self.portal_id
    }

    fn profile(&self) -> &'static PortalProfile {
        &SCRIPTED_PROFILE
    }

    async fn scrape(&self, _ctx: &DriverContext, out: &mut ScrapeResult) -> Result<(), DriverError> {
        let steps = self.runs.lock().unwrap().pop_front().unwrap_or_default();
        for step in steps {
            match step {
                ScriptStep::Yield(records) => records.into_iter().for_each(|r| out.push_record(r)),
                ScriptStep::FailPage(page) => out.failed_pages.push(page),
                ScriptStep::Fail(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn refetch(&self, _ctx: &DriverContext, page: &FailedPage) -> Result<RefetchOutcome, DriverError> {
        self.refetched.lock().unwrap().push(page.url.clone());
        let reply = self
            .refetches
            .lock()
            .unwrap()
            .get_mut(&page.url)
            .and_then(VecDeque::pop_front);
        reply.unwrap_or_else(|| {
            Err(DriverError::Page {
                url: page.url.clone(),
                kind: ErrorKind::TransientNetwork,
                message: "503 Service Unavailable".into(),
            })
        })
    }
}

pub enum StoreReply {
    Ack,
    AckOnly(usize),
    Fail(StoreError),
}

/// Acknowledges every batch unless a reply is queued for that call.
#[derive(Default)]
pub struct ScriptedStore {
    replies: Mutex<VecDeque<StoreReply>>,
    calls: Mutex<Vec<StoreRecord>>,
    batch_sizes: Mutex<Vec<usize>>,
}

impl ScriptedStore {
    pub fn with_replies(replies: Vec<StoreReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Default::default()
        }
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }

    pub fn submitted(&self) -> Vec<StoreRecord> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordStore for ScriptedStore {
    async fn create_records(&self, batch: &[StoreRecord]) -> Result<usize, StoreError> {
        self.batch_sizes.lock().unwrap().push(batch.len());
        let reply = self.replies.lock().unwrap().pop_front().unwrap_or(StoreReply::Ack);
        match reply {
            StoreReply::Ack => {
                self.calls.lock().unwrap().extend(batch.iter().cloned());
                Ok(batch.len())
            }
            StoreReply::AckOnly(n) => {
                self.calls.lock().unwrap().extend(batch.iter().take(n).cloned());
                Ok(n)
            }
            StoreReply::Fail(err) => Err(err),
        }
    }
}
