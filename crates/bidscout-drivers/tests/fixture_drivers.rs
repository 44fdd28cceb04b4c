use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bidscout_core::{Cutoff, ErrorKind, PageKind, ScrapeResult};
use bidscout_drivers::{
    driver_for_portal, DriverContext, DriverError, FixturePageSource, ListingTarget, Page,
    PageSource,
};
use chrono::{NaiveDate, Utc};
use uuid::Uuid;

fn fixtures_root() -> PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .canonicalize()
        .expect("fixtures root")
}

/// Fixture source that remembers every URL asked for.
struct RecordingPages {
    inner: FixturePageSource,
    fetched: Mutex<Vec<String>>,
}

impl RecordingPages {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: FixturePageSource::new(fixtures_root()),
            fetched: Mutex::new(Vec::new()),
        })
    }

    fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageSource for RecordingPages {
    async fn fetch(&self, portal_id: &str, url: &str) -> Result<Page, DriverError> {
        self.fetched.lock().unwrap().push(url.to_string());
        self.inner.fetch(portal_id, url).await
    }
}

/// In-memory pages; a `None` body stands for a bot-check page.
struct StaticPages {
    pages: HashMap<String, Option<String>>,
}

impl StaticPages {
    fn new(pages: &[(&str, Option<&str>)]) -> Arc<Self> {
        Arc::new(Self {
            pages: pages
                .iter()
                .map(|(url, body)| (url.to_string(), body.map(ToString::to_string)))
                .collect(),
        })
    }
}

#[async_trait]
impl PageSource for StaticPages {
    async fn fetch(&self, _portal_id: &str, url: &str) -> Result<Page, DriverError> {
        match self.pages.get(url) {
            Some(Some(body)) => Ok(Page {
                url: url.to_string(),
                body: body.clone(),
                fetched_at: Utc::now(),
            }),
            Some(None) => Err(DriverError::NeedsIntervention {
                url: url.to_string(),
            }),
            None => Err(DriverError::Page {
                url: url.to_string(),
                kind: ErrorKind::TransientNetwork,
                message: "connection reset".into(),
            }),
        }
    }
}

fn cutoff() -> Cutoff {
    Cutoff::on(NaiveDate::from_ymd_opt(2025, 6, 1).unwrap())
}

fn target(city: Option<&str>, url: &str) -> ListingTarget {
    ListingTarget {
        city: city.map(ToString::to_string),
        listing_url: url.to_string(),
    }
}

const BURBANK: &str = "https://vendors.planetbids.com/portal/14210/bo/bo-search";
const DOWNEY: &str = "https://vendors.planetbids.com/portal/24661/bo/bo-search";

#[tokio::test]
async fn planetbids_stops_paging_at_first_bid_older_than_cutoff() {
    let pages = RecordingPages::new();
    let driver = driver_for_portal("planetbids", pages.clone()).expect("planetbids registered");
    let ctx = DriverContext::new(
        Uuid::new_v4(),
        cutoff(),
        2025,
        vec![target(Some("Burbank"), BURBANK), target(Some("Downey"), DOWNEY)],
    );
    let mut out = ScrapeResult::new("planetbids", "PlanetBids", true);

    driver.scrape(&ctx, &mut out).await.expect("scrape completes");

    let fetched = pages.fetched();
    assert!(!fetched.iter().any(|u| u.ends_with("bo-search?page=2")), "{fetched:?}");
    assert!(!fetched.iter().any(|u| u.ends_with("bo-detail/103")), "{fetched:?}");
    assert!(out.early_terminated);
    assert_eq!(out.listing_pages_fetched, 1);
    assert_eq!(out.excluded_by_cutoff, 1);

    assert_eq!(out.records.len(), 1);
    let record = &out.records[0];
    assert_eq!(record.title, "Olive Avenue Sidewalk Repair");
    assert_eq!(record.agency.as_deref(), Some("Burbank"));
    assert_eq!(record.posted_on, NaiveDate::from_ymd_opt(2025, 6, 5));
    assert_eq!(record.due_on, NaiveDate::from_ymd_opt(2025, 7, 10));
    assert_eq!(record.contact.email.as_deref(), Some("purchasing@burbankca.gov"));
    assert_eq!(out.cities.get("Burbank"), Some(&1));

    assert_eq!(out.failed_pages.len(), 2);
    let detail = out
        .failed_pages
        .iter()
        .find(|p| p.kind == PageKind::Detail)
        .expect("detail failure recorded");
    assert!(detail.url.ends_with("bo-detail/102"));
    assert_eq!(detail.error_kind, ErrorKind::TransientNetwork);
    assert_eq!(detail.city.as_deref(), Some("Burbank"));
    assert_eq!(detail.posted_hint.as_deref(), Some("06/02/2025"));

    let listing = out
        .failed_pages
        .iter()
        .find(|p| p.kind == PageKind::Listing)
        .expect("failed city listing recorded");
    assert_eq!(listing.url, DOWNEY);
    assert_eq!(listing.scope(), "planetbids/Downey");
}

#[tokio::test]
async fn refetch_reports_the_same_failure_again() {
    let pages = RecordingPages::new();
    let driver = driver_for_portal("planetbids", pages.clone()).unwrap();
    let ctx = DriverContext::new(Uuid::new_v4(), cutoff(), 2025, vec![target(Some("Burbank"), BURBANK)]);
    let mut out = ScrapeResult::new("planetbids", "PlanetBids", true);
    driver.scrape(&ctx, &mut out).await.unwrap();

    let failed = out.failed_pages[0].clone();
    let err = driver.refetch(&ctx, &failed).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransientNetwork);
}

#[tokio::test]
async fn refetching_a_listing_rewalks_its_rows() {
    let pages = RecordingPages::new();
    let driver = driver_for_portal("planetbids", pages.clone()).unwrap();
    let ctx = DriverContext::new(Uuid::new_v4(), cutoff(), 2025, Vec::new());
    let failed_listing = bidscout_core::FailedPage::new(
        "planetbids",
        BURBANK,
        PageKind::Listing,
        ErrorKind::RenderTimeout,
        "timed out",
    )
    .with_city(Some("Burbank".into()));

    let outcome = driver.refetch(&ctx, &failed_listing).await.expect("listing recovers");
    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.discovered.len(), 1);
    assert!(outcome.discovered[0].url.ends_with("bo-detail/102"));
}

#[tokio::test]
async fn unordered_single_city_listing_keeps_undated_rows() {
    let pages = RecordingPages::new();
    let driver = driver_for_portal("compton", pages).unwrap();
    let ctx = DriverContext::new(
        Uuid::new_v4(),
        cutoff(),
        2025,
        vec![target(
            Some("Compton"),
            "https://www.comptoncity.org/departments/city-clerk/rfps-and-bids",
        )],
    );
    let mut out = ScrapeResult::new("compton", "City of Compton", false);
    driver.scrape(&ctx, &mut out).await.unwrap();

    assert!(!out.early_terminated);
    assert_eq!(out.excluded_by_cutoff, 1);
    let titles: Vec<_> = out.records.iter().map(|r| r.title.as_str()).collect();
    assert_eq!(
        titles,
        vec![
            "IFB 25-019 Traffic Signal Upgrades",
            "RFQ On-Call Engineering Services",
            "RFP 25-021 Janitorial Services",
        ]
    );
    assert!(out.records[1].is_low_confidence());
    assert!(out
        .records
        .iter()
        .filter_map(|r| r.posted_on)
        .all(|d| d >= cutoff().date()));
    assert!(out.cities.is_empty());
}

#[tokio::test]
async fn sign_in_redirect_is_authentication_required() {
    let pages = RecordingPages::new();
    let driver = driver_for_portal("bidnet", pages).unwrap();
    let ctx = DriverContext::new(
        Uuid::new_v4(),
        cutoff(),
        2025,
        vec![target(
            Some("Santa Clarita"),
            "https://www.bidnetdirect.com/california/cityofsantaclarita",
        )],
    );
    let mut out = ScrapeResult::new("bidnet", "BidNet Direct", false);
    let err = driver.scrape(&ctx, &mut out).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthenticationRequired);
    assert!(err.is_portal_fatal());
}

#[tokio::test]
async fn bot_check_page_asks_for_intervention() {
    let pages = RecordingPages::new();
    let driver = driver_for_portal("artesia", pages).unwrap();
    let ctx = DriverContext::new(
        Uuid::new_v4(),
        cutoff(),
        2025,
        vec![target(Some("Artesia"), "https://www.cityofartesia.us/Bids.aspx")],
    );
    let mut out = ScrapeResult::new("artesia", "City of Artesia", false);
    let err = driver.scrape(&ctx, &mut out).await.unwrap_err();
    assert!(matches!(err, DriverError::NeedsIntervention { .. }));
    assert!(out.records.is_empty());
    assert!(out.failed_pages.is_empty());
}

const PB_LISTING: &str = r#"
<table class="pb-datatable"><tbody>
  <tr>
    <td class="stage-posted">TBD</td>
    <td class="title"><a href="/portal/14210/bo/bo-detail/301">Library Roof Replacement</a></td>
  </tr>
  <tr>
    <td class="stage-posted">TBD</td>
    <td class="title"><a href="/portal/14210/bo/bo-detail/302">Park Restroom Renovation</a></td>
  </tr>
</tbody></table>"#;

fn pb_detail(title: &str, posted: &str) -> String {
    format!(r#"<h1 class="bid-title">{title}</h1><p>Posted <span class="bid-posted">{posted}</span></p>"#)
}

#[tokio::test]
async fn detail_page_date_is_held_to_the_cutoff() {
    let old = pb_detail("Library Roof Replacement", "01/01/2020");
    let fresh = pb_detail("Park Restroom Renovation", "06/08/2025");
    let pages = StaticPages::new(&[
        (BURBANK, Some(PB_LISTING)),
        ("https://vendors.planetbids.com/portal/14210/bo/bo-detail/301", Some(old.as_str())),
        ("https://vendors.planetbids.com/portal/14210/bo/bo-detail/302", Some(fresh.as_str())),
    ]);
    let driver = driver_for_portal("planetbids", pages).unwrap();
    let ctx = DriverContext::new(Uuid::new_v4(), cutoff(), 2025, vec![target(Some("Burbank"), BURBANK)]);
    let mut out = ScrapeResult::new("planetbids", "PlanetBids", true);
    driver.scrape(&ctx, &mut out).await.unwrap();

    assert_eq!(out.excluded_by_cutoff, 1);
    assert_eq!(out.records.len(), 1);
    let record = &out.records[0];
    assert_eq!(record.title, "Park Restroom Renovation");
    assert_eq!(record.posted_on, NaiveDate::from_ymd_opt(2025, 6, 8));
    assert!(!record.is_low_confidence());
    assert!(out.failed_pages.is_empty());
}

#[tokio::test]
async fn pooled_detail_fetches_keep_finished_records_when_one_needs_intervention() {
    let listing = r#"
        <div class="project-list-item"><a class="project-title" href="/portal/la/projects/1">Citywide Tree Trimming</a><span class="release-date">06/05/2025</span></div>
        <div class="project-list-item"><a class="project-title" href="/portal/la/projects/2">HVAC Maintenance</a><span class="release-date">06/06/2025</span></div>
        <div class="project-list-item"><a class="project-title" href="/portal/la/projects/3">Pool Resurfacing</a><span class="release-date">06/07/2025</span></div>"#;
    let pages = StaticPages::new(&[
        ("https://procurement.opengov.com/portal/la", Some(listing)),
        (
            "https://procurement.opengov.com/portal/la/projects/1",
            Some(r#"<h1 class="project-title">Citywide Tree Trimming</h1>"#),
        ),
        ("https://procurement.opengov.com/portal/la/projects/2", None),
        (
            "https://procurement.opengov.com/portal/la/projects/3",
            Some(r#"<h1 class="project-title">Pool Resurfacing</h1>"#),
        ),
    ]);
    let driver = driver_for_portal("opengov", pages).unwrap();
    assert!(!driver.profile().session_affinity);
    let ctx = DriverContext::new(
        Uuid::new_v4(),
        cutoff(),
        2025,
        vec![target(Some("La Verne"), "https://procurement.opengov.com/portal/la")],
    );
    assert!(ctx.detail_workers > 1);
    let mut out = ScrapeResult::new("opengov", "OpenGov Procurement", true);

    let err = driver.scrape(&ctx, &mut out).await.unwrap_err();
    assert!(matches!(err, DriverError::NeedsIntervention { ref url } if url.ends_with("/projects/2")));
    let mut titles: Vec<_> = out.records.iter().map(|r| r.title.as_str()).collect();
    titles.sort();
    assert_eq!(titles, vec!["Citywide Tree Trimming", "Pool Resurfacing"]);
    assert_eq!(out.cities.get("La Verne"), Some(&2));
}
