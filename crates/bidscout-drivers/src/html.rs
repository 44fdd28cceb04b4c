//! Selector-driven listing/detail engine shared by every registered portal.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bidscout_core::{
    filter, parse_posting_date, BidRecord, Contact, DateConfidence, Dated, FailedPage, PageKind,
    ScrapeResult,
};
use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, warn};

use crate::profiles::{DetailSelectors, PortalProfile};
use crate::source::{Page, PageSource};
use crate::{DriverContext, DriverError, ListingTarget, PortalDriver, RefetchOutcome};

/// One candidate row from a listing page, before its detail page is fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingRow {
    pub title: String,
    pub detail_url: String,
    pub agency: Option<String>,
    pub posted_raw: Option<String>,
    pub posted_on: Option<NaiveDate>,
    pub due_raw: Option<String>,
    pub low_confidence: bool,
}

impl Dated for ListingRow {
    fn posted_on(&self) -> Option<NaiveDate> {
        self.posted_on
    }

    fn mark_low_confidence(&mut self) {
        self.low_confidence = true;
    }
}

impl ListingRow {
    /// Rebuild what the listing told us about a failed detail page.
    pub fn from_failed(page: &FailedPage, reference_year: i32) -> Self {
        let posted_on = page
            .posted_hint
            .as_deref()
            .and_then(|raw| parse_posting_date(raw, reference_year));
        Self {
            title: String::new(),
            detail_url: page.url.clone(),
            agency: page.city.clone(),
            posted_raw: page.posted_hint.clone(),
            posted_on,
            due_raw: None,
            low_confidence: posted_on.is_none(),
        }
    }

    pub fn into_record(self, portal_id: &str, fetched_at: DateTime<Utc>, reference_year: i32) -> BidRecord {
        let mut record = BidRecord::new(portal_id, self.title, self.detail_url, fetched_at);
        record.agency = self.agency;
        record.posted_on = self.posted_on;
        record.posted_raw = self.posted_raw;
        record.due_on = self
            .due_raw
            .as_deref()
            .and_then(|raw| parse_posting_date(raw, reference_year));
        record.due_raw = self.due_raw;
        if self.low_confidence || record.posted_on.is_none() {
            record.date_confidence = DateConfidence::Low;
        }
        record
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListingPage {
    pub rows: Vec<ListingRow>,
    pub next_url: Option<String>,
}

fn selector(url: &str, css: &str) -> Result<Selector, DriverError> {
    Selector::parse(css).map_err(|e| DriverError::Parse {
        url: url.to_string(),
        reason: format!("bad selector {css}: {e}"),
    })
}

fn clean_text(raw: &str) -> Option<String> {
    let joined = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| clean_text(&n.text().collect::<String>()))
}

fn doc_text(document: &Html, sel: &Selector) -> Option<String> {
    first_text(document.root_element(), sel)
}

fn resolve(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    url::Url::parse(base)
        .and_then(|b| b.join(href))
        .or_else(|_| url::Url::parse(href))
        .ok()
        .map(|u| u.to_string())
}

/// Extract candidate rows and the next-page link. Rows without a title or link are skipped;
/// they carry no URL to report as failed.
pub fn parse_listing(
    profile: &PortalProfile,
    page: &Page,
    city: Option<&str>,
    reference_year: i32,
) -> Result<ListingPage, DriverError> {
    let s = profile.listing;
    let row_sel = selector(&page.url, s.row)?;
    let title_sel = selector(&page.url, s.title)?;
    let link_sel = selector(&page.url, s.link)?;
    let posted_sel = s.posted.map(|css| selector(&page.url, css)).transpose()?;
    let due_sel = s.due.map(|css| selector(&page.url, css)).transpose()?;
    let agency_sel = s.agency.map(|css| selector(&page.url, css)).transpose()?;
    let next_sel = s.next_page.map(|css| selector(&page.url, css)).transpose()?;

    let document = Html::parse_document(&page.body);
    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for el in document.select(&row_sel) {
        let title = first_text(el, &title_sel);
        let href = el
            .select(&link_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| resolve(&page.url, href));
        let (Some(title), Some(detail_url)) = (title, href) else {
            skipped += 1;
            continue;
        };
        let posted_raw = posted_sel.as_ref().and_then(|sel| first_text(el, sel));
        let posted_on = posted_raw
            .as_deref()
            .and_then(|raw| parse_posting_date(raw, reference_year));
        let agency = agency_sel
            .as_ref()
            .and_then(|sel| first_text(el, sel))
            .or_else(|| city.map(ToString::to_string));
        rows.push(ListingRow {
            title,
            detail_url,
            agency,
            posted_raw,
            posted_on,
            due_raw: due_sel.as_ref().and_then(|sel| first_text(el, sel)),
            low_confidence: false,
        });
    }
    if skipped > 0 {
        debug!(portal_id = profile.portal_id, url = %page.url, skipped, "listing rows without title or link");
    }

    let next_url = next_sel.as_ref().and_then(|sel| {
        document
            .select(sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| resolve(&page.url, href))
            .filter(|next| next != &page.url)
    });

    Ok(ListingPage { rows, next_url })
}

/// Build the full record from a detail page, falling back to the listing row.
pub fn parse_detail(
    portal_id: &str,
    selectors: &DetailSelectors,
    page: &Page,
    row: &ListingRow,
    reference_year: i32,
) -> Result<BidRecord, DriverError> {
    let url = page.url.as_str();
    let title_sel = selector(url, selectors.title)?;
    let optional = |css: Option<&'static str>| css.map(|c| selector(url, c)).transpose();
    let description_sel = optional(selectors.description)?;
    let posted_sel = optional(selectors.posted)?;
    let due_sel = optional(selectors.due)?;
    let name_sel = optional(selectors.contact_name)?;
    let email_sel = optional(selectors.contact_email)?;
    let phone_sel = optional(selectors.contact_phone)?;

    let document = Html::parse_document(&page.body);
    let title = doc_text(&document, &title_sel)
        .or_else(|| clean_text(&row.title))
        .ok_or_else(|| DriverError::Parse {
            url: url.to_string(),
            reason: format!("no element matched {}", selectors.title),
        })?;

    let mut row = row.clone();
    row.title = title;
    if row.posted_on.is_none() {
        if let Some(raw) = posted_sel.as_ref().and_then(|sel| doc_text(&document, sel)) {
            row.posted_on = parse_posting_date(&raw, reference_year);
            row.posted_raw = Some(raw);
            row.low_confidence = row.posted_on.is_none();
        }
    }
    if let Some(raw) = due_sel.as_ref().and_then(|sel| doc_text(&document, sel)) {
        row.due_raw = Some(raw);
    }

    let description = description_sel.as_ref().and_then(|sel| doc_text(&document, sel));
    let email = email_sel.as_ref().and_then(|sel| {
        document.select(sel).next().and_then(|a| {
            a.value()
                .attr("href")
                .map(|h| h.trim_start_matches("mailto:").trim().to_string())
                .filter(|h| !h.is_empty())
                .or_else(|| clean_text(&a.text().collect::<String>()))
        })
    });
    let contact = Contact {
        name: name_sel.as_ref().and_then(|sel| doc_text(&document, sel)),
        email,
        phone: phone_sel.as_ref().and_then(|sel| doc_text(&document, sel)),
    };

    let mut record = row.into_record(portal_id, page.fetched_at, reference_year);
    record.description = description;
    record.contact = contact;
    Ok(record)
}

/// Generic driver: paginates listings, applies the run cutoff, then visits detail pages.
#[derive(Clone)]
pub struct HtmlPortalDriver {
    profile: &'static PortalProfile,
    pages: Arc<dyn PageSource>,
}

impl std::fmt::Debug for HtmlPortalDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HtmlPortalDriver")
            .field("portal_id", &self.profile.portal_id)
            .finish()
    }
}

impl HtmlPortalDriver {
    pub fn new(profile: &'static PortalProfile, pages: Arc<dyn PageSource>) -> Self {
        Self { profile, pages }
    }

    fn check_login(&self, page: &Page) -> Result<(), DriverError> {
        match self.profile.login_marker {
            Some(marker) if page.url.contains(marker) || page.body.contains(marker) => {
                Err(DriverError::AuthenticationRequired {
                    reason: format!("{} redirected to sign-in at {}", self.profile.portal_id, page.url),
                })
            }
            _ => Ok(()),
        }
    }

    fn listing_failure(&self, target: &ListingTarget, url: &str, err: &DriverError) -> FailedPage {
        warn!(
            portal_id = self.profile.portal_id,
            city = target.city.as_deref().unwrap_or("-"),
            url,
            error_kind = %err.kind(),
            "listing page failed"
        );
        FailedPage::new(
            self.profile.portal_id,
            url,
            PageKind::Listing,
            err.kind(),
            err.to_string(),
        )
        .with_city(target.city.clone())
    }

    async fn scrape_target(
        &self,
        ctx: &DriverContext,
        target: &ListingTarget,
        out: &mut ScrapeResult,
    ) -> Result<(), DriverError> {
        let portal_id = self.profile.portal_id;
        let before = out.records.len();
        let mut next = Some(target.listing_url.clone());
        let mut pages = 0usize;

        while let Some(url) = next.take() {
            if pages >= ctx.max_listing_pages {
                debug!(portal_id, url = %url, "listing page limit reached");
                break;
            }
            if out.failed_pages.iter().any(|p| p.url == url) {
                break;
            }

            let page = match self.pages.fetch(portal_id, &url).await {
                Ok(page) => page,
                Err(err) if err.is_portal_fatal() => return Err(err),
                Err(err) => {
                    let failed = self.listing_failure(target, &url, &err);
                    out.failed_pages.push(failed);
                    break;
                }
            };
            pages += 1;
            out.listing_pages_fetched += 1;
            self.check_login(&page)?;

            let listing = match parse_listing(self.profile, &page, target.city.as_deref(), ctx.reference_year) {
                Ok(listing) => listing,
                Err(err) => {
                    let failed = self.listing_failure(target, &url, &err);
                    out.failed_pages.push(failed);
                    break;
                }
            };

            let outcome = filter(listing.rows, &ctx.cutoff, self.profile.order);
            out.excluded_by_cutoff += outcome.excluded;
            self.collect_details(ctx, target, outcome.kept, out).await?;

            if outcome.early_terminate {
                out.early_terminated = true;
                debug!(portal_id, url = %url, "older than cutoff in sorted listing; stopping pagination");
                break;
            }
            next = listing.next_url;
        }

        info!(
            portal_id,
            city = target.city.as_deref().unwrap_or("-"),
            records = out.records.len() - before,
            listing_pages = pages,
            "target scraped"
        );
        Ok(())
    }

    async fn collect_details(
        &self,
        ctx: &DriverContext,
        target: &ListingTarget,
        rows: Vec<ListingRow>,
        out: &mut ScrapeResult,
    ) -> Result<(), DriverError> {
        let mut seen = HashSet::new();
        let rows: Vec<ListingRow> = rows
            .into_iter()
            .filter(|r| !out.has_detail(&r.detail_url) && seen.insert(r.detail_url.clone()))
            .collect();

        let Some(detail) = self.profile.detail else {
            let fetched_at = Utc::now();
            for row in rows {
                out.push_record(row.into_record(self.profile.portal_id, fetched_at, ctx.reference_year));
            }
            return Ok(());
        };

        if self.profile.session_affinity || ctx.detail_workers <= 1 {
            for row in rows {
                let result = self.fetch_detail(ctx, &detail, &row).await;
                self.absorb_detail(ctx, target, row, result, out)?;
            }
            return Ok(());
        }

        let results: Vec<(ListingRow, Result<BidRecord, DriverError>)> = stream::iter(rows)
            .map(|row| async move {
                let result = self.fetch_detail(ctx, &detail, &row).await;
                (row, result)
            })
            .buffer_unordered(ctx.detail_workers)
            .collect()
            .await;

        let mut fatal = None;
        for (row, result) in results {
            if let Err(err) = self.absorb_detail(ctx, target, row, result, out) {
                fatal.get_or_insert(err);
            }
        }
        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn fetch_detail(
        &self,
        ctx: &DriverContext,
        selectors: &DetailSelectors,
        row: &ListingRow,
    ) -> Result<BidRecord, DriverError> {
        let page = self.pages.fetch(self.profile.portal_id, &row.detail_url).await?;
        self.check_login(&page)?;
        parse_detail(self.profile.portal_id, selectors, &page, row, ctx.reference_year)
    }

    /// Per-item failures become FailedPages; portal-fatal ones propagate. A date first
    /// seen on the detail page is held to the run cutoff like a listing date.
    fn absorb_detail(
        &self,
        ctx: &DriverContext,
        target: &ListingTarget,
        row: ListingRow,
        result: Result<BidRecord, DriverError>,
        out: &mut ScrapeResult,
    ) -> Result<(), DriverError> {
        match result {
            Ok(record) => {
                match record.posted_on {
                    Some(posted) if !ctx.cutoff.admits(posted) => {
                        debug!(
                            portal_id = self.profile.portal_id,
                            url = %record.detail_url,
                            %posted,
                            "detail page dated before cutoff"
                        );
                        out.excluded_by_cutoff += 1;
                    }
                    _ => out.push_record(record),
                }
                Ok(())
            }
            Err(err @ DriverError::NeedsIntervention { .. }) => Err(err),
            Err(err) => {
                warn!(
                    portal_id = self.profile.portal_id,
                    city = target.city.as_deref().unwrap_or("-"),
                    url = %row.detail_url,
                    error_kind = %err.kind(),
                    "detail page failed"
                );
                out.failed_pages.push(
                    FailedPage::new(
                        self.profile.portal_id,
                        &row.detail_url,
                        PageKind::Detail,
                        err.kind(),
                        err.to_string(),
                    )
                    .with_city(target.city.clone().or(row.agency.clone()))
                    .with_posted_hint(row.posted_raw.clone()),
                );
                if err.is_portal_fatal() {
                    Err(err)
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[async_trait]
impl PortalDriver for HtmlPortalDriver {
    fn portal_id(&self) -> &'static str {
        self.profile.portal_id
    }

    fn profile(&self) -> &'static PortalProfile {
        self.profile
    }

    async fn scrape(&self, ctx: &DriverContext, out: &mut ScrapeResult) -> Result<(), DriverError> {
        for target in &ctx.targets {
            self.scrape_target(ctx, target, out).await?;
        }
        Ok(())
    }

    async fn refetch(&self, ctx: &DriverContext, page: &FailedPage) -> Result<RefetchOutcome, DriverError> {
        match page.kind {
            PageKind::Detail => {
                let Some(selectors) = self.profile.detail else {
                    return Err(DriverError::Parse {
                        url: page.url.clone(),
                        reason: format!("{} has no detail pages", self.profile.portal_id),
                    });
                };
                let row = ListingRow::from_failed(page, ctx.reference_year);
                let record = self.fetch_detail(ctx, &selectors, &row).await?;
                Ok(RefetchOutcome {
                    records: vec![record],
                    discovered: Vec::new(),
                })
            }
            PageKind::Listing => {
                let target = ListingTarget {
                    city: page.city.clone(),
                    listing_url: page.url.clone(),
                };
                let mut scratch = ScrapeResult::new(
                    self.profile.portal_id,
                    self.profile.display_name,
                    self.profile.is_multi_agency(),
                );
                self.scrape_target(ctx, &target, &mut scratch).await?;
                if let Some(pos) = scratch.failed_pages.iter().position(|p| p.url == page.url) {
                    let again = scratch.failed_pages.remove(pos);
                    return Err(DriverError::Page {
                        url: again.url,
                        kind: again.error_kind,
                        message: again.last_error,
                    });
                }
                Ok(RefetchOutcome {
                    records: scratch.records,
                    discovered: scratch.failed_pages,
                })
            }
        }
    }
}
