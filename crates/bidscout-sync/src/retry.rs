//! Failed-page retry subsystem. Automatic, interactive and bulk retries all drive the same
//! per-page state machine through `RetryEngine::retry`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bidscout_core::{
    filter, BidRecord, ErrorKind, FailedPage, FailureRegistry, FailureState, ListingOrder,
};
use bidscout_drivers::{DriverContext, DriverError, PortalDriver, RefetchOutcome};
use bidscout_storage::BackoffPolicy;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Yes,
    No,
    /// Approve this group and every later one without asking again.
    All,
}

/// Operator confirmation for interactive retry, asked once per portal/city group.
#[async_trait]
pub trait RetryGate: Send + Sync {
    async fn confirm(&self, scope: &str, pages: &[FailedPage]) -> RetryDecision;
}

#[derive(Debug, Default)]
pub struct ApproveAll;

#[async_trait]
impl RetryGate for ApproveAll {
    async fn confirm(&self, _scope: &str, _pages: &[FailedPage]) -> RetryDecision {
        RetryDecision::All
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryOutcome {
    /// Recovered records that pass the run cutoff.
    pub recovered: Vec<BidRecord>,
    /// Pages that are not Recovered: PermanentlyFailed, or Pending when the operator declined.
    pub still_failed: Vec<FailedPage>,
    /// Pages that reached Recovered.
    pub resolved: Vec<FailedPage>,
    /// Recovered records dropped by the cutoff, per portal.
    pub excluded_by_cutoff: BTreeMap<String, usize>,
}

impl RetryOutcome {
    pub fn is_empty(&self) -> bool {
        self.recovered.is_empty() && self.still_failed.is_empty() && self.resolved.is_empty()
    }

    pub fn merge(&mut self, other: RetryOutcome) {
        self.recovered.extend(other.recovered);
        self.still_failed.extend(other.still_failed);
        self.resolved.extend(other.resolved);
        for (portal, n) in other.excluded_by_cutoff {
            *self.excluded_by_cutoff.entry(portal).or_default() += n;
        }
    }
}

#[derive(Default)]
struct HostOutcome {
    records: Vec<BidRecord>,
    resolved: Vec<FailedPage>,
    failed: Vec<FailedPage>,
    discovered: Vec<FailedPage>,
}

pub struct RetryEngine {
    drivers: HashMap<String, Arc<dyn PortalDriver>>,
    ctx: DriverContext,
    max_attempts: u32,
    backoff: BackoffPolicy,
    host_workers: usize,
}

impl RetryEngine {
    pub fn new(
        drivers: HashMap<String, Arc<dyn PortalDriver>>,
        ctx: DriverContext,
        max_attempts: u32,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            drivers,
            ctx,
            max_attempts: max_attempts.max(1),
            backoff,
            host_workers: 4,
        }
    }

    pub fn with_host_workers(mut self, workers: usize) -> Self {
        self.host_workers = workers.max(1);
        self
    }

    /// Retry every Pending page to a terminal state. Pages already terminal pass through.
    ///
    /// Pages on the same host are attempted one at a time; distinct hosts run concurrently.
    /// Failures discovered while re-walking a listing join a follow-up wave.
    pub async fn retry(&self, pages: Vec<FailedPage>) -> RetryOutcome {
        let mut outcome = RetryOutcome::default();
        let mut wave = Vec::new();
        for page in pages {
            match page.state {
                FailureState::Pending => wave.push(page),
                FailureState::Recovered => outcome.resolved.push(page),
                FailureState::InFlight | FailureState::PermanentlyFailed => outcome.still_failed.push(page),
            }
        }
        if wave.is_empty() {
            return outcome;
        }

        let mut seen: HashSet<String> = wave.iter().map(|p| p.url.clone()).collect();
        let mut recovered = Vec::new();
        while !wave.is_empty() {
            info!(pages = wave.len(), "retrying failed pages");
            let results: Vec<HostOutcome> = stream::iter(group_by_host(std::mem::take(&mut wave)))
                .map(|(host, pages)| self.retry_host(host, pages))
                .buffer_unordered(self.host_workers)
                .collect()
                .await;

            for result in results {
                recovered.extend(result.records);
                outcome.resolved.extend(result.resolved);
                outcome.still_failed.extend(result.failed);
                for page in result.discovered {
                    if seen.insert(page.url.clone()) {
                        wave.push(page);
                    }
                }
            }
        }

        let mut before: BTreeMap<String, usize> = BTreeMap::new();
        for record in &recovered {
            *before.entry(record.portal_id.clone()).or_default() += 1;
        }
        let filtered = filter(recovered, &self.ctx.cutoff, ListingOrder::Unordered);
        for record in &filtered.kept {
            if let Some(n) = before.get_mut(&record.portal_id) {
                *n -= 1;
            }
        }
        outcome.excluded_by_cutoff = before.into_iter().filter(|(_, n)| *n > 0).collect();
        outcome.recovered = filtered.kept;

        info!(
            recovered_pages = outcome.resolved.len(),
            recovered_records = outcome.recovered.len(),
            still_failed = outcome.still_failed.len(),
            "retry finished"
        );
        outcome
    }

    async fn retry_host(&self, host: String, pages: Vec<FailedPage>) -> HostOutcome {
        let mut out = HostOutcome::default();
        async {
            for page in pages {
                let (page, fetched) = self.retry_page(page).await;
                match fetched {
                    Some(result) => {
                        out.records.extend(result.records);
                        out.discovered.extend(result.discovered);
                        out.resolved.push(page);
                    }
                    None => out.failed.push(page),
                }
            }
        }
        .instrument(info_span!("retry_host", host = %host))
        .await;
        out
    }

    /// Drive one page until it is Recovered or PermanentlyFailed.
    async fn retry_page(&self, mut page: FailedPage) -> (FailedPage, Option<RefetchOutcome>) {
        let Some(driver) = self.drivers.get(&page.portal_id) else {
            warn!(portal_id = %page.portal_id, url = %page.url, "no driver for failed page");
            page.last_error = format!("no driver registered for {}", page.portal_id);
            give_up(&mut page);
            return (page, None);
        };
        if !page.error_kind.is_retryable() {
            debug!(url = %page.url, error_kind = %page.error_kind, "not retryable");
            give_up(&mut page);
            return (page, None);
        }

        loop {
            if let Err(err) = page.dispatch() {
                warn!(error = %err, "skipping page");
                return (page, None);
            }
            let span = info_span!(
                "retry_url",
                portal_id = %page.portal_id,
                url = %page.url,
                attempt = page.attempts
            );
            match driver.refetch(&self.ctx, &page).instrument(span).await {
                Ok(result) => {
                    if let Err(err) = page.mark_recovered() {
                        warn!(error = %err, "recovered page in unexpected state");
                    }
                    info!(url = %page.url, attempts = page.attempts, "recovered");
                    return (page, Some(result));
                }
                Err(err) => {
                    // Retry never waits on an operator.
                    let kind = if matches!(err, DriverError::NeedsIntervention { .. }) {
                        ErrorKind::TransientNetwork
                    } else {
                        err.kind()
                    };
                    match page.mark_failed(kind, err.to_string(), self.max_attempts) {
                        Ok(FailureState::Pending) => {
                            let delay = self.backoff.jittered_delay(page.attempts.saturating_sub(1) as usize);
                            debug!(url = %page.url, delay_ms = delay.as_millis() as u64, "backing off");
                            tokio::time::sleep(delay).await;
                        }
                        Ok(_) => {
                            warn!(
                                url = %page.url,
                                error_kind = %page.error_kind,
                                attempts = page.attempts,
                                "permanently failed"
                            );
                            return (page, None);
                        }
                        Err(err) => {
                            warn!(error = %err, "failed page in unexpected state");
                            return (page, None);
                        }
                    }
                }
            }
        }
    }

    /// Post-run retry of every Pending entry in the registry.
    pub async fn retry_automatic(&self, registry: &mut FailureRegistry) -> RetryOutcome {
        let outcome = self.retry(registry.checkout_pending()).await;
        registry.check_in(outcome.resolved.iter().cloned());
        registry.check_in(outcome.still_failed.iter().cloned());
        outcome
    }

    /// Ask once per portal/city group, then retry the approved groups.
    pub async fn retry_interactive(&self, registry: &mut FailureRegistry, gate: &dyn RetryGate) -> RetryOutcome {
        let mut groups: BTreeMap<String, Vec<FailedPage>> = BTreeMap::new();
        for page in registry.checkout_pending() {
            groups.entry(page.scope()).or_default().push(page);
        }

        let mut outcome = RetryOutcome::default();
        let mut approve_all = false;
        for (scope, pages) in groups {
            let decision = if approve_all {
                RetryDecision::Yes
            } else {
                gate.confirm(&scope, &pages).await
            };
            match decision {
                RetryDecision::No => {
                    info!(scope = %scope, pages = pages.len(), "retry declined");
                    outcome.still_failed.extend(pages);
                }
                RetryDecision::All => {
                    approve_all = true;
                    outcome.merge(self.retry(pages).await);
                }
                RetryDecision::Yes => outcome.merge(self.retry(pages).await),
            }
        }

        registry.check_in(outcome.resolved.iter().cloned());
        registry.check_in(outcome.still_failed.iter().cloned());
        outcome
    }

    /// Resubmit outstanding entries from an earlier run as fresh Pending pages.
    pub async fn retry_resubmitted(&self, previous: &[FailedPage]) -> RetryOutcome {
        let pages: Vec<FailedPage> = previous
            .iter()
            .filter(|p| p.is_outstanding())
            .map(FailedPage::resubmitted)
            .collect();
        self.retry(pages).await
    }
}

fn give_up(page: &mut FailedPage) {
    if let Err(err) = page.give_up() {
        warn!(error = %err, "could not give up on page");
    }
}

fn group_by_host(pages: Vec<FailedPage>) -> Vec<(String, Vec<FailedPage>)> {
    let mut groups: BTreeMap<String, Vec<FailedPage>> = BTreeMap::new();
    for page in pages {
        groups.entry(page.host()).or_default().push(page);
    }
    groups.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{bid, failed, ScriptedDriver};
    use bidscout_core::Cutoff;
    use chrono::NaiveDate;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn ctx() -> DriverContext {
        DriverContext::new(
            Uuid::new_v4(),
            Cutoff::on(NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()),
            2025,
            Vec::new(),
        )
    }

    fn engine(driver: Arc<ScriptedDriver>) -> RetryEngine {
        let mut drivers: HashMap<String, Arc<dyn PortalDriver>> = HashMap::new();
        drivers.insert(driver.portal_id().to_string(), driver);
        RetryEngine::new(drivers, ctx(), 3, BackoffPolicy::none())
    }

    fn recovered_with(records: Vec<BidRecord>) -> Result<RefetchOutcome, DriverError> {
        Ok(RefetchOutcome {
            records,
            discovered: Vec::new(),
        })
    }

    #[tokio::test]
    async fn empty_input_is_a_no_op() {
        let driver = Arc::new(ScriptedDriver::new("alpha", Vec::new()));
        let engine = engine(driver.clone());
        let outcome = engine.retry(Vec::new()).await;
        assert!(outcome.is_empty());
        assert!(driver.refetched().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_second_attempt() {
        let page = failed("alpha", "a7", ErrorKind::TransientNetwork);
        let driver = Arc::new(
            ScriptedDriver::new("alpha", Vec::new())
                .on_refetch(
                    &page.url,
                    Err(DriverError::Page {
                        url: page.url.clone(),
                        kind: ErrorKind::RenderTimeout,
                        message: "timed out".into(),
                    }),
                )
                .on_refetch(&page.url, recovered_with(vec![bid("alpha", "a7")])),
        );
        let outcome = engine(driver).retry(vec![page]).await;
        assert_eq!(outcome.recovered.len(), 1);
        assert_eq!(outcome.resolved.len(), 1);
        assert_eq!(outcome.resolved[0].state, FailureState::Recovered);
        assert_eq!(outcome.resolved[0].attempts, 2);
        assert!(outcome.still_failed.is_empty());
    }

    #[tokio::test]
    async fn exhausting_attempts_is_permanent() {
        let page = failed("alpha", "a8", ErrorKind::TransientNetwork);
        let driver = Arc::new(ScriptedDriver::new("alpha", Vec::new()));
        let engine = engine(driver.clone());
        let mut outcome = engine.retry(vec![page]).await;

        assert_eq!(driver.refetched().len(), 3);
        let page = outcome.still_failed.pop().unwrap();
        assert_eq!(page.state, FailureState::PermanentlyFailed);
        assert_eq!(page.attempts, 3);

        // A terminal page handed back in is never dispatched again.
        let again = engine.retry(vec![page]).await;
        assert_eq!(driver.refetched().len(), 3);
        assert_eq!(again.still_failed[0].state, FailureState::PermanentlyFailed);
    }

    #[tokio::test]
    async fn structural_failures_are_not_refetched() {
        let page = failed("alpha", "a9", ErrorKind::UnrecoverableParse);
        let driver = Arc::new(ScriptedDriver::new("alpha", Vec::new()));
        let outcome = engine(driver.clone()).retry(vec![page]).await;
        assert!(driver.refetched().is_empty());
        assert_eq!(outcome.still_failed[0].state, FailureState::PermanentlyFailed);
        assert_eq!(outcome.still_failed[0].attempts, 0);
    }

    #[tokio::test]
    async fn recovered_records_are_refiltered_against_cutoff() {
        let page = failed("alpha", "old", ErrorKind::TransientNetwork);
        let mut stale = bid("alpha", "old");
        stale.posted_on = NaiveDate::from_ymd_opt(2025, 5, 1);
        let driver = Arc::new(ScriptedDriver::new("alpha", Vec::new()).on_refetch(&page.url, recovered_with(vec![stale])));
        let outcome = engine(driver).retry(vec![page]).await;
        assert!(outcome.recovered.is_empty());
        assert_eq!(outcome.resolved.len(), 1);
        assert_eq!(outcome.excluded_by_cutoff.get("alpha"), Some(&1));
    }

    #[tokio::test]
    async fn discovered_pages_join_a_follow_up_wave() {
        let listing = failed("alpha", "listing", ErrorKind::TransientNetwork);
        let detail = failed("alpha", "d1", ErrorKind::TransientNetwork);
        let driver = Arc::new(
            ScriptedDriver::new("alpha", Vec::new())
                .on_refetch(
                    &listing.url,
                    Ok(RefetchOutcome {
                        records: vec![bid("alpha", "d0")],
                        discovered: vec![detail.clone()],
                    }),
                )
                .on_refetch(&detail.url, recovered_with(vec![bid("alpha", "d1")])),
        );
        let outcome = engine(driver.clone()).retry(vec![listing]).await;
        assert_eq!(outcome.recovered.len(), 2);
        assert_eq!(outcome.resolved.len(), 2);
        assert_eq!(driver.refetched(), vec![
            "https://alpha/listing".to_string(),
            "https://alpha/d1".to_string(),
        ]);
    }

    #[tokio::test]
    async fn automatic_retry_checks_entries_back_in() {
        let mut registry = FailureRegistry::new();
        registry.record(failed("alpha", "x", ErrorKind::TransientNetwork));
        registry.record(failed("alpha", "y", ErrorKind::AuthenticationRequired));
        let driver = Arc::new(
            ScriptedDriver::new("alpha", Vec::new()).on_refetch("https://alpha/x", recovered_with(vec![bid("alpha", "x")])),
        );
        let outcome = engine(driver).retry_automatic(&mut registry).await;
        assert_eq!(outcome.recovered.len(), 1);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.outstanding().len(), 1);
        assert!(registry.entries().iter().all(|p| p.is_terminal()));
    }

    struct Answers(Mutex<Vec<RetryDecision>>, Mutex<Vec<String>>);

    #[async_trait]
    impl RetryGate for Answers {
        async fn confirm(&self, scope: &str, _pages: &[FailedPage]) -> RetryDecision {
            self.1.lock().unwrap().push(scope.to_string());
            let answer = self.0.lock().unwrap().remove(0);
            answer
        }
    }

    #[tokio::test]
    async fn interactive_decline_leaves_pages_pending() {
        let mut registry = FailureRegistry::new();
        registry.record(failed("alpha", "p1", ErrorKind::TransientNetwork).with_city(Some("Burbank".into())));
        registry.record(failed("alpha", "p2", ErrorKind::TransientNetwork).with_city(Some("Downey".into())));
        registry.record(failed("alpha", "p3", ErrorKind::TransientNetwork).with_city(Some("Glendora".into())));
        let driver = Arc::new(
            ScriptedDriver::new("alpha", Vec::new())
                .on_refetch("https://alpha/p2", recovered_with(vec![bid("alpha", "p2")]))
                .on_refetch("https://alpha/p3", recovered_with(vec![bid("alpha", "p3")])),
        );
        let gate = Answers(
            Mutex::new(vec![RetryDecision::No, RetryDecision::All]),
            Mutex::new(Vec::new()),
        );
        let outcome = engine(driver.clone()).retry_interactive(&mut registry, &gate).await;

        // "all" on Downey approves Glendora without a prompt.
        assert_eq!(*gate.1.lock().unwrap(), vec!["alpha/Burbank", "alpha/Downey"]);
        assert_eq!(outcome.recovered.len(), 2);
        assert_eq!(outcome.still_failed.len(), 1);
        assert_eq!(outcome.still_failed[0].state, FailureState::Pending);
        assert!(!driver.refetched().contains(&"https://alpha/p1".to_string()));
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn resubmission_starts_fresh_entries() {
        let mut previous = failed("alpha", "r1", ErrorKind::TransientNetwork);
        previous.attempts = 3;
        previous.state = FailureState::PermanentlyFailed;
        let driver = Arc::new(
            ScriptedDriver::new("alpha", Vec::new()).on_refetch("https://alpha/r1", recovered_with(vec![bid("alpha", "r1")])),
        );
        let outcome = engine(driver).retry_resubmitted(std::slice::from_ref(&previous)).await;
        assert_eq!(outcome.recovered.len(), 1);
        assert_eq!(outcome.resolved[0].resubmitted_from, Some(previous.id));
        assert_eq!(outcome.resolved[0].attempts, 1);
        assert_eq!(previous.state, FailureState::PermanentlyFailed);
    }
}
