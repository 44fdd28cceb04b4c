//! Run orchestration: portal runs, failed-page retry, dedup and enrichment, upload,
//! persisted artifacts and the run summary.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bidscout_core::{BidRecord, Cutoff, ErrorKind, FailedPage, FailureRegistry, PortalFault, ScrapeResult};
use bidscout_drivers::{
    driver_for_portal, profile_for, DriverContext, FixturePageSource, HttpPageSource, PageSource, PortalDriver,
};
use bidscout_storage::{AirtableStore, ArtifactStore, HttpClientConfig, HttpFetcher, RecordStore};
use chrono::{DateTime, Datelike, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub mod config;
pub mod hooks;
pub mod persist;
pub mod retry;
pub mod runner;
pub mod summary;
pub mod upload;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, PortalConfig, PortalMode, PortalRegistry, RetryMode, RunConfig, StoreFields};
pub use hooks::{
    enrichment_from_workspace, DedupHook, EnrichmentHook, KeywordRulesEnrichment, NaturalKeyDedup,
    NoopEnrichmentHook,
};
pub use persist::{load_failed_pages, FAILED_PAGES_FILE, FAILED_URLS_FILE};
pub use retry::{ApproveAll, RetryDecision, RetryEngine, RetryGate, RetryOutcome};
pub use runner::{InterventionGate, InterventionRequest, PortalRunner};
pub use summary::{PortalStatus, PortalSummary, RunSummary, SummaryAggregator, Totals};
pub use upload::{partition_complete, FieldMapper, UploadBatcher, UploadResult};

pub const CRATE_NAME: &str = "bidscout-sync";

#[derive(Debug)]
pub struct RunOutput {
    pub summary: RunSummary,
    /// Final deduplicated, enriched record set.
    pub records: Vec<BidRecord>,
    pub run_dir: PathBuf,
}

impl RunOutput {
    pub fn still_failed(&self) -> &[FailedPage] {
        &self.summary.still_failed
    }
}

pub struct SyncPipeline {
    config: RunConfig,
    http: Arc<HttpFetcher>,
    dedup: Box<dyn DedupHook>,
    enrichment: Box<dyn EnrichmentHook>,
    store: Option<Arc<dyn RecordStore>>,
    driver_overrides: HashMap<String, Arc<dyn PortalDriver>>,
    retry_gate: Arc<dyn RetryGate>,
    gate: Arc<InterventionGate>,
    cancel: CancellationToken,
}

impl SyncPipeline {
    pub fn new(config: RunConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
            global_concurrency: config.max_connections,
            per_host_concurrency: config.detail_workers,
            ..Default::default()
        })?;
        let store: Option<Arc<dyn RecordStore>> = match &config.store {
            Some(store) => Some(Arc::new(AirtableStore::new(store.clone())?)),
            None => None,
        };
        Ok(Self {
            config,
            http: Arc::new(http),
            dedup: Box::new(NaturalKeyDedup),
            enrichment: Box::new(NoopEnrichmentHook),
            store,
            driver_overrides: HashMap::new(),
            retry_gate: Arc::new(ApproveAll),
            gate: Arc::new(InterventionGate::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_hooks(mut self, dedup: Box<dyn DedupHook>, enrichment: Box<dyn EnrichmentHook>) -> Self {
        self.dedup = dedup;
        self.enrichment = enrichment;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `driver` for `portal_id` instead of the registry.
    pub fn with_driver(mut self, portal_id: impl Into<String>, driver: Arc<dyn PortalDriver>) -> Self {
        self.driver_overrides.insert(portal_id.into(), driver);
        self
    }

    pub fn with_retry_gate(mut self, gate: Arc<dyn RetryGate>) -> Self {
        self.retry_gate = gate;
        self
    }

    pub fn with_intervention_notifier(mut self, notifier: mpsc::UnboundedSender<InterventionRequest>) -> Self {
        self.gate = Arc::new(InterventionGate::with_notifier(notifier));
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn gate(&self) -> Arc<InterventionGate> {
        self.gate.clone()
    }

    /// Cancelling stops portals that have not started yet; collected records are kept.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn driver_for(&self, portal_id: &str, mode: PortalMode, run_id: Uuid) -> Option<Arc<dyn PortalDriver>> {
        if let Some(driver) = self.driver_overrides.get(portal_id) {
            return Some(driver.clone());
        }
        let pages: Arc<dyn PageSource> = match mode {
            PortalMode::Fixture => Arc::new(FixturePageSource::new(self.config.fixtures_dir())),
            PortalMode::Live => {
                let source = HttpPageSource::new(self.http.clone(), run_id);
                if self.config.debug {
                    Arc::new(source.with_captures(ArtifactStore::new(self.config.output_dir.join("artifacts"))))
                } else {
                    Arc::new(source)
                }
            }
        };
        driver_for_portal(portal_id, pages).map(Arc::from)
    }

    fn base_context(&self, run_id: Uuid, started_at: DateTime<Utc>) -> DriverContext {
        let cutoff: Cutoff = self.config.cutoff_mode.resolve(started_at.date_naive());
        let mut ctx = DriverContext::new(run_id, cutoff, started_at.year(), Vec::new());
        ctx.detail_workers = self.config.detail_workers;
        ctx
    }

    async fn run_portal(
        &self,
        runner: &PortalRunner,
        portal: PortalConfig,
        driver: Option<Arc<dyn PortalDriver>>,
        base: &DriverContext,
    ) -> ScrapeResult {
        let multi_agency = profile_for(&portal.portal_id)
            .map(|p| p.is_multi_agency())
            .unwrap_or(false);
        if self.cancel.is_cancelled() {
            warn!(portal_id = %portal.portal_id, "run cancelled before portal started");
            let mut out = ScrapeResult::new(&portal.portal_id, &portal.display_name, multi_agency);
            out.fatal = Some(PortalFault {
                kind: ErrorKind::Cancelled,
                message: "run cancelled before portal started".to_string(),
            });
            return out;
        }
        let Some(driver) = driver else {
            warn!(portal_id = %portal.portal_id, "no driver registered");
            let mut out = ScrapeResult::new(&portal.portal_id, &portal.display_name, multi_agency);
            out.fatal = Some(PortalFault {
                kind: ErrorKind::UnrecoverableParse,
                message: format!("no driver registered for {}", portal.portal_id),
            });
            return out;
        };

        let mut ctx = base.clone();
        ctx.targets = portal.listing_targets();
        runner.run(driver.as_ref(), &ctx, &portal.display_name).await
    }

    pub async fn run_once(&self) -> Result<RunOutput> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let base = self.base_context(run_id, started_at);
        let registry = PortalRegistry::load(&self.config.portals_path()).await?;
        persist::reset_failed_urls(&self.config.output_dir, started_at).await?;
        info!(
            %run_id,
            cutoff = %base.cutoff.date(),
            portals = registry.enabled().count(),
            "run started"
        );

        let mut drivers: HashMap<String, Arc<dyn PortalDriver>> = HashMap::new();
        let mut planned = Vec::new();
        for portal in registry.enabled() {
            let driver = self.driver_for(&portal.portal_id, portal.mode, run_id);
            if let Some(driver) = &driver {
                drivers.insert(portal.portal_id.clone(), driver.clone());
            }
            planned.push((portal.clone(), driver));
        }

        let runner = PortalRunner::new(self.gate.clone(), self.config.intervention_wait);
        let results: Vec<ScrapeResult> = stream::iter(planned)
            .map(|(portal, driver)| self.run_portal(&runner, portal, driver, &base))
            .buffer_unordered(self.config.max_concurrent_portals.max(1))
            .collect()
            .await;

        let mut aggregator = SummaryAggregator::new(run_id, started_at, base.cutoff.date());
        let mut failures = FailureRegistry::new();
        let mut multi_agency = BTreeMap::new();
        let mut records = Vec::new();
        for result in results {
            aggregator.add_scrape(&result);
            multi_agency.insert(result.portal_id.clone(), result.multi_agency);
            records.extend(result.records);
            failures.extend(result.failed_pages);
        }

        let engine = RetryEngine::new(drivers, base.clone(), self.config.max_retries, self.config.retry_backoff);
        let outcome = if self.cancel.is_cancelled() {
            info!("run cancelled; skipping retry");
            RetryOutcome::default()
        } else {
            match self.config.retry_mode {
                RetryMode::Automatic => engine.retry_automatic(&mut failures).await,
                RetryMode::Interactive => engine.retry_interactive(&mut failures, self.retry_gate.as_ref()).await,
                RetryMode::Off => RetryOutcome::default(),
            }
        };
        aggregator.add_retry(&outcome);
        records.extend(outcome.recovered);

        self.finish_run(
            run_id,
            aggregator,
            records,
            failures.outstanding(),
            &multi_agency,
            &registry.store_fields,
        )
        .await
    }

    /// Resubmit the outstanding entries of an earlier run's `failed_pages.json`.
    pub async fn retry_from_file(&self, path: &Path) -> Result<RunOutput> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let base = self.base_context(run_id, started_at);
        let registry = PortalRegistry::load(&self.config.portals_path()).await?;
        let previous = persist::load_failed_pages(path).await?;
        info!(%run_id, pages = previous.len(), path = %path.display(), "resubmitting failed pages");

        let mut aggregator = SummaryAggregator::new(run_id, started_at, base.cutoff.date());
        let mut drivers: HashMap<String, Arc<dyn PortalDriver>> = HashMap::new();
        let mut multi_agency = BTreeMap::new();
        for page in &previous {
            if drivers.contains_key(&page.portal_id) {
                continue;
            }
            let portal = registry.get(&page.portal_id);
            let mode = portal.map(|p| p.mode).unwrap_or_default();
            let display_name = portal.map(|p| p.display_name.as_str()).unwrap_or(&page.portal_id);
            if let Some(driver) = self.driver_for(&page.portal_id, mode, run_id) {
                let multi = driver.profile().is_multi_agency();
                aggregator.add_scrape(&ScrapeResult::new(&page.portal_id, display_name, multi));
                multi_agency.insert(page.portal_id.clone(), multi);
                drivers.insert(page.portal_id.clone(), driver);
            }
        }

        let engine = RetryEngine::new(drivers, base, self.config.max_retries, self.config.retry_backoff);
        let outcome = engine.retry_resubmitted(&previous).await;
        aggregator.add_retry(&outcome);
        let still_failed = outcome.still_failed.clone();

        self.finish_run(
            run_id,
            aggregator,
            outcome.recovered,
            still_failed,
            &multi_agency,
            &registry.store_fields,
        )
        .await
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        aggregator: SummaryAggregator,
        records: Vec<BidRecord>,
        still_failed: Vec<FailedPage>,
        multi_agency: &BTreeMap<String, bool>,
        fields: &StoreFields,
    ) -> Result<RunOutput> {
        let (records, dropped_incomplete) = partition_complete(records);
        let before = records.len();
        let records = self.dedup.apply(records).context("dedup hook")?;
        let duplicates_removed = before - records.len();
        let records = self.enrichment.apply(records).context("enrichment hook")?;

        let run_dir = self.config.output_dir.join("runs").join(run_id.to_string());
        persist::write_snapshots(&run_dir, &run_id.to_string(), &records, multi_agency).await?;

        let upload = match &self.store {
            Some(store) => {
                UploadBatcher::new(store.as_ref(), FieldMapper::new(fields.clone()), self.config.batch_size)
                    .with_backoff(self.config.upload_backoff)
                    .with_pause(self.config.batch_pause)
                    .upload(&records)
                    .await
            }
            None => {
                warn!(records = records.len(), "no record store configured; upload skipped");
                UploadResult::skipped()
            }
        };

        persist::write_failed_pages(&self.config.output_dir, Utc::now(), &still_failed).await?;
        let summary = aggregator.finish(&records, still_failed, upload, dropped_incomplete, duplicates_removed);
        persist::write_run_report(&run_dir, &summary).await?;
        info!(
            %run_id,
            records = summary.totals.records,
            uploaded = summary.totals.uploaded,
            failed_pages = summary.totals.failed_pages,
            "run finished"
        );

        Ok(RunOutput {
            summary,
            records,
            run_dir,
        })
    }
}

pub async fn run_once_from_env() -> Result<RunOutput> {
    let config = RunConfig::from_env()?;
    let enrichment = enrichment_from_workspace(&config.workspace_root)?;
    let pipeline = SyncPipeline::new(config)?.with_hooks(Box::new(NaturalKeyDedup), enrichment);
    pipeline.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{bid, failed, ScriptStep, ScriptedDriver, ScriptedStore, StoreReply};
    use bidscout_core::{CutoffMode, FailureState};
    use bidscout_drivers::{DriverError, RefetchOutcome};
    use bidscout_storage::{BackoffPolicy, StoreError};
    use chrono::NaiveDate;
    use std::time::Duration;

    const PORTALS: &str = r#"
portals:
  - portal_id: alpha
    display_name: Alpha Portal
    enabled: true
  - portal_id: beta
    display_name: Beta Portal
    enabled: true
  - portal_id: gamma
    display_name: Gamma Portal
    enabled: false
"#;

    fn workspace() -> (tempfile::TempDir, RunConfig) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("portals.yaml"), PORTALS).unwrap();
        let config = RunConfig {
            workspace_root: dir.path().to_path_buf(),
            output_dir: dir.path().join("output"),
            cutoff_mode: CutoffMode::Absolute(NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()),
            batch_size: 5,
            retry_backoff: BackoffPolicy::none(),
            upload_backoff: BackoffPolicy {
                max_retries: 3,
                ..BackoffPolicy::none()
            },
            batch_pause: Duration::ZERO,
            intervention_wait: Duration::from_millis(20),
            ..RunConfig::default()
        };
        (dir, config)
    }

    fn alpha_fails_after_three() -> Arc<ScriptedDriver> {
        Arc::new(ScriptedDriver::new(
            "alpha",
            vec![
                ScriptStep::Yield(vec![bid("alpha", "a1"), bid("alpha", "a2"), bid("alpha", "a3")]),
                ScriptStep::Fail(DriverError::AuthenticationRequired {
                    reason: "session expired".into(),
                }),
            ],
        ))
    }

    fn beta_with_one_flaky_page() -> Arc<ScriptedDriver> {
        Arc::new(
            ScriptedDriver::new(
                "beta",
                vec![
                    ScriptStep::Yield(vec![bid("beta", "b1"), bid("beta", "b2")]),
                    ScriptStep::FailPage(failed("beta", "b3", ErrorKind::TransientNetwork)),
                ],
            )
            .on_refetch(
                "https://beta/b3",
                Ok(RefetchOutcome {
                    records: vec![bid("beta", "b3")],
                    discovered: Vec::new(),
                }),
            ),
        )
    }

    #[test]
    fn driver_context_uses_configured_detail_pool() {
        let (_dir, mut config) = workspace();
        config.detail_workers = 2;
        let pipeline = SyncPipeline::new(config).unwrap();
        let ctx = pipeline.base_context(Uuid::new_v4(), Utc::now());
        assert_eq!(ctx.detail_workers, 2);
        assert_eq!(ctx.cutoff.date(), NaiveDate::from_ymd_opt(2025, 6, 1).unwrap());
    }

    #[tokio::test]
    async fn portal_fatal_error_is_isolated_from_siblings() {
        let (dir, config) = workspace();
        let store = Arc::new(ScriptedStore::default());
        let pipeline = SyncPipeline::new(config)
            .unwrap()
            .with_driver("alpha", alpha_fails_after_three())
            .with_driver("beta", beta_with_one_flaky_page())
            .with_store(store.clone());

        let output = pipeline.run_once().await.unwrap();
        let summary = &output.summary;

        let alpha = summary.portal("alpha").unwrap();
        assert_eq!(alpha.status, PortalStatus::Failed);
        assert_eq!(alpha.records, 3);
        assert_eq!(alpha.uploaded, 3);
        assert_eq!(alpha.error.as_ref().unwrap().kind, ErrorKind::AuthenticationRequired);

        let beta = summary.portal("beta").unwrap();
        assert_eq!(beta.status, PortalStatus::Success);
        assert_eq!(beta.records, 3);
        assert_eq!(beta.recovered_pages, 1);
        assert!(summary.portal("gamma").is_none());

        assert_eq!(summary.totals.records, 6);
        assert_eq!(summary.upload.success_count, 6);
        assert_eq!(store.batch_sizes(), vec![5, 1]);
        assert!(output.still_failed().is_empty());

        let failed_urls = std::fs::read_to_string(dir.path().join("output").join(FAILED_URLS_FILE)).unwrap();
        assert_eq!(failed_urls.lines().count(), 2);
        assert!(output.run_dir.join("run_summary.json").exists());
        assert!(output.run_dir.join("run_brief.md").exists());
        assert!(output.run_dir.join("snapshots").join("manifest.json").exists());
    }

    #[tokio::test]
    async fn upload_counts_always_add_up() {
        let (_dir, config) = workspace();
        let store = Arc::new(ScriptedStore::with_replies(vec![
            StoreReply::Ack,
            StoreReply::Fail(StoreError::Rejected {
                status: 422,
                message: "INVALID_VALUE_FOR_COLUMN".into(),
            }),
        ]));
        let pipeline = SyncPipeline::new(config)
            .unwrap()
            .with_driver("alpha", alpha_fails_after_three())
            .with_driver("beta", beta_with_one_flaky_page())
            .with_store(store);

        let output = pipeline.run_once().await.unwrap();
        let upload = &output.summary.upload;
        assert_eq!(upload.submitted, 6);
        assert_eq!(upload.success_count + upload.failure_count, upload.submitted);
        assert_eq!(upload.failure_count, 1);
        assert_eq!(output.summary.totals.upload_failed, 1);
        assert!(output
            .summary
            .failure_lines()
            .iter()
            .any(|l| l.starts_with("upload/batch 2:")));
    }

    #[tokio::test]
    async fn missing_store_still_writes_snapshots() {
        let (_dir, config) = workspace();
        let pipeline = SyncPipeline::new(config)
            .unwrap()
            .with_driver("alpha", alpha_fails_after_three())
            .with_driver("beta", beta_with_one_flaky_page());

        let output = pipeline.run_once().await.unwrap();
        assert!(output.summary.upload.skipped);
        assert_eq!(output.summary.upload.submitted, 0);
        assert_eq!(output.summary.totals.uploaded, 0);
        assert_eq!(output.records.len(), 6);

        let manifest = std::fs::read_to_string(output.run_dir.join("snapshots").join("manifest.json")).unwrap();
        assert!(manifest.contains("alpha.parquet"));
        assert!(manifest.contains("beta.parquet"));
    }

    #[tokio::test]
    async fn retry_off_reports_pending_pages_as_still_failed() {
        let (dir, mut config) = workspace();
        config.retry_mode = RetryMode::Off;
        let pipeline = SyncPipeline::new(config)
            .unwrap()
            .with_driver("alpha", alpha_fails_after_three())
            .with_driver("beta", beta_with_one_flaky_page());

        let output = pipeline.run_once().await.unwrap();
        assert_eq!(output.still_failed().len(), 1);
        assert_eq!(output.still_failed()[0].state, FailureState::Pending);
        assert_eq!(output.summary.portal("beta").unwrap().status, PortalStatus::SuccessWithErrors);

        let failed_urls = std::fs::read_to_string(dir.path().join("output").join(FAILED_URLS_FILE)).unwrap();
        assert_eq!(failed_urls.lines().last(), Some("https://beta/b3"));
    }

    #[tokio::test]
    async fn cancelled_run_marks_unstarted_portals() {
        let (_dir, config) = workspace();
        let pipeline = SyncPipeline::new(config)
            .unwrap()
            .with_driver("alpha", alpha_fails_after_three())
            .with_driver("beta", beta_with_one_flaky_page());
        pipeline.cancel_token().cancel();

        let output = pipeline.run_once().await.unwrap();
        for portal in &output.summary.portals {
            assert_eq!(portal.status, PortalStatus::Failed);
            assert_eq!(portal.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
        }
        assert_eq!(output.summary.totals.records, 0);
    }

    #[tokio::test]
    async fn bulk_resubmission_recovers_and_rewrites_the_list() {
        let (dir, config) = workspace();
        let output_dir = config.output_dir.clone();
        let mut gone = failed("beta", "b3", ErrorKind::TransientNetwork);
        gone.attempts = 3;
        gone.state = FailureState::PermanentlyFailed;
        persist::write_failed_pages(&output_dir, Utc::now(), &[gone]).await.unwrap();

        let pipeline = SyncPipeline::new(config)
            .unwrap()
            .with_driver("beta", beta_with_one_flaky_page());
        let output = pipeline
            .retry_from_file(&output_dir.join(FAILED_PAGES_FILE))
            .await
            .unwrap();

        assert_eq!(output.records.len(), 1);
        assert!(output.still_failed().is_empty());
        let beta = output.summary.portal("beta").unwrap();
        assert_eq!(beta.display_name, "Beta Portal");
        assert_eq!(beta.recovered_pages, 1);
        let failed_urls = std::fs::read_to_string(dir.path().join("output").join(FAILED_URLS_FILE)).unwrap();
        assert_eq!(failed_urls.lines().count(), 2);
    }
}
