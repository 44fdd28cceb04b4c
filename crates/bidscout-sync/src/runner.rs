//! Per-portal runner and the manual-intervention suspension point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bidscout_core::{ErrorKind, PortalFault, ScrapeResult};
use bidscout_drivers::{DriverContext, DriverError, PortalDriver};
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, info_span, warn, Instrument};

/// Sent when a portal parks waiting for a person to clear a bot check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterventionRequest {
    pub portal_id: String,
    pub url: String,
}

/// Portals blocked on a manual step wait here until `resume` or the timeout.
#[derive(Debug, Default)]
pub struct InterventionGate {
    waiting: Mutex<HashMap<String, Arc<Notify>>>,
    notifier: Option<mpsc::UnboundedSender<InterventionRequest>>,
}

impl InterventionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notifier(notifier: mpsc::UnboundedSender<InterventionRequest>) -> Self {
        Self {
            waiting: Mutex::new(HashMap::new()),
            notifier: Some(notifier),
        }
    }

    fn slot(&self, portal_id: &str) -> Arc<Notify> {
        let mut waiting = self.waiting.lock().unwrap_or_else(|e| e.into_inner());
        waiting
            .entry(portal_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Returns true when resumed, false when the wait timed out.
    pub async fn wait(&self, portal_id: &str, url: &str, timeout: Duration) -> bool {
        let notify = self.slot(portal_id);
        if let Some(tx) = &self.notifier {
            let _ = tx.send(InterventionRequest {
                portal_id: portal_id.to_string(),
                url: url.to_string(),
            });
        }
        let resumed = tokio::time::timeout(timeout, notify.notified()).await.is_ok();
        self.waiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(portal_id);
        resumed
    }

    /// Resume a waiting portal. A resume that arrives just before the wait starts is kept.
    pub fn resume(&self, portal_id: &str) -> bool {
        let waiting = self.waiting.lock().unwrap_or_else(|e| e.into_inner());
        match waiting.get(portal_id) {
            Some(notify) => {
                notify.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn waiting(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .waiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[derive(Debug, Clone)]
pub struct PortalRunner {
    gate: Arc<InterventionGate>,
    intervention_wait: Duration,
}

impl PortalRunner {
    pub fn new(gate: Arc<InterventionGate>, intervention_wait: Duration) -> Self {
        Self {
            gate,
            intervention_wait,
        }
    }

    /// Run one portal to completion. Fatal errors are captured on the result; records and
    /// failed pages collected before them are kept.
    pub async fn run(&self, driver: &dyn PortalDriver, ctx: &DriverContext, display_name: &str) -> ScrapeResult {
        let portal_id = driver.portal_id();
        let mut out = ScrapeResult::new(portal_id, display_name, driver.profile().is_multi_agency());
        let span = info_span!("portal_run", run_id = %ctx.run_id, portal_id);

        async {
            loop {
                match driver.scrape(ctx, &mut out).await {
                    Ok(()) => break,
                    Err(DriverError::NeedsIntervention { url }) => {
                        warn!(
                            url = %url,
                            wait_secs = self.intervention_wait.as_secs(),
                            "waiting for manual intervention"
                        );
                        // The rerun walks the listings again.
                        out.excluded_by_cutoff = 0;
                        if self.gate.wait(portal_id, &url, self.intervention_wait).await {
                            info!("intervention done; resuming");
                            continue;
                        }
                        error!(error_kind = %ErrorKind::InterventionTimeout, url = %url, "no intervention in time");
                        out.fatal = Some(PortalFault {
                            kind: ErrorKind::InterventionTimeout,
                            message: format!(
                                "no manual intervention within {}s at {url}",
                                self.intervention_wait.as_secs()
                            ),
                        });
                        break;
                    }
                    Err(err) => {
                        error!(error_kind = %err.kind(), error = %err, "portal failed");
                        out.fatal = Some(PortalFault {
                            kind: err.kind(),
                            message: err.to_string(),
                        });
                        break;
                    }
                }
            }
            info!(
                records = out.records.len(),
                failed_pages = out.failed_pages.len(),
                excluded_by_cutoff = out.excluded_by_cutoff,
                "portal finished"
            );
        }
        .instrument(span)
        .await;

        out
    }
}
