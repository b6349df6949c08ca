//! Reclamation sweep.
//!
//! A stateless batch job: each run lists candidates by rule, re-loads and
//! re-checks every candidate at a single `now`, then acts on it. Nothing is
//! locked across the run and one failing checkout never stops the batch.

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{CheckoutConfig, SweepConfig};
use crate::entities::commerce::CheckoutStatus;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::models::checkout::Checkout;
use crate::repositories::checkout_store::CheckoutStore;

use super::checkout_lifecycle::CheckoutLifecycleManager;

/// Thresholds applied by one sweep run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepPolicy {
    pub abandonment_threshold: Duration,
    pub empty_retention: Duration,
    pub abandoned_retention: Duration,
    pub batch_limit: u64,
    pub item_timeout: std::time::Duration,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self::from_config(&CheckoutConfig::default(), &SweepConfig::default())
    }
}

impl SweepPolicy {
    pub fn from_config(checkout: &CheckoutConfig, sweep: &SweepConfig) -> Self {
        Self {
            abandonment_threshold: Duration::seconds(checkout.abandonment_threshold_secs as i64),
            empty_retention: Duration::seconds(checkout.empty_retention_secs as i64),
            abandoned_retention: Duration::seconds(checkout.abandoned_retention_secs as i64),
            batch_limit: sweep.batch_limit,
            item_timeout: sweep.item_timeout(),
        }
    }
}

/// Counts produced by one sweep run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub abandoned: u64,
    pub expired: u64,
    pub deleted: u64,
    /// Candidates that no longer matched their rule when re-loaded.
    pub skipped: u64,
    pub failures: u64,
}

impl SweepReport {
    pub fn touched(&self) -> u64 {
        self.abandoned + self.expired + self.deleted
    }
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Acted,
    Skipped,
}

#[derive(Debug, Clone, Copy)]
enum Rule {
    DeleteStale,
    DeleteAbandoned,
    DeleteExpired,
    Expire,
    Abandon,
}

impl Rule {
    fn as_str(self) -> &'static str {
        match self {
            Rule::DeleteStale => "delete_stale",
            Rule::DeleteAbandoned => "delete_abandoned",
            Rule::DeleteExpired => "delete_expired",
            Rule::Expire => "expire",
            Rule::Abandon => "abandon",
        }
    }
}

#[derive(Clone)]
pub struct ReclamationSweep {
    store: Arc<dyn CheckoutStore>,
    lifecycle: CheckoutLifecycleManager,
    clock: Arc<dyn Clock>,
    event_sender: Arc<EventSender>,
    policy: SweepPolicy,
}

impl ReclamationSweep {
    pub fn new(
        store: Arc<dyn CheckoutStore>,
        lifecycle: CheckoutLifecycleManager,
        clock: Arc<dyn Clock>,
        event_sender: Arc<EventSender>,
        policy: SweepPolicy,
    ) -> Self {
        Self {
            store,
            lifecycle,
            clock,
            event_sender,
            policy,
        }
    }

    pub fn policy(&self) -> &SweepPolicy {
        &self.policy
    }

    /// Runs every rule once.
    ///
    /// Deletions run before transitions, so a checkout expired in this run is
    /// deleted by the next one. Listing failures abort the run; per-checkout
    /// failures are counted in the report.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<SweepReport, ServiceError> {
        let now = self.clock.now();
        let limit = self.policy.batch_limit;
        let mut report = SweepReport::default();

        let stale_before = now - self.policy.empty_retention;
        for id in self.store.list_stale_by_last_activity(stale_before, limit).await? {
            self.handle(&mut report, Rule::DeleteStale, id, self.delete_stale(id, stale_before))
                .await;
        }

        let abandoned_before = now - self.policy.abandoned_retention;
        for id in self
            .store
            .list_abandoned_updated_before(abandoned_before, limit)
            .await?
        {
            self.handle(
                &mut report,
                Rule::DeleteAbandoned,
                id,
                self.delete_abandoned(id, abandoned_before),
            )
            .await;
        }

        for id in self.store.list_by_status(CheckoutStatus::Expired, limit).await? {
            self.handle(&mut report, Rule::DeleteExpired, id, self.delete_expired(id))
                .await;
        }

        for id in self.store.list_active_expired_before(now, limit).await? {
            let fut = async {
                Ok::<_, ServiceError>(match self.lifecycle.expire_if_due(id, now).await? {
                    true => Action::Acted,
                    false => Action::Skipped,
                })
            };
            self.handle(&mut report, Rule::Expire, id, fut).await;
        }

        let idle_since = now - self.policy.abandonment_threshold;
        for id in self.store.list_active_inactive_since(idle_since, limit).await? {
            let threshold = self.policy.abandonment_threshold;
            let fut = async {
                Ok::<_, ServiceError>(match self.lifecycle.abandon_if_idle(id, threshold, now).await? {
                    true => Action::Acted,
                    false => Action::Skipped,
                })
            };
            self.handle(&mut report, Rule::Abandon, id, fut).await;
        }

        gauge!("checkout_ledger.sweep.last_touched", report.touched() as f64);
        counter!("checkout_ledger.sweep.runs", 1);
        info!(
            abandoned = report.abandoned,
            expired = report.expired,
            deleted = report.deleted,
            skipped = report.skipped,
            failures = report.failures,
            "Reclamation sweep finished"
        );
        self.event_sender
            .send_or_log(Event::SweepFinished {
                abandoned: report.abandoned,
                expired: report.expired,
                deleted: report.deleted,
                failures: report.failures,
                finished_at: self.clock.now(),
            })
            .await;
        Ok(report)
    }

    async fn handle<F>(&self, report: &mut SweepReport, rule: Rule, id: Uuid, fut: F)
    where
        F: Future<Output = Result<Action, ServiceError>>,
    {
        let outcome = tokio::time::timeout(self.policy.item_timeout, fut).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout(format!(
                "{} for checkout {}",
                rule.as_str(),
                id
            ))),
        };

        match result {
            Ok(Action::Acted) => {
                counter!("checkout_ledger.sweep.actions", 1, "rule" => rule.as_str());
                match rule {
                    Rule::DeleteStale | Rule::DeleteAbandoned | Rule::DeleteExpired => {
                        report.deleted += 1
                    }
                    Rule::Expire => report.expired += 1,
                    Rule::Abandon => report.abandoned += 1,
                }
            }
            Ok(Action::Skipped) => report.skipped += 1,
            // Changed or removed by someone else since it was listed.
            Err(e) if e.is_not_found() || e.is_contention() => {
                debug!(checkout_id = %id, rule = rule.as_str(), error = %e, "Sweep candidate moved on");
                report.skipped += 1;
            }
            Err(e) => {
                warn!(checkout_id = %id, rule = rule.as_str(), error = %e, "Sweep failed for checkout");
                counter!("checkout_ledger.sweep.failures", 1, "rule" => rule.as_str());
                report.failures += 1;
            }
        }
    }

    async fn delete_checked(
        &self,
        id: Uuid,
        reason: &'static str,
        still_matches: impl FnOnce(&Checkout) -> bool,
    ) -> Result<Action, ServiceError> {
        let checkout = self.store.get_by_id(id).await?;
        if !still_matches(&checkout) {
            return Ok(Action::Skipped);
        }
        if !self.store.delete_if_version(id, checkout.version).await? {
            return Ok(Action::Skipped);
        }
        self.event_sender
            .send_or_log(Event::CheckoutDeleted {
                checkout_id: id,
                reason: reason.to_string(),
            })
            .await;
        Ok(Action::Acted)
    }

    async fn delete_stale(&self, id: Uuid, before: DateTime<Utc>) -> Result<Action, ServiceError> {
        self.delete_checked(id, "no identifying data", |c| {
            !c.has_identifying_signal() && c.last_activity_at < before
        })
        .await
    }

    async fn delete_abandoned(&self, id: Uuid, before: DateTime<Utc>) -> Result<Action, ServiceError> {
        self.delete_checked(id, "abandoned retention elapsed", |c| {
            c.status == CheckoutStatus::Abandoned && c.updated_at < before
        })
        .await
    }

    async fn delete_expired(&self, id: Uuid) -> Result<Action, ServiceError> {
        self.delete_checked(id, "expired", |c| c.status == CheckoutStatus::Expired)
            .await
    }

    /// Runs the sweep every `interval` until `shutdown` flips to true.
    ///
    /// A failed run is logged and the loop keeps going.
    pub async fn run_periodic(&self, interval: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(?interval, "Starting reclamation sweep loop");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        counter!("checkout_ledger.sweep.run_errors", 1);
                        error!(error = %e, "Reclamation sweep run failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Reclamation sweep loop stopped");
    }
}
