use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::CheckoutConfig;
use crate::db::{begin, commit, with_deadline};
use crate::entities::commerce::CheckoutStatus;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::models::checkout::Checkout;
use crate::repositories::checkout_store::CheckoutStore;

use super::order_bridge::OrderConversionBridge;

/// Payment result resolved upstream of completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentOutcome {
    Approved,
    Declined,
    Pending,
}

/// Drives checkouts through their terminal transitions.
///
/// Active is the only non-terminal state. Completed is reached through an
/// [`OrderConversionBridge`]; Abandoned and Expired are normally reached from
/// the reclamation sweep.
#[derive(Clone)]
pub struct CheckoutLifecycleManager {
    store: Arc<dyn CheckoutStore>,
    db: Arc<DatabaseConnection>,
    clock: Arc<dyn Clock>,
    event_sender: Arc<EventSender>,
    expiry_window: Duration,
    store_timeout: std::time::Duration,
}

impl CheckoutLifecycleManager {
    pub fn new(
        store: Arc<dyn CheckoutStore>,
        db: Arc<DatabaseConnection>,
        clock: Arc<dyn Clock>,
        event_sender: Arc<EventSender>,
        config: &CheckoutConfig,
        store_timeout: std::time::Duration,
    ) -> Self {
        Self {
            store,
            db,
            clock,
            event_sender,
            expiry_window: config.expiry_window(),
            store_timeout,
        }
    }

    /// Converts the checkout into an order and marks it Completed.
    ///
    /// The order and the Completed checkout are written in one transaction:
    /// if the bridge fails, or the checkout changed since it was loaded
    /// ([`ServiceError::ConcurrentModification`]), nothing is kept. A checkout
    /// that is not Active (including one already completed) is rejected with
    /// [`ServiceError::InvalidState`].
    #[instrument(skip(self, bridge))]
    pub async fn complete(
        &self,
        checkout_id: Uuid,
        outcome: PaymentOutcome,
        bridge: &dyn OrderConversionBridge,
    ) -> Result<Checkout, ServiceError> {
        let mut checkout = self.store.get_by_id(checkout_id).await?;
        checkout.ensure_completable()?;
        if outcome != PaymentOutcome::Approved {
            return Err(ServiceError::InvalidState(format!(
                "payment {} for checkout {}",
                outcome, checkout_id
            )));
        }

        let completed_at = self.clock.now();
        let (checkout, order_id) = with_deadline(self.store_timeout, "complete checkout", async {
            let txn = begin(&self.db, "complete checkout").await?;
            let order_id = bridge.convert(&txn, &checkout).await?;
            checkout.mark_completed(order_id, completed_at)?;
            let saved = self.store.update_in(&txn, &checkout).await?;
            commit(txn, "complete checkout").await?;
            Ok::<_, ServiceError>((saved, order_id))
        })
        .await?;

        counter!("checkout_ledger.checkout.transitions", 1, "to" => "completed");
        info!(%checkout_id, %order_id, "Checkout completed");
        self.event_sender
            .send_or_log(Event::CheckoutCompleted {
                checkout_id,
                order_id,
            })
            .await;
        Ok(checkout)
    }

    /// Marks an Active checkout Abandoned. Repeating the call is a no-op.
    #[instrument(skip(self))]
    pub async fn abandon(&self, checkout_id: Uuid) -> Result<Checkout, ServiceError> {
        let mut checkout = self.store.get_by_id(checkout_id).await?;
        if checkout.status == CheckoutStatus::Abandoned {
            return Ok(checkout);
        }
        checkout.mark_abandoned(self.clock.now())?;
        self.save_transition(checkout).await
    }

    /// Marks an Active checkout Expired once its deadline has passed.
    /// Repeating the call is a no-op.
    #[instrument(skip(self))]
    pub async fn expire(&self, checkout_id: Uuid) -> Result<Checkout, ServiceError> {
        let mut checkout = self.store.get_by_id(checkout_id).await?;
        if checkout.status == CheckoutStatus::Expired {
            return Ok(checkout);
        }
        let now = self.clock.now();
        if checkout.is_active() && !checkout.is_expirable(now) {
            return Err(ServiceError::InvalidState(format!(
                "checkout {} has no passed deadline",
                checkout_id
            )));
        }
        checkout.mark_expired(now)?;
        self.save_transition(checkout).await
    }

    /// Re-loads the checkout and abandons it if it is still idle past
    /// `threshold` at `now`. Returns whether a transition happened.
    pub async fn abandon_if_idle(
        &self,
        checkout_id: Uuid,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let mut checkout = self.store.get_by_id(checkout_id).await?;
        if !checkout.is_abandonable(now, threshold) {
            debug!(%checkout_id, "Checkout no longer abandonable");
            return Ok(false);
        }
        checkout.mark_abandoned(now)?;
        self.save_transition(checkout).await?;
        Ok(true)
    }

    /// Re-loads the checkout and expires it if its deadline passed before `now`.
    pub async fn expire_if_due(
        &self,
        checkout_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let mut checkout = self.store.get_by_id(checkout_id).await?;
        if !checkout.is_expirable(now) {
            debug!(%checkout_id, "Checkout no longer expirable");
            return Ok(false);
        }
        checkout.mark_expired(now)?;
        self.save_transition(checkout).await?;
        Ok(true)
    }

    async fn save_transition(&self, checkout: Checkout) -> Result<Checkout, ServiceError> {
        let checkout = self.store.update(&checkout).await?;
        let checkout_id = checkout.id;
        match checkout.status {
            CheckoutStatus::Abandoned => {
                counter!("checkout_ledger.checkout.transitions", 1, "to" => "abandoned");
                self.event_sender
                    .send_or_log(Event::CheckoutAbandoned(checkout_id))
                    .await;
            }
            CheckoutStatus::Expired => {
                counter!("checkout_ledger.checkout.transitions", 1, "to" => "expired");
                self.event_sender
                    .send_or_log(Event::CheckoutExpired(checkout_id))
                    .await;
            }
            _ => {}
        }
        info!(%checkout_id, status = %checkout.status, "Checkout transitioned");
        Ok(checkout)
    }

    /// Attaches the session's active guest checkout to `user_id`.
    ///
    /// Claiming a checkout the same user already owns returns it unchanged.
    #[instrument(skip(self))]
    pub async fn convert_guest_checkout_to_user_checkout(
        &self,
        session_id: &str,
        user_id: Uuid,
    ) -> Result<Checkout, ServiceError> {
        let mut checkout = self.store.get_by_session_id(session_id).await?;
        match checkout.user_id {
            Some(owner) if owner == user_id => return Ok(checkout),
            Some(_) => {
                return Err(ServiceError::NotFound(format!(
                    "No guest checkout for session {}",
                    session_id
                )))
            }
            None => {}
        }

        checkout.claim_for_user(user_id, self.clock.now())?;
        checkout.slide_deadline(self.expiry_window);
        let checkout = self.store.update(&checkout).await?;
        self.event_sender
            .send_or_log(Event::CheckoutClaimed {
                checkout_id: checkout.id,
                user_id,
            })
            .await;
        Ok(checkout)
    }

    /// Opens the completion deadline once a payment session starts. From then
    /// on the checkout is governed by the expiry path instead of abandonment.
    #[instrument(skip(self))]
    pub async fn commit_payment_session(&self, checkout_id: Uuid) -> Result<Checkout, ServiceError> {
        let mut checkout = self.store.get_by_id(checkout_id).await?;
        checkout.ensure_completable()?;
        checkout.set_deadline(self.expiry_window, self.clock.now())?;
        let checkout = self.store.update(&checkout).await?;
        self.event_sender
            .send_or_log(Event::CheckoutUpdated(checkout_id))
            .await;
        Ok(checkout)
    }
}
