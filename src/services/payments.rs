//! Payment transaction ledger.
//!
//! Records authorize/capture/refund/cancel attempts against orders and
//! derives per-order totals from the successful rows.

use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::entities::payment_transaction::{self, TransactionStatus, TransactionType};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::models::payment_transaction::{LedgerTotals, NewTransaction, OrderPaymentStatus};
use crate::repositories::transaction_store::{ExternalWrite, TransactionStore, WriteGuard, WriteMode};

/// Totals and derived position of one order after a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub totals: LedgerTotals,
    pub payment_status: OrderPaymentStatus,
    pub remaining_capturable: Decimal,
    pub remaining_refundable: Decimal,
}

impl From<LedgerTotals> for LedgerSummary {
    fn from(totals: LedgerTotals) -> Self {
        Self {
            payment_status: totals.payment_status(),
            remaining_capturable: totals.remaining_capturable(),
            remaining_refundable: totals.remaining_refundable(),
            totals,
        }
    }
}

/// Provider-agnostic outcome reported by a payment gateway callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Gateway reference for the operation (charge, refund, ...).
    pub external_id: String,
    pub order_id: Uuid,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub amount: Decimal,
    pub currency: String,
    pub provider: String,
    /// Partial captures and refunds get a row each instead of overwriting.
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WebhookOutcome {
    Recorded,
    Updated,
    Duplicate,
    Ignored,
    Failed,
}

/// Acknowledgement returned to the gateway. Always acknowledged so the
/// gateway stops redelivering; `outcome` tells what the ledger did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookAck {
    pub acknowledged: bool,
    pub outcome: WebhookOutcome,
    pub transaction_id: Option<String>,
}

impl WebhookAck {
    fn new(outcome: WebhookOutcome, transaction_id: Option<String>) -> Self {
        Self {
            acknowledged: true,
            outcome,
            transaction_id,
        }
    }
}

/// Rejects successful captures beyond the authorized remainder and
/// successful refunds beyond the captured remainder.
pub fn validate_amount(totals: &LedgerTotals, tx: &NewTransaction) -> Result<(), ServiceError> {
    if tx.status != TransactionStatus::Successful {
        return Ok(());
    }
    match tx.transaction_type {
        TransactionType::Capture if tx.amount > totals.remaining_capturable() => {
            Err(ServiceError::InvalidState(format!(
                "capture of {} exceeds remaining capturable {}",
                tx.amount,
                totals.remaining_capturable()
            )))
        }
        TransactionType::Refund if tx.amount > totals.remaining_refundable() => {
            Err(ServiceError::InvalidState(format!(
                "refund of {} exceeds remaining refundable {}",
                tx.amount,
                totals.remaining_refundable()
            )))
        }
        _ => Ok(()),
    }
}

/// Ledger service over a [`TransactionStore`].
#[derive(Clone)]
pub struct TransactionLedger {
    store: Arc<dyn TransactionStore>,
    event_sender: Arc<EventSender>,
}

impl TransactionLedger {
    pub fn new(store: Arc<dyn TransactionStore>, event_sender: Arc<EventSender>) -> Self {
        Self {
            store,
            event_sender,
        }
    }

    fn record_metrics(model: &payment_transaction::Model) {
        counter!(
            "checkout_ledger.ledger.writes",
            1,
            "type" => model.transaction_type.to_string(),
            "status" => model.status.to_string()
        );
    }

    async fn announce(&self, model: &payment_transaction::Model) {
        Self::record_metrics(model);
        self.event_sender
            .send_or_log(Event::PaymentTransactionRecorded {
                order_id: model.order_id,
                transaction_id: model.transaction_id.clone(),
                transaction_type: model.transaction_type,
                status: model.status,
                amount: model.amount,
            })
            .await;
    }

    /// Inserts a new ledger row unconditionally.
    ///
    /// Neither the idempotency key nor the external id is consulted; use
    /// [`TransactionLedger::record_webhook_event`] for deduplicated gateway input.
    #[instrument(skip(self, tx), fields(order_id = %tx.order_id, kind = %tx.transaction_type))]
    pub async fn create(&self, tx: NewTransaction) -> Result<payment_transaction::Model, ServiceError> {
        let model = self.store.create(tx).await?;
        self.announce(&model).await;
        Ok(model)
    }

    /// Upserts the current row for (order, type).
    #[instrument(skip(self, tx), fields(order_id = %tx.order_id, kind = %tx.transaction_type))]
    pub async fn create_or_update(
        &self,
        tx: NewTransaction,
    ) -> Result<payment_transaction::Model, ServiceError> {
        let model = self.store.create_or_update(tx).await?;
        self.announce(&model).await;
        Ok(model)
    }

    /// Records a new attempt, refusing successful captures or refunds that
    /// exceed what the order still allows.
    #[instrument(skip(self, tx), fields(order_id = %tx.order_id, kind = %tx.transaction_type))]
    pub async fn record_attempt(
        &self,
        tx: NewTransaction,
    ) -> Result<payment_transaction::Model, ServiceError> {
        let (model, _) = self.write(tx, WriteMode::Append, Some(validate_amount)).await?;
        Ok(model)
    }

    /// Writes and returns the order summary read in the same store transaction.
    #[instrument(skip(self, tx), fields(order_id = %tx.order_id, kind = %tx.transaction_type))]
    pub async fn record_and_summarize(
        &self,
        tx: NewTransaction,
        mode: WriteMode,
    ) -> Result<(payment_transaction::Model, LedgerSummary), ServiceError> {
        let guard: Option<WriteGuard> = match mode {
            WriteMode::Append => Some(validate_amount),
            WriteMode::Upsert => None,
        };
        self.write(tx, mode, guard).await
    }

    async fn write(
        &self,
        tx: NewTransaction,
        mode: WriteMode,
        guard: Option<WriteGuard>,
    ) -> Result<(payment_transaction::Model, LedgerSummary), ServiceError> {
        let (model, totals) = self.store.write_and_total(tx, mode, guard).await?;
        let summary = self.settle(&model, totals).await;
        Ok((model, summary))
    }

    async fn settle(&self, model: &payment_transaction::Model, totals: LedgerTotals) -> LedgerSummary {
        let summary = LedgerSummary::from(totals);
        self.announce(model).await;
        self.event_sender
            .send_or_log(Event::OrderPaymentStatusChanged {
                order_id: model.order_id,
                status: summary.payment_status,
            })
            .await;
        summary
    }

    /// Moves a row to `status`, re-deriving its rollups. Only forward moves
    /// are accepted; repeating the current status is a no-op.
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        id: i64,
        status: TransactionStatus,
    ) -> Result<payment_transaction::Model, ServiceError> {
        let mut model = self.store.get_by_id(id).await?;
        if model.status == status {
            return Ok(model);
        }
        if !model.status.can_transition_to(status) {
            return Err(ServiceError::InvalidState(format!(
                "transaction {} cannot move from {} to {}",
                model.transaction_id, model.status, status
            )));
        }
        model.update_status(status);
        let model = self.store.update(model).await?;
        Self::record_metrics(&model);
        self.event_sender
            .send_or_log(Event::PaymentTransactionUpdated {
                order_id: model.order_id,
                transaction_id: model.transaction_id.clone(),
                status: model.status,
            })
            .await;
        Ok(model)
    }

    /// Admin removal of a ledger row.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<(), ServiceError> {
        warn!(id, "Deleting ledger row");
        self.store.delete(id).await
    }

    pub async fn totals(&self, order_id: Uuid) -> Result<LedgerTotals, ServiceError> {
        self.store.totals(order_id).await
    }

    pub async fn summary(&self, order_id: Uuid) -> Result<LedgerSummary, ServiceError> {
        Ok(self.totals(order_id).await?.into())
    }

    pub async fn payment_status(&self, order_id: Uuid) -> Result<OrderPaymentStatus, ServiceError> {
        Ok(self.totals(order_id).await?.payment_status())
    }

    pub async fn remaining_refundable(&self, order_id: Uuid) -> Result<Decimal, ServiceError> {
        Ok(self.totals(order_id).await?.remaining_refundable())
    }

    pub async fn remaining_capturable(&self, order_id: Uuid) -> Result<Decimal, ServiceError> {
        Ok(self.totals(order_id).await?.remaining_capturable())
    }

    pub async fn sum_authorized_amount_by_order_id(&self, order_id: Uuid) -> Result<Decimal, ServiceError> {
        self.store.sum_authorized_amount_by_order_id(order_id).await
    }

    pub async fn sum_captured_amount_by_order_id(&self, order_id: Uuid) -> Result<Decimal, ServiceError> {
        self.store.sum_captured_amount_by_order_id(order_id).await
    }

    pub async fn sum_refunded_amount_by_order_id(&self, order_id: Uuid) -> Result<Decimal, ServiceError> {
        self.store.sum_refunded_amount_by_order_id(order_id).await
    }

    pub async fn sum_amount_by_order_id_and_type(
        &self,
        order_id: Uuid,
        transaction_type: TransactionType,
    ) -> Result<Decimal, ServiceError> {
        self.store
            .sum_amount_by_order_id_and_type(order_id, transaction_type)
            .await
    }

    pub async fn count_successful_by_order_id_and_type(
        &self,
        order_id: Uuid,
        transaction_type: TransactionType,
    ) -> Result<u64, ServiceError> {
        self.store
            .count_successful_by_order_id_and_type(order_id, transaction_type)
            .await
    }

    pub async fn get_by_id(&self, id: i64) -> Result<payment_transaction::Model, ServiceError> {
        self.store.get_by_id(id).await
    }

    pub async fn get_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<payment_transaction::Model, ServiceError> {
        self.store.get_by_transaction_id(transaction_id).await
    }

    pub async fn get_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<payment_transaction::Model, ServiceError> {
        self.store.get_by_external_id(external_id).await
    }

    pub async fn get_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<payment_transaction::Model, ServiceError> {
        self.store.get_by_idempotency_key(key).await
    }

    pub async fn get_by_order_id(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<payment_transaction::Model>, ServiceError> {
        self.store.get_by_order_id(order_id).await
    }

    pub async fn get_latest_by_order_id_and_type(
        &self,
        order_id: Uuid,
        transaction_type: TransactionType,
    ) -> Result<payment_transaction::Model, ServiceError> {
        self.store
            .get_latest_by_order_id_and_type(order_id, transaction_type)
            .await
    }

    /// Applies a gateway callback to the ledger and always acknowledges it.
    ///
    /// Events are keyed on (order, type, external id). A redelivery with the
    /// recorded status and amount is a [`WebhookOutcome::Duplicate`]. A status
    /// that moves the row forward (pending to successful or failed, successful
    /// to failed) updates it in place; anything else arrived out of order and
    /// is [`WebhookOutcome::Ignored`]. An unseen external id appends a row for
    /// partial events and upserts the (order, type) row otherwise. Ledger
    /// failures are logged and reported as [`WebhookOutcome::Failed`].
    #[instrument(skip(self, event), fields(external_id = %event.external_id, order_id = %event.order_id))]
    pub async fn record_webhook_event(&self, event: WebhookEvent) -> WebhookAck {
        if event.external_id.trim().is_empty() {
            self.event_sender
                .send_or_log(Event::WebhookIgnored {
                    external_id: String::new(),
                    reason: "missing external id".to_string(),
                })
                .await;
            return WebhookAck::new(WebhookOutcome::Ignored, None);
        }

        match self.apply_webhook(&event).await {
            Ok(ack) => {
                counter!("checkout_ledger.webhooks", 1, "outcome" => ack.outcome.to_string());
                ack
            }
            Err(e) => {
                error!(error = %e, "Failed to record payment webhook; acknowledging anyway");
                counter!("checkout_ledger.webhooks", 1, "outcome" => "failed");
                WebhookAck::new(WebhookOutcome::Failed, None)
            }
        }
    }

    async fn apply_webhook(&self, event: &WebhookEvent) -> Result<WebhookAck, ServiceError> {
        let mut tx = NewTransaction::new(
            event.order_id,
            event.transaction_type,
            event.status,
            event.amount,
            event.currency.clone(),
            event.provider.clone(),
        )
        .with_external_id(event.external_id.clone());
        tx.raw_response = event.payload.clone();

        let mode = if event.partial {
            WriteMode::Append
        } else {
            WriteMode::Upsert
        };
        let (outcome, model, totals) = match self.store.record_external(tx.clone(), mode).await {
            // A concurrent delivery wrote this external id first; re-apply against its row.
            Err(ServiceError::Conflict(_)) => self.store.record_external(tx, mode).await?,
            other => other?,
        };

        let transaction_id = Some(model.transaction_id.clone());
        match outcome {
            ExternalWrite::Inserted => {
                self.settle(&model, totals).await;
                Ok(WebhookAck::new(WebhookOutcome::Recorded, transaction_id))
            }
            ExternalWrite::Updated => {
                self.settle(&model, totals).await;
                Ok(WebhookAck::new(WebhookOutcome::Updated, transaction_id))
            }
            ExternalWrite::Unchanged => {
                info!(transaction_id = %model.transaction_id, "Duplicate webhook delivery skipped");
                self.ignore(event, "duplicate delivery".to_string()).await;
                Ok(WebhookAck::new(WebhookOutcome::Duplicate, transaction_id))
            }
            ExternalWrite::Stale => {
                warn!(
                    transaction_id = %model.transaction_id,
                    recorded = %model.status,
                    reported = %event.status,
                    "Out-of-order webhook delivery ignored"
                );
                self.ignore(
                    event,
                    format!("status {} after {}", event.status, model.status),
                )
                .await;
                Ok(WebhookAck::new(WebhookOutcome::Ignored, transaction_id))
            }
        }
    }

    async fn ignore(&self, event: &WebhookEvent, reason: String) {
        self.event_sender
            .send_or_log(Event::WebhookIgnored {
                external_id: event.external_id.clone(),
                reason,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn totals(authorized: Decimal, captured: Decimal, refunded: Decimal) -> LedgerTotals {
        LedgerTotals {
            authorized,
            captured,
            refunded,
            cancelled: false,
        }
    }

    fn attempt(kind: TransactionType, status: TransactionStatus, amount: Decimal) -> NewTransaction {
        NewTransaction::new(Uuid::new_v4(), kind, status, amount, "USD", "test")
    }

    #[test]
    fn capture_cannot_exceed_authorized_remainder() {
        let t = totals(dec!(10000), dec!(6000), dec!(0));
        assert!(validate_amount(&t, &attempt(TransactionType::Capture, TransactionStatus::Successful, dec!(4000))).is_ok());
        assert_matches!(
            validate_amount(&t, &attempt(TransactionType::Capture, TransactionStatus::Successful, dec!(4001))),
            Err(ServiceError::InvalidState(_))
        );
    }

    #[test]
    fn refund_cannot_exceed_captured_remainder() {
        let t = totals(dec!(10000), dec!(10000), dec!(2500));
        assert!(validate_amount(&t, &attempt(TransactionType::Refund, TransactionStatus::Successful, dec!(7500))).is_ok());
        assert_matches!(
            validate_amount(&t, &attempt(TransactionType::Refund, TransactionStatus::Successful, dec!(7501))),
            Err(ServiceError::InvalidState(_))
        );
    }

    #[test]
    fn unsuccessful_attempts_are_not_bounded() {
        let t = LedgerTotals::default();
        assert!(validate_amount(&t, &attempt(TransactionType::Refund, TransactionStatus::Pending, dec!(1))).is_ok());
        assert!(validate_amount(&t, &attempt(TransactionType::Capture, TransactionStatus::Failed, dec!(1))).is_ok());
    }

    #[test]
    fn summary_derives_remainders() {
        let summary = LedgerSummary::from(totals(dec!(10000), dec!(10000), dec!(2500)));
        assert_eq!(summary.remaining_refundable, dec!(7500));
        assert_eq!(summary.remaining_capturable, dec!(0));
        assert_eq!(summary.payment_status, OrderPaymentStatus::PartiallyRefunded);
    }
}
