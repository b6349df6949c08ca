use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entities::payment_transaction::{TransactionStatus, TransactionType};
use crate::models::payment_transaction::OrderPaymentStatus;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender together with the receiving end of a bounded channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Publishes without waiting for capacity. A full or closed channel
    /// drops the event with a warning.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.sender.try_send(event) {
            warn!(error = %e, "Dropping domain event");
        }
    }
}

/// Checkout and ledger domain events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    CheckoutCreated {
        checkout_id: Uuid,
        session_id: String,
    },
    CheckoutUpdated(Uuid),
    CheckoutItemAdded {
        checkout_id: Uuid,
        product_id: Uuid,
        variant_id: Uuid,
    },
    CheckoutItemRemoved {
        checkout_id: Uuid,
        product_id: Uuid,
        variant_id: Uuid,
    },
    CheckoutCleared(Uuid),
    CheckoutClaimed {
        checkout_id: Uuid,
        user_id: Uuid,
    },
    CheckoutCompleted {
        checkout_id: Uuid,
        order_id: Uuid,
    },
    CheckoutAbandoned(Uuid),
    CheckoutExpired(Uuid),
    CheckoutDeleted {
        checkout_id: Uuid,
        reason: String,
    },
    SweepFinished {
        abandoned: u64,
        expired: u64,
        deleted: u64,
        failures: u64,
        finished_at: DateTime<Utc>,
    },

    PaymentTransactionRecorded {
        order_id: Uuid,
        transaction_id: String,
        transaction_type: TransactionType,
        status: TransactionStatus,
        amount: Decimal,
    },
    PaymentTransactionUpdated {
        order_id: Uuid,
        transaction_id: String,
        status: TransactionStatus,
    },
    OrderPaymentStatusChanged {
        order_id: Uuid,
        status: OrderPaymentStatus,
    },
    WebhookIgnored {
        external_id: String,
        reason: String,
    },
}

/// Drains the event channel, logging each event until every sender is gone.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::CheckoutCompleted {
                checkout_id,
                order_id,
            } => {
                info!(%checkout_id, %order_id, "Checkout converted to order");
            }
            Event::CheckoutAbandoned(checkout_id) => {
                info!(%checkout_id, "Checkout abandoned");
            }
            Event::CheckoutExpired(checkout_id) => {
                info!(%checkout_id, "Checkout expired");
            }
            Event::CheckoutDeleted {
                checkout_id,
                reason,
            } => {
                info!(%checkout_id, %reason, "Checkout reclaimed");
            }
            Event::SweepFinished {
                abandoned,
                expired,
                deleted,
                failures,
                ..
            } => {
                info!(abandoned, expired, deleted, failures, "Reclamation sweep finished");
            }
            Event::PaymentTransactionRecorded {
                order_id,
                transaction_id,
                transaction_type,
                status,
                amount,
            } => {
                info!(
                    %order_id,
                    %transaction_id,
                    %transaction_type,
                    %status,
                    %amount,
                    "Payment transaction recorded"
                );
            }
            Event::OrderPaymentStatusChanged { order_id, status } => {
                info!(%order_id, %status, "Order payment status changed");
            }
            Event::WebhookIgnored {
                external_id,
                reason,
            } => {
                warn!(%external_id, %reason, "Webhook event ignored");
            }
            other => debug!(event = ?other, "Received event"),
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_or_log_survives_closed_channel() {
        let (sender, rx) = EventSender::channel(1);
        drop(rx);
        sender.send_or_log(Event::CheckoutCleared(Uuid::new_v4())).await;
        assert!(sender.send(Event::CheckoutCleared(Uuid::new_v4())).await.is_err());
    }

    #[tokio::test]
    async fn process_events_stops_when_senders_drop() {
        let (sender, rx) = EventSender::channel(4);
        let handle = tokio::spawn(process_events(rx));
        sender.send(Event::CheckoutAbandoned(Uuid::new_v4())).await.unwrap();
        drop(sender);
        handle.await.unwrap();
    }
}
