use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::CheckoutConfig;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::models::checkout::{Address, Checkout, CheckoutError, CustomerDetails, NewCheckoutItem};
use crate::repositories::checkout_store::CheckoutStore;

/// Request-side checkout API.
///
/// Every mutation loads the whole aggregate, applies the change in memory and
/// persists it under the aggregate's version. A lost race is retried on a
/// fresh copy up to `max_update_retries` times before surfacing
/// [`ServiceError::ConcurrentModification`].
///
/// # Examples
///
/// ```ignore
/// let service = CheckoutService::new(store, clock, event_sender, &config.checkout, "USD");
/// let checkout = service.add_item_for_session("session_123", item).await?;
/// ```
#[derive(Clone)]
pub struct CheckoutService {
    store: Arc<dyn CheckoutStore>,
    clock: Arc<dyn Clock>,
    event_sender: Arc<EventSender>,
    expiry_window: Duration,
    max_update_retries: u32,
    default_currency: String,
}

impl CheckoutService {
    /// Creates a new `CheckoutService`.
    ///
    /// # Arguments
    ///
    /// * `store` - Checkout persistence
    /// * `clock` - Time source for activity stamps
    /// * `event_sender` - Event sender for publishing checkout events
    /// * `config` - Checkout thresholds (expiry window, retry budget)
    /// * `default_currency` - Currency used when a session starts without one
    pub fn new(
        store: Arc<dyn CheckoutStore>,
        clock: Arc<dyn Clock>,
        event_sender: Arc<EventSender>,
        config: &CheckoutConfig,
        default_currency: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            event_sender,
            expiry_window: config.expiry_window(),
            max_update_retries: config.max_update_retries,
            default_currency: default_currency.into(),
        }
    }

    /// Returns the session's active checkout, creating one if there is none.
    #[instrument(skip(self))]
    pub async fn get_or_create_for_session(
        &self,
        session_id: &str,
        currency: Option<&str>,
    ) -> Result<Checkout, ServiceError> {
        match self.store.get_by_session_id(session_id).await {
            Ok(checkout) => return Ok(checkout),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let currency = currency.unwrap_or(&self.default_currency);
        let checkout = Checkout::new(session_id, currency, self.clock.now())?;
        let checkout = self.store.create(&checkout).await?;

        counter!("checkout_ledger.checkout.created", 1);
        info!(checkout_id = %checkout.id, session_id, "Created checkout");
        self.event_sender
            .send_or_log(Event::CheckoutCreated {
                checkout_id: checkout.id,
                session_id: session_id.to_string(),
            })
            .await;
        Ok(checkout)
    }

    pub async fn get(&self, checkout_id: Uuid) -> Result<Checkout, ServiceError> {
        self.store.get_by_id(checkout_id).await
    }

    pub async fn get_by_session_id(&self, session_id: &str) -> Result<Checkout, ServiceError> {
        self.store.get_by_session_id(session_id).await
    }

    pub async fn get_by_user_id(&self, user_id: Uuid) -> Result<Checkout, ServiceError> {
        self.store.get_by_user_id(user_id).await
    }

    /// Load, apply, persist; retried on a stale version.
    async fn mutate<F>(&self, checkout_id: Uuid, operation: &'static str, apply: F) -> Result<Checkout, ServiceError>
    where
        F: Fn(&mut Checkout, DateTime<Utc>) -> Result<(), CheckoutError>,
    {
        let mut attempt = 0;
        loop {
            let mut checkout = self.store.get_by_id(checkout_id).await?;
            apply(&mut checkout, self.clock.now())?;
            checkout.slide_deadline(self.expiry_window);

            match self.store.update(&checkout).await {
                Ok(saved) => return Ok(saved),
                Err(e) if e.is_contention() && attempt < self.max_update_retries => {
                    attempt += 1;
                    counter!("checkout_ledger.checkout.update_retries", 1, "operation" => operation);
                    warn!(%checkout_id, operation, attempt, "Checkout changed concurrently, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Adds an item, creating the session's checkout on first use.
    #[instrument(skip(self, item), fields(product_id = %item.product_id))]
    pub async fn add_item_for_session(
        &self,
        session_id: &str,
        item: NewCheckoutItem,
    ) -> Result<Checkout, ServiceError> {
        let checkout = self.get_or_create_for_session(session_id, None).await?;
        self.add_item(checkout.id, item).await
    }

    #[instrument(skip(self, item), fields(product_id = %item.product_id))]
    pub async fn add_item(&self, checkout_id: Uuid, item: NewCheckoutItem) -> Result<Checkout, ServiceError> {
        let (product_id, variant_id) = (item.product_id, item.variant_id);
        let checkout = self
            .mutate(checkout_id, "add_item", |c, now| c.add_item(item.clone(), now))
            .await?;
        self.event_sender
            .send_or_log(Event::CheckoutItemAdded {
                checkout_id,
                product_id,
                variant_id,
            })
            .await;
        Ok(checkout)
    }

    /// Sets a line's quantity; zero removes the line.
    #[instrument(skip(self))]
    pub async fn update_item(
        &self,
        checkout_id: Uuid,
        product_id: Uuid,
        variant_id: Uuid,
        quantity: i32,
    ) -> Result<Checkout, ServiceError> {
        let checkout = self
            .mutate(checkout_id, "update_item", |c, now| {
                c.update_item(product_id, variant_id, quantity, now)
            })
            .await?;
        let event = if quantity == 0 {
            Event::CheckoutItemRemoved {
                checkout_id,
                product_id,
                variant_id,
            }
        } else {
            Event::CheckoutUpdated(checkout_id)
        };
        self.event_sender.send_or_log(event).await;
        Ok(checkout)
    }

    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        checkout_id: Uuid,
        product_id: Uuid,
        variant_id: Uuid,
    ) -> Result<Checkout, ServiceError> {
        let checkout = self
            .mutate(checkout_id, "remove_item", |c, now| {
                c.remove_item(product_id, variant_id, now)
            })
            .await?;
        self.event_sender
            .send_or_log(Event::CheckoutItemRemoved {
                checkout_id,
                product_id,
                variant_id,
            })
            .await;
        Ok(checkout)
    }

    #[instrument(skip(self))]
    pub async fn clear(&self, checkout_id: Uuid) -> Result<Checkout, ServiceError> {
        let checkout = self.mutate(checkout_id, "clear", |c, now| c.clear(now)).await?;
        self.event_sender
            .send_or_log(Event::CheckoutCleared(checkout_id))
            .await;
        Ok(checkout)
    }

    #[instrument(skip(self, address))]
    pub async fn set_shipping_address(
        &self,
        checkout_id: Uuid,
        address: Address,
    ) -> Result<Checkout, ServiceError> {
        self.mutate_and_announce(checkout_id, "set_shipping_address", |c, now| {
            c.set_shipping_address(address.clone(), now)
        })
        .await
    }

    #[instrument(skip(self, address))]
    pub async fn set_billing_address(
        &self,
        checkout_id: Uuid,
        address: Address,
    ) -> Result<Checkout, ServiceError> {
        self.mutate_and_announce(checkout_id, "set_billing_address", |c, now| {
            c.set_billing_address(address.clone(), now)
        })
        .await
    }

    #[instrument(skip(self, details))]
    pub async fn set_customer_details(
        &self,
        checkout_id: Uuid,
        details: CustomerDetails,
    ) -> Result<Checkout, ServiceError> {
        self.mutate_and_announce(checkout_id, "set_customer_details", |c, now| {
            c.set_customer_details(details.clone(), now)
        })
        .await
    }

    /// Records a shipping rate computed elsewhere.
    #[instrument(skip(self))]
    pub async fn set_shipping_cost(&self, checkout_id: Uuid, amount: Decimal) -> Result<Checkout, ServiceError> {
        self.mutate_and_announce(checkout_id, "set_shipping_cost", |c, now| {
            c.set_shipping_cost(amount, now)
        })
        .await
    }

    /// Applies an already-validated discount. The last applied discount wins.
    #[instrument(skip(self))]
    pub async fn apply_discount(
        &self,
        checkout_id: Uuid,
        code: &str,
        amount: Decimal,
        discount_id: Option<Uuid>,
    ) -> Result<Checkout, ServiceError> {
        self.mutate_and_announce(checkout_id, "apply_discount", |c, now| {
            c.apply_discount(code, amount, discount_id, now)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn remove_discount(&self, checkout_id: Uuid) -> Result<Checkout, ServiceError> {
        self.mutate_and_announce(checkout_id, "remove_discount", |c, now| c.remove_discount(now))
            .await
    }

    async fn mutate_and_announce<F>(
        &self,
        checkout_id: Uuid,
        operation: &'static str,
        apply: F,
    ) -> Result<Checkout, ServiceError>
    where
        F: Fn(&mut Checkout, DateTime<Utc>) -> Result<(), CheckoutError>,
    {
        let checkout = self.mutate(checkout_id, operation, apply).await?;
        self.event_sender
            .send_or_log(Event::CheckoutUpdated(checkout_id))
            .await;
        Ok(checkout)
    }
}
