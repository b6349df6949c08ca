//! Checkout aggregate.
//!
//! A [`Checkout`] is loaded whole, mutated in memory and persisted as one
//! unit. Every mutator validates its input before touching any field, so a
//! failed call leaves the aggregate exactly as it was.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::entities::commerce::{checkout, checkout_item, CheckoutStatus};
use crate::errors::ServiceError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckoutError {
    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(i32),
    #[error("item not in checkout")]
    ItemNotFound { product_id: Uuid, variant_id: Uuid },
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("checkout is {0}, only active checkouts accept changes")]
    NotActive(CheckoutStatus),
}

impl From<CheckoutError> for ServiceError {
    fn from(err: CheckoutError) -> Self {
        match err {
            CheckoutError::ItemNotFound { .. } => ServiceError::NotFound(err.to_string()),
            CheckoutError::NotActive(_) => ServiceError::InvalidState(err.to_string()),
            CheckoutError::InvalidQuantity(_)
            | CheckoutError::InvalidAddress(_)
            | CheckoutError::InvalidInput(_) => ServiceError::InvalidInput(err.to_string()),
        }
    }
}

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

/// Postal address. Only structural checks are applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Address {
    #[validate(custom = "not_blank")]
    pub first_name: String,
    #[validate(custom = "not_blank")]
    pub last_name: String,
    pub company: Option<String>,
    #[validate(custom = "not_blank")]
    pub address_line1: String,
    pub address_line2: Option<String>,
    #[validate(custom = "not_blank")]
    pub city: String,
    pub province: Option<String>,
    #[validate(custom = "not_blank")]
    pub postal_code: String,
    #[validate(custom = "not_blank")]
    pub country_code: String,
    pub phone: Option<String>,
}

impl Address {
    fn check(&self) -> Result<(), CheckoutError> {
        self.validate().map_err(|errors| {
            let mut fields: Vec<&str> = errors.field_errors().keys().copied().collect();
            fields.sort_unstable();
            CheckoutError::InvalidAddress(format!("missing {}", fields.join(", ")))
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct CustomerDetails {
    #[validate(email)]
    pub email: Option<String>,
    pub phone: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl CustomerDetails {
    /// True when any contact or name field carries a non-blank value.
    pub fn is_identifying(&self) -> bool {
        !is_blank(&self.email)
            || !is_blank(&self.phone)
            || !is_blank(&self.first_name)
            || !is_blank(&self.last_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedDiscount {
    pub discount_id: Option<Uuid>,
    pub code: String,
    pub amount: Decimal,
}

/// Input for [`Checkout::add_item`]; a snapshot of catalog data at add time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCheckoutItem {
    pub product_id: Uuid,
    pub variant_id: Uuid,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub weight: Decimal,
    pub product_name: String,
    pub variant_name: String,
    pub sku: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutItem {
    pub id: Uuid,
    pub product_id: Uuid,
    pub variant_id: Uuid,
    pub product_name: String,
    pub variant_name: String,
    pub sku: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub weight: Decimal,
    pub subtotal: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckoutItem {
    fn matches(&self, product_id: Uuid, variant_id: Uuid) -> bool {
        self.product_id == product_id && self.variant_id == variant_id
    }
}

fn overflow(what: &str) -> CheckoutError {
    CheckoutError::InvalidInput(format!("{} overflows", what))
}

fn line_subtotal(unit_price: Decimal, quantity: i32) -> Result<Decimal, CheckoutError> {
    unit_price
        .checked_mul(Decimal::from(quantity))
        .ok_or_else(|| overflow("line amount"))
}

/// `total + shipping - discount`, floored at zero.
fn final_amount(total: Decimal, shipping: Decimal, discount: Decimal) -> Result<Decimal, CheckoutError> {
    let raw = total
        .checked_add(shipping)
        .and_then(|gross| gross.checked_sub(discount))
        .ok_or_else(|| overflow("final amount"))?;
    Ok(raw.max(Decimal::ZERO))
}

#[derive(Debug, Clone, Copy)]
struct Totals {
    total_amount: Decimal,
    total_weight: Decimal,
    final_amount: Decimal,
}

impl Totals {
    fn compute(items: &[CheckoutItem], shipping: Decimal, discount: Decimal) -> Result<Self, CheckoutError> {
        let mut total_amount = Decimal::ZERO;
        let mut total_weight = Decimal::ZERO;
        for item in items {
            total_amount = total_amount
                .checked_add(item.subtotal)
                .ok_or_else(|| overflow("checkout total"))?;
            let line_weight = item
                .weight
                .checked_mul(Decimal::from(item.quantity))
                .ok_or_else(|| overflow("line weight"))?;
            total_weight = total_weight
                .checked_add(line_weight)
                .ok_or_else(|| overflow("checkout weight"))?;
        }
        Ok(Self {
            total_amount,
            total_weight,
            final_amount: final_amount(total_amount, shipping, discount)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkout {
    pub id: Uuid,
    pub session_id: String,
    pub user_id: Option<Uuid>,
    pub status: CheckoutStatus,
    pub currency: String,
    pub items: Vec<CheckoutItem>,
    pub shipping_address: Option<Address>,
    pub billing_address: Option<Address>,
    pub customer_details: Option<CustomerDetails>,
    pub applied_discount: Option<AppliedDiscount>,
    pub total_amount: Decimal,
    pub shipping_cost: Decimal,
    pub discount_amount: Decimal,
    pub final_amount: Decimal,
    pub total_weight: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub converted_order_id: Option<Uuid>,
    pub version: i32,
}

impl Checkout {
    /// Starts an empty, active checkout for a session.
    ///
    /// # Arguments
    /// * `session_id` - Opaque session identifier, must not be blank
    /// * `currency` - ISO-4217 code; normalized to upper case
    /// * `now` - Creation time
    pub fn new(
        session_id: impl Into<String>,
        currency: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, CheckoutError> {
        let session_id = session_id.into();
        if session_id.trim().is_empty() {
            return Err(CheckoutError::InvalidInput(
                "session id must not be blank".to_string(),
            ));
        }
        let currency = normalize_currency(currency)?;

        Ok(Self {
            id: Uuid::new_v4(),
            session_id,
            user_id: None,
            status: CheckoutStatus::Active,
            currency,
            items: Vec::new(),
            shipping_address: None,
            billing_address: None,
            customer_details: None,
            applied_discount: None,
            total_amount: Decimal::ZERO,
            shipping_cost: Decimal::ZERO,
            discount_amount: Decimal::ZERO,
            final_amount: Decimal::ZERO,
            total_weight: Decimal::ZERO,
            created_at: now,
            updated_at: now,
            last_activity_at: now,
            expires_at: None,
            completed_at: None,
            converted_order_id: None,
            version: 1,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == CheckoutStatus::Active
    }

    pub fn ensure_active(&self) -> Result<(), CheckoutError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(CheckoutError::NotActive(self.status))
        }
    }

    pub fn item(&self, product_id: Uuid, variant_id: Uuid) -> Option<&CheckoutItem> {
        self.items.iter().find(|i| i.matches(product_id, variant_id))
    }

    fn position_of(&self, product_id: Uuid, variant_id: Uuid) -> Result<usize, CheckoutError> {
        self.items
            .iter()
            .position(|i| i.matches(product_id, variant_id))
            .ok_or(CheckoutError::ItemNotFound {
                product_id,
                variant_id,
            })
    }

    /// Adds a line, merging into an existing (product, variant) line by
    /// incrementing its quantity.
    pub fn add_item(&mut self, item: NewCheckoutItem, now: DateTime<Utc>) -> Result<(), CheckoutError> {
        self.ensure_active()?;
        if item.quantity <= 0 {
            return Err(CheckoutError::InvalidQuantity(item.quantity));
        }
        if item.unit_price.is_sign_negative() {
            return Err(CheckoutError::InvalidInput(
                "unit price must not be negative".to_string(),
            ));
        }
        if item.weight.is_sign_negative() {
            return Err(CheckoutError::InvalidInput(
                "weight must not be negative".to_string(),
            ));
        }

        let mut items = self.items.clone();
        match items.iter().position(|i| i.matches(item.product_id, item.variant_id)) {
            Some(idx) => {
                let existing = &items[idx];
                let quantity = existing
                    .quantity
                    .checked_add(item.quantity)
                    .ok_or(CheckoutError::InvalidQuantity(item.quantity))?;
                let subtotal = line_subtotal(existing.unit_price, quantity)?;
                let line = &mut items[idx];
                line.quantity = quantity;
                line.subtotal = subtotal;
                line.updated_at = now;
            }
            None => {
                let subtotal = line_subtotal(item.unit_price, item.quantity)?;
                items.push(CheckoutItem {
                    id: Uuid::new_v4(),
                    product_id: item.product_id,
                    variant_id: item.variant_id,
                    product_name: item.product_name,
                    variant_name: item.variant_name,
                    sku: item.sku,
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                    weight: item.weight,
                    subtotal,
                    created_at: now,
                    updated_at: now,
                });
            }
        }

        self.replace_items(items)?;
        self.touch(now);
        Ok(())
    }

    /// Sets a line's quantity. Zero removes the line.
    pub fn update_item(
        &mut self,
        product_id: Uuid,
        variant_id: Uuid,
        quantity: i32,
        now: DateTime<Utc>,
    ) -> Result<(), CheckoutError> {
        self.ensure_active()?;
        let idx = self.position_of(product_id, variant_id)?;
        if quantity < 0 {
            return Err(CheckoutError::InvalidQuantity(quantity));
        }

        let mut items = self.items.clone();
        if quantity == 0 {
            items.remove(idx);
        } else {
            let subtotal = line_subtotal(items[idx].unit_price, quantity)?;
            let line = &mut items[idx];
            line.quantity = quantity;
            line.subtotal = subtotal;
            line.updated_at = now;
        }

        self.replace_items(items)?;
        self.touch(now);
        Ok(())
    }

    pub fn remove_item(
        &mut self,
        product_id: Uuid,
        variant_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), CheckoutError> {
        self.ensure_active()?;
        let idx = self.position_of(product_id, variant_id)?;
        let mut items = self.items.clone();
        items.remove(idx);
        self.replace_items(items)?;
        self.touch(now);
        Ok(())
    }

    /// Empties the item list. Addresses and discount are kept.
    pub fn clear(&mut self, now: DateTime<Utc>) -> Result<(), CheckoutError> {
        self.ensure_active()?;
        self.replace_items(Vec::new())?;
        self.touch(now);
        Ok(())
    }

    pub fn set_shipping_address(&mut self, address: Address, now: DateTime<Utc>) -> Result<(), CheckoutError> {
        self.ensure_active()?;
        address.check()?;
        self.shipping_address = Some(address);
        self.touch(now);
        Ok(())
    }

    pub fn set_billing_address(&mut self, address: Address, now: DateTime<Utc>) -> Result<(), CheckoutError> {
        self.ensure_active()?;
        address.check()?;
        self.billing_address = Some(address);
        self.touch(now);
        Ok(())
    }

    pub fn set_customer_details(
        &mut self,
        details: CustomerDetails,
        now: DateTime<Utc>,
    ) -> Result<(), CheckoutError> {
        self.ensure_active()?;
        if !details.is_identifying() {
            return Err(CheckoutError::InvalidInput(
                "customer details need an email, phone or name".to_string(),
            ));
        }
        details
            .validate()
            .map_err(|_| CheckoutError::InvalidInput("invalid customer email".to_string()))?;
        self.customer_details = Some(details);
        self.touch(now);
        Ok(())
    }

    /// Records an already-computed shipping rate.
    pub fn set_shipping_cost(&mut self, amount: Decimal, now: DateTime<Utc>) -> Result<(), CheckoutError> {
        self.ensure_active()?;
        if amount.is_sign_negative() {
            return Err(CheckoutError::InvalidInput(
                "shipping cost must not be negative".to_string(),
            ));
        }
        self.final_amount = final_amount(self.total_amount, amount, self.discount_amount)?;
        self.shipping_cost = amount;
        self.touch(now);
        Ok(())
    }

    /// Applies a discount, replacing any discount already present.
    pub fn apply_discount(
        &mut self,
        code: &str,
        amount: Decimal,
        discount_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<(), CheckoutError> {
        self.ensure_active()?;
        let code = code.trim();
        if code.is_empty() {
            return Err(CheckoutError::InvalidInput(
                "discount code must not be blank".to_string(),
            ));
        }
        if amount.is_sign_negative() {
            return Err(CheckoutError::InvalidInput(
                "discount amount must not be negative".to_string(),
            ));
        }
        self.final_amount = final_amount(self.total_amount, self.shipping_cost, amount)?;
        self.applied_discount = Some(AppliedDiscount {
            discount_id,
            code: code.to_string(),
            amount,
        });
        self.discount_amount = amount;
        self.touch(now);
        Ok(())
    }

    pub fn remove_discount(&mut self, now: DateTime<Utc>) -> Result<(), CheckoutError> {
        self.ensure_active()?;
        self.final_amount = final_amount(self.total_amount, self.shipping_cost, Decimal::ZERO)?;
        self.applied_discount = None;
        self.discount_amount = Decimal::ZERO;
        self.touch(now);
        Ok(())
    }

    /// Attaches the checkout to a signed-in user.
    pub fn claim_for_user(&mut self, user_id: Uuid, now: DateTime<Utc>) -> Result<(), CheckoutError> {
        self.ensure_active()?;
        self.user_id = Some(user_id);
        self.touch(now);
        Ok(())
    }

    /// Opens (or moves) the completion deadline used by the expiry path.
    pub fn set_deadline(&mut self, window: Duration, now: DateTime<Utc>) -> Result<(), CheckoutError> {
        self.ensure_active()?;
        self.touch(now);
        self.expires_at = Some(now + window);
        Ok(())
    }

    /// Pushes an existing deadline out to `last_activity_at + window`.
    pub fn slide_deadline(&mut self, window: Duration) {
        if self.expires_at.is_some() {
            self.expires_at = Some(self.last_activity_at + window);
        }
    }

    /// Non-blank customer contact/name or a shipping address.
    pub fn has_identifying_signal(&self) -> bool {
        self.shipping_address.is_some()
            || self
                .customer_details
                .as_ref()
                .is_some_and(CustomerDetails::is_identifying)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Checks the preconditions for turning this checkout into an order.
    pub fn ensure_completable(&self) -> Result<(), CheckoutError> {
        self.ensure_active()?;
        if self.items.is_empty() {
            return Err(CheckoutError::InvalidInput("checkout has no items".to_string()));
        }
        match &self.shipping_address {
            Some(address) => address.check(),
            None => Err(CheckoutError::InvalidAddress(
                "shipping address is required".to_string(),
            )),
        }
    }

    pub fn mark_completed(&mut self, order_id: Uuid, now: DateTime<Utc>) -> Result<(), CheckoutError> {
        self.ensure_active()?;
        self.status = CheckoutStatus::Completed;
        self.converted_order_id = Some(order_id);
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_abandoned(&mut self, now: DateTime<Utc>) -> Result<(), CheckoutError> {
        self.ensure_active()?;
        self.status = CheckoutStatus::Abandoned;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_expired(&mut self, now: DateTime<Utc>) -> Result<(), CheckoutError> {
        self.ensure_active()?;
        self.status = CheckoutStatus::Expired;
        self.updated_at = now;
        Ok(())
    }

    /// Inactivity longer than `threshold` with a signal worth following up.
    /// Checkouts holding a deadline are left to the expiry path.
    pub fn is_abandonable(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.is_active()
            && self.expires_at.is_none()
            && now - self.last_activity_at > threshold
            && self.has_identifying_signal()
    }

    pub fn is_expirable(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.expires_at.is_some_and(|deadline| now > deadline)
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = now;
        self.updated_at = now;
    }

    /// Swaps in `items` once their totals are known to fit.
    fn replace_items(&mut self, items: Vec<CheckoutItem>) -> Result<(), CheckoutError> {
        let totals = Totals::compute(&items, self.shipping_cost, self.discount_amount)?;
        self.items = items;
        self.total_amount = totals.total_amount;
        self.total_weight = totals.total_weight;
        self.final_amount = totals.final_amount;
        Ok(())
    }

    /// Splits the aggregate into its row models.
    pub fn to_models(&self) -> Result<(checkout::Model, Vec<checkout_item::Model>), ServiceError> {
        let model = checkout::Model {
            id: self.id,
            session_id: self.session_id.clone(),
            user_id: self.user_id,
            status: self.status,
            currency: self.currency.clone(),
            total_amount: self.total_amount,
            shipping_cost: self.shipping_cost,
            discount_amount: self.discount_amount,
            final_amount: self.final_amount,
            total_weight: self.total_weight,
            applied_discount: to_json(&self.applied_discount)?,
            shipping_address: to_json(&self.shipping_address)?,
            billing_address: to_json(&self.billing_address)?,
            customer_details: to_json(&self.customer_details)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_activity_at: self.last_activity_at,
            expires_at: self.expires_at,
            completed_at: self.completed_at,
            converted_order_id: self.converted_order_id,
            version: self.version,
        };

        let items = self
            .items
            .iter()
            .enumerate()
            .map(|(position, item)| checkout_item::Model {
                id: item.id,
                checkout_id: self.id,
                position: position as i32,
                product_id: item.product_id,
                variant_id: item.variant_id,
                product_name: item.product_name.clone(),
                variant_name: item.variant_name.clone(),
                sku: item.sku.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price,
                weight: item.weight,
                subtotal: item.subtotal,
                created_at: item.created_at,
                updated_at: item.updated_at,
            })
            .collect();

        Ok((model, items))
    }

    /// Rebuilds the aggregate from its rows. Items are ordered by position.
    pub fn from_models(
        model: checkout::Model,
        mut items: Vec<checkout_item::Model>,
    ) -> Result<Self, ServiceError> {
        items.sort_by_key(|i| i.position);
        Ok(Self {
            id: model.id,
            session_id: model.session_id,
            user_id: model.user_id,
            status: model.status,
            currency: model.currency,
            items: items
                .into_iter()
                .map(|i| CheckoutItem {
                    id: i.id,
                    product_id: i.product_id,
                    variant_id: i.variant_id,
                    product_name: i.product_name,
                    variant_name: i.variant_name,
                    sku: i.sku,
                    quantity: i.quantity,
                    unit_price: i.unit_price,
                    weight: i.weight,
                    subtotal: i.subtotal,
                    created_at: i.created_at,
                    updated_at: i.updated_at,
                })
                .collect(),
            shipping_address: from_json(model.shipping_address, "shipping_address")?,
            billing_address: from_json(model.billing_address, "billing_address")?,
            customer_details: from_json(model.customer_details, "customer_details")?,
            applied_discount: from_json(model.applied_discount, "applied_discount")?,
            total_amount: model.total_amount,
            shipping_cost: model.shipping_cost,
            discount_amount: model.discount_amount,
            final_amount: model.final_amount,
            total_weight: model.total_weight,
            created_at: model.created_at,
            updated_at: model.updated_at,
            last_activity_at: model.last_activity_at,
            expires_at: model.expires_at,
            completed_at: model.completed_at,
            converted_order_id: model.converted_order_id,
            version: model.version,
        })
    }
}

/// Validates and upper-cases an ISO-4217 currency code.
pub fn normalize_currency(currency: &str) -> Result<String, CheckoutError> {
    let code = currency.trim();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(CheckoutError::InvalidInput(format!(
            "invalid currency code '{}'",
            currency
        )));
    }
    Ok(code.to_ascii_uppercase())
}

pub(crate) fn to_json<T: Serialize>(value: &Option<T>) -> Result<Option<serde_json::Value>, ServiceError> {
    value
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| ServiceError::InternalError(format!("failed to encode checkout field: {}", e)))
}

fn from_json<T: serde::de::DeserializeOwned>(
    value: Option<serde_json::Value>,
    field: &str,
) -> Result<Option<T>, ServiceError> {
    value
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| ServiceError::InternalError(format!("corrupt checkout {}: {}", field, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn line(product_id: Uuid, variant_id: Uuid, quantity: i32, price: Decimal) -> NewCheckoutItem {
        NewCheckoutItem {
            product_id,
            variant_id,
            quantity,
            unit_price: price,
            weight: dec!(0.5),
            product_name: "Trail Shoe".to_string(),
            variant_name: "EU 42".to_string(),
            sku: "TS-42".to_string(),
        }
    }

    fn address() -> Address {
        Address {
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            company: None,
            address_line1: "12 Analytical Row".to_string(),
            address_line2: None,
            city: "London".to_string(),
            province: None,
            postal_code: "N1 9GU".to_string(),
            country_code: "GB".to_string(),
            phone: None,
        }
    }

    #[test]
    fn add_remove_scenario_recomputes_totals() {
        let mut checkout = Checkout::new("sess-1", "usd", t0()).unwrap();
        assert_eq!(checkout.currency, "USD");
        let (p1, v1, p2, v2) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        checkout.add_item(line(p1, v1, 2, dec!(1000)), t0()).unwrap();
        checkout.add_item(line(p2, v2, 1, dec!(2000)), t0()).unwrap();
        assert_eq!(checkout.total_amount, dec!(4000));
        assert_eq!(checkout.total_weight, dec!(1.5));

        checkout.remove_item(p1, v1, t0()).unwrap();
        assert_eq!(checkout.total_amount, dec!(2000));
        assert_eq!(checkout.items.len(), 1);
        assert!(checkout.item(p1, v1).is_none());
    }

    #[test]
    fn add_item_merges_same_variant() {
        let mut checkout = Checkout::new("sess-1", "USD", t0()).unwrap();
        let (p, v) = (Uuid::new_v4(), Uuid::new_v4());
        checkout.add_item(line(p, v, 1, dec!(250)), t0()).unwrap();
        checkout.add_item(line(p, v, 3, dec!(250)), t0()).unwrap();

        assert_eq!(checkout.items.len(), 1);
        assert_eq!(checkout.items[0].quantity, 4);
        assert_eq!(checkout.items[0].subtotal, dec!(1000));
    }

    #[test]
    fn invalid_quantity_leaves_checkout_untouched() {
        let mut checkout = Checkout::new("sess-1", "USD", t0()).unwrap();
        let before = checkout.clone();
        let later = t0() + Duration::minutes(5);

        let err = checkout
            .add_item(line(Uuid::new_v4(), Uuid::new_v4(), 0, dec!(10)), later)
            .unwrap_err();
        assert_matches!(err, CheckoutError::InvalidQuantity(0));
        assert_eq!(checkout, before);
    }

    #[test]
    fn overflowing_totals_leave_checkout_untouched() {
        let mut checkout = Checkout::new("sess-1", "USD", t0()).unwrap();
        checkout
            .add_item(line(Uuid::new_v4(), Uuid::new_v4(), 1, dec!(10)), t0())
            .unwrap();
        let before = checkout.clone();
        let later = t0() + Duration::minutes(5);

        let mut heavy = line(Uuid::new_v4(), Uuid::new_v4(), 2, dec!(1));
        heavy.weight = Decimal::MAX;
        assert_matches!(checkout.add_item(heavy, later), Err(CheckoutError::InvalidInput(_)));
        assert_eq!(checkout, before);

        let pricey = line(Uuid::new_v4(), Uuid::new_v4(), 1, Decimal::MAX);
        assert_matches!(checkout.add_item(pricey, later), Err(CheckoutError::InvalidInput(_)));
        assert_eq!(checkout, before);

        assert_matches!(
            checkout.set_shipping_cost(Decimal::MAX, later),
            Err(CheckoutError::InvalidInput(_))
        );
        assert_eq!(checkout, before);
    }

    #[test]
    fn update_item_to_zero_removes_line() {
        let mut checkout = Checkout::new("sess-1", "USD", t0()).unwrap();
        let (p, v) = (Uuid::new_v4(), Uuid::new_v4());
        checkout.add_item(line(p, v, 2, dec!(10)), t0()).unwrap();

        checkout.update_item(p, v, 0, t0()).unwrap();
        assert!(checkout.is_empty());
        assert_eq!(checkout.total_amount, Decimal::ZERO);

        assert_matches!(
            checkout.update_item(p, v, 1, t0()),
            Err(CheckoutError::ItemNotFound { .. })
        );
    }

    #[test]
    fn negative_update_is_rejected() {
        let mut checkout = Checkout::new("sess-1", "USD", t0()).unwrap();
        let (p, v) = (Uuid::new_v4(), Uuid::new_v4());
        checkout.add_item(line(p, v, 2, dec!(10)), t0()).unwrap();
        assert_matches!(
            checkout.update_item(p, v, -1, t0()),
            Err(CheckoutError::InvalidQuantity(-1))
        );
        assert_eq!(checkout.items[0].quantity, 2);
    }

    #[test]
    fn clear_keeps_address_and_discount() {
        let mut checkout = Checkout::new("sess-1", "USD", t0()).unwrap();
        checkout
            .add_item(line(Uuid::new_v4(), Uuid::new_v4(), 2, dec!(10)), t0())
            .unwrap();
        checkout.set_shipping_address(address(), t0()).unwrap();
        checkout.apply_discount("SPRING", dec!(5), None, t0()).unwrap();

        checkout.clear(t0()).unwrap();
        assert!(checkout.items.is_empty());
        assert_eq!(checkout.total_amount, Decimal::ZERO);
        assert_eq!(checkout.total_weight, Decimal::ZERO);
        assert_eq!(checkout.final_amount, Decimal::ZERO);
        assert!(checkout.shipping_address.is_some());
        assert_eq!(checkout.discount_amount, dec!(5));
    }

    #[test]
    fn discount_replaces_and_clamps_final_amount() {
        let mut checkout = Checkout::new("sess-1", "USD", t0()).unwrap();
        checkout
            .add_item(line(Uuid::new_v4(), Uuid::new_v4(), 1, dec!(30)), t0())
            .unwrap();
        checkout.set_shipping_cost(dec!(5), t0()).unwrap();
        checkout.apply_discount("TEN", dec!(10), None, t0()).unwrap();
        assert_eq!(checkout.final_amount, dec!(25));

        checkout.apply_discount("HUGE", dec!(100), None, t0()).unwrap();
        assert_eq!(checkout.applied_discount.as_ref().unwrap().code, "HUGE");
        assert_eq!(checkout.final_amount, Decimal::ZERO);

        checkout.remove_discount(t0()).unwrap();
        assert_eq!(checkout.final_amount, dec!(35));
    }

    #[test]
    fn blank_discount_code_is_rejected() {
        let mut checkout = Checkout::new("sess-1", "USD", t0()).unwrap();
        assert_matches!(
            checkout.apply_discount("  ", dec!(1), None, t0()),
            Err(CheckoutError::InvalidInput(_))
        );
        assert_matches!(
            checkout.apply_discount("X", dec!(-1), None, t0()),
            Err(CheckoutError::InvalidInput(_))
        );
    }

    #[test]
    fn address_requires_structural_fields() {
        let mut checkout = Checkout::new("sess-1", "USD", t0()).unwrap();
        let mut bad = address();
        bad.city = "   ".to_string();
        let err = checkout.set_shipping_address(bad, t0()).unwrap_err();
        assert_matches!(err, CheckoutError::InvalidAddress(ref msg) if msg.contains("city"));
        assert!(checkout.shipping_address.is_none());
    }

    #[test]
    fn identifying_signal_from_details_or_address() {
        let mut checkout = Checkout::new("sess-1", "USD", t0()).unwrap();
        assert!(!checkout.has_identifying_signal());

        checkout
            .set_customer_details(
                CustomerDetails {
                    email: Some("ada@example.com".to_string()),
                    ..Default::default()
                },
                t0(),
            )
            .unwrap();
        assert!(checkout.has_identifying_signal());

        let mut other = Checkout::new("sess-2", "USD", t0()).unwrap();
        other.set_shipping_address(address(), t0()).unwrap();
        assert!(other.has_identifying_signal());
    }

    #[test]
    fn customer_details_need_some_value() {
        let mut checkout = Checkout::new("sess-1", "USD", t0()).unwrap();
        assert_matches!(
            checkout.set_customer_details(CustomerDetails::default(), t0()),
            Err(CheckoutError::InvalidInput(_))
        );
        assert_matches!(
            checkout.set_customer_details(
                CustomerDetails {
                    email: Some("not-an-email".to_string()),
                    ..Default::default()
                },
                t0()
            ),
            Err(CheckoutError::InvalidInput(_))
        );
    }

    #[test]
    fn mutations_bump_activity() {
        let mut checkout = Checkout::new("sess-1", "USD", t0()).unwrap();
        let later = t0() + Duration::minutes(3);
        checkout
            .add_item(line(Uuid::new_v4(), Uuid::new_v4(), 1, dec!(1)), later)
            .unwrap();
        assert_eq!(checkout.last_activity_at, later);
        assert_eq!(checkout.updated_at, later);
    }

    #[test]
    fn terminal_checkouts_reject_mutations() {
        let mut checkout = Checkout::new("sess-1", "USD", t0()).unwrap();
        checkout.mark_abandoned(t0()).unwrap();
        let err = checkout.clear(t0()).unwrap_err();
        assert_matches!(err, CheckoutError::NotActive(CheckoutStatus::Abandoned));
        assert_matches!(ServiceError::from(err), ServiceError::InvalidState(_));
    }

    #[test]
    fn completion_requires_items_and_address() {
        let mut checkout = Checkout::new("sess-1", "USD", t0()).unwrap();
        assert_matches!(checkout.ensure_completable(), Err(CheckoutError::InvalidInput(_)));

        checkout
            .add_item(line(Uuid::new_v4(), Uuid::new_v4(), 1, dec!(1)), t0())
            .unwrap();
        assert_matches!(checkout.ensure_completable(), Err(CheckoutError::InvalidAddress(_)));

        checkout.set_shipping_address(address(), t0()).unwrap();
        assert!(checkout.ensure_completable().is_ok());
    }

    #[test]
    fn abandonment_needs_signal_and_inactivity() {
        let threshold = Duration::minutes(15);
        let mut checkout = Checkout::new("sess-1", "USD", t0()).unwrap();
        let later = t0() + Duration::minutes(20);
        assert!(!checkout.is_abandonable(later, threshold));

        checkout.set_shipping_address(address(), t0()).unwrap();
        assert!(checkout.is_abandonable(later, threshold));
        assert!(!checkout.is_abandonable(t0() + Duration::minutes(10), threshold));
    }

    #[test]
    fn open_deadline_defers_abandonment() {
        let mut checkout = Checkout::new("sess-1", "USD", t0()).unwrap();
        checkout.set_shipping_address(address(), t0()).unwrap();
        checkout.set_deadline(Duration::hours(1), t0()).unwrap();

        let later = t0() + Duration::minutes(20);
        assert!(!checkout.is_abandonable(later, Duration::minutes(15)));
        assert!(!checkout.is_expirable(later));
        assert!(checkout.is_expirable(t0() + Duration::minutes(61)));
    }

    #[test]
    fn deadline_slides_with_activity() {
        let mut checkout = Checkout::new("sess-1", "USD", t0()).unwrap();
        checkout.slide_deadline(Duration::minutes(30));
        assert!(checkout.expires_at.is_none());

        checkout.set_deadline(Duration::minutes(30), t0()).unwrap();
        let later = t0() + Duration::minutes(10);
        checkout
            .add_item(line(Uuid::new_v4(), Uuid::new_v4(), 1, dec!(1)), later)
            .unwrap();
        checkout.slide_deadline(Duration::minutes(30));
        assert_eq!(checkout.expires_at, Some(later + Duration::minutes(30)));
    }

    #[test]
    fn model_conversion_preserves_order_and_fields() {
        let mut checkout = Checkout::new("sess-1", "USD", t0()).unwrap();
        for price in [dec!(1), dec!(2), dec!(3)] {
            checkout
                .add_item(line(Uuid::new_v4(), Uuid::new_v4(), 1, price), t0())
                .unwrap();
        }
        checkout.set_shipping_address(address(), t0()).unwrap();

        let (model, mut items) = checkout.to_models().unwrap();
        items.reverse();
        let restored = Checkout::from_models(model, items).unwrap();
        assert_eq!(restored, checkout);
    }

    #[test]
    fn currency_must_be_three_letters() {
        assert_matches!(
            Checkout::new("sess-1", "US", t0()),
            Err(CheckoutError::InvalidInput(_))
        );
        assert_matches!(
            Checkout::new("sess-1", "U5D", t0()),
            Err(CheckoutError::InvalidInput(_))
        );
        assert_matches!(Checkout::new(" ", "USD", t0()), Err(CheckoutError::InvalidInput(_)));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8, i32, u32),
        Update(u8, i32),
        Remove(u8),
        Discount(u32),
        Clear,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4, 1i32..5, 0u32..5_000).prop_map(|(k, q, p)| Op::Add(k, q, p)),
            (0u8..4, 0i32..5).prop_map(|(k, q)| Op::Update(k, q)),
            (0u8..4).prop_map(Op::Remove),
            (0u32..20_000).prop_map(Op::Discount),
            Just(Op::Clear),
        ]
    }

    proptest! {
        #[test]
        fn totals_track_items_and_final_never_negative(ops in proptest::collection::vec(op(), 1..40)) {
            let keys: Vec<(Uuid, Uuid)> = (0..4).map(|_| (Uuid::new_v4(), Uuid::new_v4())).collect();
            let mut checkout = Checkout::new("sess-prop", "USD", t0()).unwrap();

            for op in ops {
                let _ = match op {
                    Op::Add(k, q, p) => {
                        let (pid, vid) = keys[k as usize];
                        checkout.add_item(line(pid, vid, q, Decimal::from(p)), t0())
                    }
                    Op::Update(k, q) => {
                        let (pid, vid) = keys[k as usize];
                        checkout.update_item(pid, vid, q, t0())
                    }
                    Op::Remove(k) => {
                        let (pid, vid) = keys[k as usize];
                        checkout.remove_item(pid, vid, t0())
                    }
                    Op::Discount(a) => checkout.apply_discount("PROP", Decimal::from(a), None, t0()),
                    Op::Clear => checkout.clear(t0()),
                };

                let expected: Decimal = checkout.items.iter().map(|i| i.unit_price * Decimal::from(i.quantity)).sum();
                prop_assert_eq!(checkout.total_amount, expected);
                prop_assert!(checkout.final_amount >= Decimal::ZERO);

                let mut seen = std::collections::HashSet::new();
                for item in &checkout.items {
                    prop_assert!(seen.insert((item.product_id, item.variant_id)));
                    prop_assert!(item.quantity > 0);
                }
            }
        }
    }
}
