use async_trait::async_trait;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait, QueryFilter,
};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::entities::{order, order_item};
use crate::errors::ServiceError;
use crate::models::checkout::{to_json, Checkout};

/// Turns a completable checkout into an order and returns the order id.
///
/// Writes go through `txn`, which also carries the checkout's transition to
/// Completed; nothing the bridge wrote survives if that transition fails.
/// Implementations must be idempotent per checkout: converting the same
/// checkout twice yields the same order id.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderConversionBridge: Send + Sync {
    async fn convert(&self, txn: &DatabaseTransaction, checkout: &Checkout) -> Result<Uuid, ServiceError>;
}

/// Writes `orders` and `order_items` rows through SeaORM.
#[derive(Clone)]
pub struct SeaOrmOrderBridge {
    clock: Arc<dyn Clock>,
}

impl SeaOrmOrderBridge {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    async fn existing<C: ConnectionTrait>(
        conn: &C,
        checkout_id: Uuid,
    ) -> Result<Option<Uuid>, ServiceError> {
        Ok(order::Entity::find()
            .filter(order::Column::CheckoutId.eq(checkout_id))
            .one(conn)
            .await
            .map_err(ServiceError::store_ctx("find order", format!("checkout {}", checkout_id)))?
            .map(|o| o.id))
    }

    async fn insert(&self, txn: &DatabaseTransaction, checkout: &Checkout) -> Result<Uuid, ServiceError> {
        let now = self.clock.now();
        let order_id = Uuid::new_v4();
        let order_number = format!("ORD-{}", order_id.to_string()[..8].to_uppercase());

        let row = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number.clone()),
            checkout_id: Set(checkout.id),
            session_id: Set(checkout.session_id.clone()),
            user_id: Set(checkout.user_id),
            customer_email: Set(checkout
                .customer_details
                .as_ref()
                .and_then(|c| c.email.clone())),
            currency: Set(checkout.currency.clone()),
            total_amount: Set(checkout.total_amount),
            shipping_cost: Set(checkout.shipping_cost),
            discount_amount: Set(checkout.discount_amount),
            final_amount: Set(checkout.final_amount),
            discount_code: Set(checkout.applied_discount.as_ref().map(|d| d.code.clone())),
            shipping_address: Set(to_json(&checkout.shipping_address)?),
            billing_address: Set(to_json(&checkout.billing_address)?),
            created_at: Set(now),
        };
        order::Entity::insert(row)
            .exec_without_returning(txn)
            .await
            .map_err(|e| ServiceError::store("insert order", format!("checkout {}", checkout.id), e))?;

        let items: Vec<order_item::ActiveModel> = checkout
            .items
            .iter()
            .map(|item| order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(item.product_id),
                variant_id: Set(item.variant_id),
                sku: Set(item.sku.clone()),
                name: Set(format!("{} {}", item.product_name, item.variant_name)
                    .trim()
                    .to_string()),
                quantity: Set(item.quantity),
                unit_price: Set(item.unit_price),
                total_price: Set(item.subtotal),
                created_at: Set(now),
            })
            .collect();
        if !items.is_empty() {
            order_item::Entity::insert_many(items)
                .exec_without_returning(txn)
                .await
                .map_err(ServiceError::store_ctx("insert order items", order_number.clone()))?;
        }

        info!(%order_id, %order_number, checkout_id = %checkout.id, "Order staged from checkout");
        Ok(order_id)
    }
}

#[async_trait]
impl OrderConversionBridge for SeaOrmOrderBridge {
    #[instrument(skip(self, txn, checkout), fields(checkout_id = %checkout.id))]
    async fn convert(&self, txn: &DatabaseTransaction, checkout: &Checkout) -> Result<Uuid, ServiceError> {
        if let Some(id) = Self::existing(txn, checkout.id).await? {
            return Ok(id);
        }
        match self.insert(txn, checkout).await {
            // A concurrent completion committed an order for this checkout first.
            Err(ServiceError::Conflict(_)) => Err(ServiceError::ConcurrentModification(checkout.id)),
            other => other,
        }
    }
}
