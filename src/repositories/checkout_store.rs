use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveValue::Set, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection,
    DatabaseTransaction, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::{begin, commit, with_deadline};
use crate::entities::commerce::{checkout, checkout_item, CheckoutStatus};
use crate::errors::ServiceError;
use crate::models::checkout::Checkout;

use super::{BaseRepository, Repository};

/// Persistence contract for checkouts.
///
/// Reads return the whole aggregate. `update` is guarded by the aggregate's
/// `version`; a stale version fails with [`ServiceError::ConcurrentModification`].
/// Sweep listings return candidate ids only, callers re-load before acting.
#[async_trait]
pub trait CheckoutStore: Send + Sync {
    async fn create(&self, checkout: &Checkout) -> Result<Checkout, ServiceError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Checkout, ServiceError>;

    /// Most recent active checkout for the session.
    async fn get_by_session_id(&self, session_id: &str) -> Result<Checkout, ServiceError>;

    /// Most recent active checkout owned by the user.
    async fn get_by_user_id(&self, user_id: Uuid) -> Result<Checkout, ServiceError>;

    /// Persists the aggregate and returns it with its new version.
    async fn update(&self, checkout: &Checkout) -> Result<Checkout, ServiceError>;

    /// Same as [`CheckoutStore::update`] inside a caller-owned transaction.
    /// The caller commits.
    async fn update_in(
        &self,
        txn: &DatabaseTransaction,
        checkout: &Checkout,
    ) -> Result<Checkout, ServiceError>;

    async fn delete(&self, id: Uuid) -> Result<(), ServiceError>;

    /// Deletes only when the row still carries `version`. Returns false on a
    /// version mismatch or when the row is already gone.
    async fn delete_if_version(&self, id: Uuid, version: i32) -> Result<bool, ServiceError>;

    /// Active checkouts without a deadline, with identifying data, idle since `before`.
    async fn list_active_inactive_since(
        &self,
        before: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Uuid>, ServiceError>;

    /// Active checkouts whose deadline passed before `now`.
    async fn list_active_expired_before(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Uuid>, ServiceError>;

    /// Checkouts of any status without customer details or shipping address,
    /// idle since `before`.
    async fn list_stale_by_last_activity(
        &self,
        before: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Uuid>, ServiceError>;

    async fn list_abandoned_updated_before(
        &self,
        before: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Uuid>, ServiceError>;

    async fn list_by_status(
        &self,
        status: CheckoutStatus,
        limit: u64,
    ) -> Result<Vec<Uuid>, ServiceError>;

    async fn count_by_status(&self, status: CheckoutStatus) -> Result<u64, ServiceError>;
}

/// SeaORM-backed checkout store.
#[derive(Debug, Clone)]
pub struct SeaOrmCheckoutStore {
    base: BaseRepository,
}

impl SeaOrmCheckoutStore {
    pub fn new(db: Arc<DatabaseConnection>, store_timeout: Duration) -> Self {
        Self {
            base: BaseRepository::new(db, store_timeout),
        }
    }

    async fn load<C: ConnectionTrait>(conn: &C, model: checkout::Model) -> Result<Checkout, ServiceError> {
        let items = checkout_item::Entity::find()
            .filter(checkout_item::Column::CheckoutId.eq(model.id))
            .order_by_asc(checkout_item::Column::Position)
            .all(conn)
            .await
            .map_err(ServiceError::store_ctx("load items", format!("checkout {}", model.id)))?;
        Checkout::from_models(model, items)
    }

    async fn latest_active<C: ConnectionTrait>(
        conn: &C,
        filter: Condition,
        what: String,
    ) -> Result<Checkout, ServiceError> {
        let model = checkout::Entity::find()
            .filter(filter)
            .filter(checkout::Column::Status.eq(CheckoutStatus::Active))
            .order_by_desc(checkout::Column::CreatedAt)
            .one(conn)
            .await
            .map_err(ServiceError::store_ctx("find checkout", what.clone()))?
            .ok_or_else(|| ServiceError::NotFound(format!("No active checkout for {}", what)))?;
        Self::load(conn, model).await
    }

    async fn insert_items<C: ConnectionTrait>(
        conn: &C,
        checkout_id: Uuid,
        items: Vec<checkout_item::Model>,
    ) -> Result<(), ServiceError> {
        if items.is_empty() {
            return Ok(());
        }
        checkout_item::Entity::insert_many(items.into_iter().map(item_active_model))
            .exec_without_returning(conn)
            .await
            .map_err(ServiceError::store_ctx("insert items", format!("checkout {}", checkout_id)))?;
        Ok(())
    }

    /// Version-guarded write of the row plus a full replace of its items.
    async fn write_update<C: ConnectionTrait>(conn: &C, checkout: &Checkout) -> Result<Checkout, ServiceError> {
        let expected = checkout.version;
        let mut next = checkout.clone();
        next.version = expected + 1;
        let (model, items) = next.to_models()?;

        let result = checkout::Entity::update_many()
            .set(checkout_active_model(model))
            .filter(checkout::Column::Id.eq(checkout.id))
            .filter(checkout::Column::Version.eq(expected))
            .exec(conn)
            .await
            .map_err(ServiceError::store_ctx("update", format!("checkout {}", checkout.id)))?;

        if result.rows_affected == 0 {
            let exists = checkout::Entity::find_by_id(checkout.id)
                .count(conn)
                .await
                .map_err(ServiceError::store_ctx("find", format!("checkout {}", checkout.id)))?
                > 0;
            return Err(if exists {
                ServiceError::ConcurrentModification(checkout.id)
            } else {
                ServiceError::NotFound(format!("Checkout {} not found", checkout.id))
            });
        }

        checkout_item::Entity::delete_many()
            .filter(checkout_item::Column::CheckoutId.eq(checkout.id))
            .exec(conn)
            .await
            .map_err(ServiceError::store_ctx("replace items", format!("checkout {}", checkout.id)))?;
        Self::insert_items(conn, checkout.id, items).await?;
        Ok(next)
    }

    async fn ids<C: ConnectionTrait>(
        conn: &C,
        filter: Condition,
        order: checkout::Column,
        limit: u64,
        operation: &'static str,
    ) -> Result<Vec<Uuid>, ServiceError> {
        checkout::Entity::find()
            .select_only()
            .column(checkout::Column::Id)
            .filter(filter)
            .order_by_asc(order)
            .limit(limit)
            .into_tuple::<Uuid>()
            .all(conn)
            .await
            .map_err(ServiceError::store_ctx(operation, "checkouts"))
    }
}

fn checkout_active_model(model: checkout::Model) -> checkout::ActiveModel {
    checkout::ActiveModel {
        id: Set(model.id),
        session_id: Set(model.session_id),
        user_id: Set(model.user_id),
        status: Set(model.status),
        currency: Set(model.currency),
        total_amount: Set(model.total_amount),
        shipping_cost: Set(model.shipping_cost),
        discount_amount: Set(model.discount_amount),
        final_amount: Set(model.final_amount),
        total_weight: Set(model.total_weight),
        applied_discount: Set(model.applied_discount),
        shipping_address: Set(model.shipping_address),
        billing_address: Set(model.billing_address),
        customer_details: Set(model.customer_details),
        created_at: Set(model.created_at),
        updated_at: Set(model.updated_at),
        last_activity_at: Set(model.last_activity_at),
        expires_at: Set(model.expires_at),
        completed_at: Set(model.completed_at),
        converted_order_id: Set(model.converted_order_id),
        version: Set(model.version),
    }
}

fn item_active_model(model: checkout_item::Model) -> checkout_item::ActiveModel {
    checkout_item::ActiveModel {
        id: Set(model.id),
        checkout_id: Set(model.checkout_id),
        position: Set(model.position),
        product_id: Set(model.product_id),
        variant_id: Set(model.variant_id),
        product_name: Set(model.product_name),
        variant_name: Set(model.variant_name),
        sku: Set(model.sku),
        quantity: Set(model.quantity),
        unit_price: Set(model.unit_price),
        weight: Set(model.weight),
        subtotal: Set(model.subtotal),
        created_at: Set(model.created_at),
        updated_at: Set(model.updated_at),
    }
}

fn has_signal() -> Condition {
    Condition::any()
        .add(checkout::Column::ShippingAddress.is_not_null())
        .add(checkout::Column::CustomerDetails.is_not_null())
}

fn lacks_signal() -> Condition {
    Condition::all()
        .add(checkout::Column::ShippingAddress.is_null())
        .add(checkout::Column::CustomerDetails.is_null())
}

#[async_trait]
impl CheckoutStore for SeaOrmCheckoutStore {
    #[instrument(skip(self, checkout), fields(checkout_id = %checkout.id))]
    async fn create(&self, checkout: &Checkout) -> Result<Checkout, ServiceError> {
        with_deadline(self.base.store_timeout(), "create checkout", async {
            let (model, items) = checkout.to_models()?;
            let txn = begin(self.base.get_db(), "create checkout").await?;

            checkout::Entity::insert(checkout_active_model(model))
                .exec_without_returning(&txn)
                .await
                .map_err(ServiceError::store_ctx("insert", format!("checkout {}", checkout.id)))?;
            Self::insert_items(&txn, checkout.id, items).await?;

            commit(txn, "create checkout").await?;
            debug!("Checkout persisted");
            Ok(checkout.clone())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn get_by_id(&self, id: Uuid) -> Result<Checkout, ServiceError> {
        with_deadline(self.base.store_timeout(), "get checkout", async {
            let db = self.base.get_db();
            let model = checkout::Entity::find_by_id(id)
                .one(db)
                .await
                .map_err(ServiceError::store_ctx("find", format!("checkout {}", id)))?
                .ok_or_else(|| ServiceError::NotFound(format!("Checkout {} not found", id)))?;
            Self::load(db, model).await
        })
        .await
    }

    #[instrument(skip(self))]
    async fn get_by_session_id(&self, session_id: &str) -> Result<Checkout, ServiceError> {
        with_deadline(self.base.store_timeout(), "get checkout by session", async {
            Self::latest_active(
                self.base.get_db(),
                Condition::all().add(checkout::Column::SessionId.eq(session_id)),
                format!("session {}", session_id),
            )
            .await
        })
        .await
    }

    #[instrument(skip(self))]
    async fn get_by_user_id(&self, user_id: Uuid) -> Result<Checkout, ServiceError> {
        with_deadline(self.base.store_timeout(), "get checkout by user", async {
            Self::latest_active(
                self.base.get_db(),
                Condition::all().add(checkout::Column::UserId.eq(user_id)),
                format!("user {}", user_id),
            )
            .await
        })
        .await
    }

    #[instrument(skip(self, checkout), fields(checkout_id = %checkout.id, version = checkout.version))]
    async fn update(&self, checkout: &Checkout) -> Result<Checkout, ServiceError> {
        with_deadline(self.base.store_timeout(), "update checkout", async {
            let txn = begin(self.base.get_db(), "update checkout").await?;
            let next = Self::write_update(&txn, checkout).await?;
            commit(txn, "update checkout").await?;
            Ok(next)
        })
        .await
    }

    #[instrument(skip(self, txn, checkout), fields(checkout_id = %checkout.id, version = checkout.version))]
    async fn update_in(
        &self,
        txn: &DatabaseTransaction,
        checkout: &Checkout,
    ) -> Result<Checkout, ServiceError> {
        Self::write_update(txn, checkout).await
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<(), ServiceError> {
        with_deadline(self.base.store_timeout(), "delete checkout", async {
            let txn = begin(self.base.get_db(), "delete checkout").await?;
            checkout_item::Entity::delete_many()
                .filter(checkout_item::Column::CheckoutId.eq(id))
                .exec(&txn)
                .await
                .map_err(ServiceError::store_ctx("delete items", format!("checkout {}", id)))?;
            let result = checkout::Entity::delete_by_id(id)
                .exec(&txn)
                .await
                .map_err(ServiceError::store_ctx("delete", format!("checkout {}", id)))?;
            if result.rows_affected == 0 {
                return Err(ServiceError::NotFound(format!("Checkout {} not found", id)));
            }
            commit(txn, "delete checkout").await
        })
        .await
    }

    #[instrument(skip(self))]
    async fn delete_if_version(&self, id: Uuid, version: i32) -> Result<bool, ServiceError> {
        with_deadline(self.base.store_timeout(), "delete checkout", async {
            let txn = begin(self.base.get_db(), "delete checkout").await?;
            let result = checkout::Entity::delete_many()
                .filter(checkout::Column::Id.eq(id))
                .filter(checkout::Column::Version.eq(version))
                .exec(&txn)
                .await
                .map_err(ServiceError::store_ctx("delete", format!("checkout {}", id)))?;
            if result.rows_affected == 0 {
                return Ok(false);
            }
            checkout_item::Entity::delete_many()
                .filter(checkout_item::Column::CheckoutId.eq(id))
                .exec(&txn)
                .await
                .map_err(ServiceError::store_ctx("delete items", format!("checkout {}", id)))?;
            commit(txn, "delete checkout").await?;
            Ok(true)
        })
        .await
    }

    async fn list_active_inactive_since(
        &self,
        before: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Uuid>, ServiceError> {
        with_deadline(self.base.store_timeout(), "list inactive checkouts", async {
            let filter = Condition::all()
                .add(checkout::Column::Status.eq(CheckoutStatus::Active))
                .add(checkout::Column::ExpiresAt.is_null())
                .add(checkout::Column::LastActivityAt.lt(before))
                .add(has_signal());
            Self::ids(
                self.base.get_db(),
                filter,
                checkout::Column::LastActivityAt,
                limit,
                "list inactive",
            )
            .await
        })
        .await
    }

    async fn list_active_expired_before(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Uuid>, ServiceError> {
        with_deadline(self.base.store_timeout(), "list expired checkouts", async {
            let filter = Condition::all()
                .add(checkout::Column::Status.eq(CheckoutStatus::Active))
                .add(checkout::Column::ExpiresAt.is_not_null())
                .add(checkout::Column::ExpiresAt.lt(now));
            Self::ids(
                self.base.get_db(),
                filter,
                checkout::Column::ExpiresAt,
                limit,
                "list expired",
            )
            .await
        })
        .await
    }

    async fn list_stale_by_last_activity(
        &self,
        before: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Uuid>, ServiceError> {
        with_deadline(self.base.store_timeout(), "list stale checkouts", async {
            let filter = Condition::all()
                .add(checkout::Column::LastActivityAt.lt(before))
                .add(lacks_signal());
            Self::ids(
                self.base.get_db(),
                filter,
                checkout::Column::LastActivityAt,
                limit,
                "list stale",
            )
            .await
        })
        .await
    }

    async fn list_abandoned_updated_before(
        &self,
        before: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Uuid>, ServiceError> {
        with_deadline(self.base.store_timeout(), "list abandoned checkouts", async {
            let filter = Condition::all()
                .add(checkout::Column::Status.eq(CheckoutStatus::Abandoned))
                .add(checkout::Column::UpdatedAt.lt(before));
            Self::ids(
                self.base.get_db(),
                filter,
                checkout::Column::UpdatedAt,
                limit,
                "list abandoned",
            )
            .await
        })
        .await
    }

    async fn list_by_status(
        &self,
        status: CheckoutStatus,
        limit: u64,
    ) -> Result<Vec<Uuid>, ServiceError> {
        with_deadline(self.base.store_timeout(), "list checkouts by status", async {
            Self::ids(
                self.base.get_db(),
                Condition::all().add(checkout::Column::Status.eq(status)),
                checkout::Column::UpdatedAt,
                limit,
                "list by status",
            )
            .await
        })
        .await
    }

    async fn count_by_status(&self, status: CheckoutStatus) -> Result<u64, ServiceError> {
        with_deadline(self.base.store_timeout(), "count checkouts", async {
            checkout::Entity::find()
                .filter(checkout::Column::Status.eq(status))
                .count(self.base.get_db())
                .await
                .map_err(ServiceError::store_ctx("count", "checkouts"))
        })
        .await
    }
}
