use async_trait::async_trait;
use chrono::Datelike;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait,
    ActiveValue::{NotSet, Set, Unchanged},
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::clock::Clock;
use crate::db::{begin, commit, with_deadline};
use crate::entities::payment_transaction::{self, TransactionStatus, TransactionType};
use crate::entities::transaction_sequence;
use crate::errors::ServiceError;
use crate::models::payment_transaction::{
    derive_rollups, format_transaction_id, parse_transaction_id, transaction_id_prefix,
    LedgerTotals, NewTransaction,
};

use super::{BaseRepository, Repository};

const SEQUENCE_ATTEMPTS: usize = 5;

/// How a write lands in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Always insert a new row.
    Append,
    /// Overwrite the latest row for (order, type), inserting when none exists.
    Upsert,
}

/// What [`TransactionStore::record_external`] did with a gateway report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalWrite {
    /// No row carried the external id yet; one was written.
    Inserted,
    /// The row holding the external id moved forward.
    Updated,
    /// Same status and amount as already recorded.
    Unchanged,
    /// The report would move the row backwards; nothing was written.
    Stale,
}

/// How a repeated report relates to the row already holding its external id.
/// Amounts may only change while the row is pending.
pub fn classify_redelivery(row: &payment_transaction::Model, tx: &NewTransaction) -> ExternalWrite {
    if row.status == tx.status {
        if row.amount == tx.amount {
            ExternalWrite::Unchanged
        } else if row.status == TransactionStatus::Pending {
            ExternalWrite::Updated
        } else {
            ExternalWrite::Stale
        }
    } else if row.status.can_transition_to(tx.status) {
        ExternalWrite::Updated
    } else {
        ExternalWrite::Stale
    }
}

/// Check run against the order's totals before a write, inside the same
/// database transaction.
pub type WriteGuard = fn(&LedgerTotals, &NewTransaction) -> Result<(), ServiceError>;

/// Persistence contract for payment transactions.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Inserts a new row, generating a transaction id when none is given.
    async fn create(&self, tx: NewTransaction) -> Result<payment_transaction::Model, ServiceError>;

    /// Upserts on (order_id, transaction_type); id and transaction id survive.
    async fn create_or_update(
        &self,
        tx: NewTransaction,
    ) -> Result<payment_transaction::Model, ServiceError>;

    /// Writes `tx` and returns the order's totals from the same transaction.
    async fn write_and_total(
        &self,
        tx: NewTransaction,
        mode: WriteMode,
        guard: Option<WriteGuard>,
    ) -> Result<(payment_transaction::Model, LedgerTotals), ServiceError>;

    /// Applies a gateway report keyed on (order, type, external id) in one
    /// transaction: an unseen external id is written per `mode`, a known one
    /// only moves forward. Returns the order's totals after the write.
    async fn record_external(
        &self,
        tx: NewTransaction,
        mode: WriteMode,
    ) -> Result<(ExternalWrite, payment_transaction::Model, LedgerTotals), ServiceError>;

    async fn get_by_id(&self, id: i64) -> Result<payment_transaction::Model, ServiceError>;

    async fn get_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<payment_transaction::Model, ServiceError>;

    async fn get_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<payment_transaction::Model, ServiceError>;

    async fn get_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<payment_transaction::Model, ServiceError>;

    /// All rows for the order in creation order.
    async fn get_by_order_id(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<payment_transaction::Model>, ServiceError>;

    async fn get_latest_by_order_id_and_type(
        &self,
        order_id: Uuid,
        transaction_type: TransactionType,
    ) -> Result<payment_transaction::Model, ServiceError>;

    async fn sum_authorized_amount_by_order_id(&self, order_id: Uuid) -> Result<Decimal, ServiceError>;

    async fn sum_captured_amount_by_order_id(&self, order_id: Uuid) -> Result<Decimal, ServiceError>;

    async fn sum_refunded_amount_by_order_id(&self, order_id: Uuid) -> Result<Decimal, ServiceError>;

    async fn sum_amount_by_order_id_and_type(
        &self,
        order_id: Uuid,
        transaction_type: TransactionType,
    ) -> Result<Decimal, ServiceError>;

    async fn count_successful_by_order_id_and_type(
        &self,
        order_id: Uuid,
        transaction_type: TransactionType,
    ) -> Result<u64, ServiceError>;

    async fn totals(&self, order_id: Uuid) -> Result<LedgerTotals, ServiceError>;

    /// Saves a modified row. Rollups are re-derived from type, status and amount.
    async fn update(
        &self,
        model: payment_transaction::Model,
    ) -> Result<payment_transaction::Model, ServiceError>;

    async fn delete(&self, id: i64) -> Result<(), ServiceError>;
}

/// SeaORM-backed ledger store.
#[derive(Debug, Clone)]
pub struct SeaOrmTransactionStore {
    base: BaseRepository,
    clock: Arc<dyn Clock>,
}

impl SeaOrmTransactionStore {
    pub fn new(db: Arc<DatabaseConnection>, store_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            base: BaseRepository::new(db, store_timeout),
            clock,
        }
    }

    fn check(tx: &NewTransaction) -> Result<(), ServiceError> {
        tx.validate()?;
        if tx.amount.is_sign_negative() {
            return Err(ServiceError::InvalidInput(
                "transaction amount must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Allocates the next number for (type, year) from the counter table,
    /// seeding it from existing identifiers on first use.
    async fn next_sequence<C: ConnectionTrait>(
        &self,
        conn: &C,
        transaction_type: TransactionType,
        year: i32,
    ) -> Result<i64, ServiceError> {
        let code = transaction_type.code();

        for attempt in 1..=SEQUENCE_ATTEMPTS {
            let current = transaction_sequence::Entity::find_by_id((code.to_string(), year))
                .one(conn)
                .await
                .map_err(ServiceError::store_ctx("read sequence", code))?;

            match current {
                None => {
                    let seed = Self::seed_sequence(conn, transaction_type, year).await?;
                    let row = transaction_sequence::ActiveModel {
                        type_code: Set(code.to_string()),
                        year: Set(year),
                        last_value: Set(seed + 1),
                        updated_at: Set(self.clock.now()),
                    };
                    match transaction_sequence::Entity::insert(row)
                        .exec_without_returning(conn)
                        .await
                    {
                        Ok(_) => return Ok(seed + 1),
                        Err(e) => match ServiceError::store("seed sequence", code, e) {
                            ServiceError::Conflict(_) => {
                                warn!(code, year, attempt, "Sequence seeded concurrently, retrying");
                            }
                            other => return Err(other),
                        },
                    }
                }
                Some(row) => {
                    let next = row.last_value + 1;
                    let result = transaction_sequence::Entity::update_many()
                        .set(transaction_sequence::ActiveModel {
                            last_value: Set(next),
                            updated_at: Set(self.clock.now()),
                            ..Default::default()
                        })
                        .filter(transaction_sequence::Column::TypeCode.eq(code))
                        .filter(transaction_sequence::Column::Year.eq(year))
                        .filter(transaction_sequence::Column::LastValue.eq(row.last_value))
                        .exec(conn)
                        .await
                        .map_err(ServiceError::store_ctx("advance sequence", code))?;
                    if result.rows_affected == 1 {
                        return Ok(next);
                    }
                    debug!(code, year, attempt, "Sequence advanced concurrently, retrying");
                }
            }
        }

        Err(ServiceError::Conflict(format!(
            "could not allocate a {} transaction number for {}",
            code, year
        )))
    }

    /// Highest number already in use for (type, year): the larger of the row
    /// count and the biggest parsed sequence.
    async fn seed_sequence<C: ConnectionTrait>(
        conn: &C,
        transaction_type: TransactionType,
        year: i32,
    ) -> Result<i64, ServiceError> {
        let prefix = transaction_id_prefix(transaction_type, year);
        let ids: Vec<String> = payment_transaction::Entity::find()
            .select_only()
            .column(payment_transaction::Column::TransactionId)
            .filter(payment_transaction::Column::TransactionId.starts_with(prefix.as_str()))
            .into_tuple()
            .all(conn)
            .await
            .map_err(ServiceError::store_ctx("seed sequence", prefix.clone()))?;

        let (count, max) = ids
            .iter()
            .filter_map(|id| parse_transaction_id(id))
            .fold((0i64, 0i64), |(count, max), parsed| {
                (count + 1, max.max(parsed.sequence))
            });
        Ok(count.max(max))
    }

    async fn insert_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        tx: NewTransaction,
    ) -> Result<payment_transaction::Model, ServiceError> {
        Self::check(&tx)?;
        let now = self.clock.now();

        let transaction_id = match tx.transaction_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let year = now.year();
                let seq = self.next_sequence(conn, tx.transaction_type, year).await?;
                format_transaction_id(tx.transaction_type, year, seq)
            }
        };

        let rollups = derive_rollups(tx.transaction_type, tx.status, tx.amount);
        let row = payment_transaction::ActiveModel {
            id: NotSet,
            transaction_id: Set(transaction_id.clone()),
            idempotency_key: Set(tx.idempotency_key),
            external_id: Set(tx.external_id),
            order_id: Set(tx.order_id),
            transaction_type: Set(tx.transaction_type),
            status: Set(tx.status),
            amount: Set(tx.amount),
            authorized_amount: Set(rollups.authorized),
            captured_amount: Set(rollups.captured),
            refunded_amount: Set(rollups.refunded),
            currency: Set(tx.currency.to_ascii_uppercase()),
            provider: Set(tx.provider),
            raw_response: Set(tx.raw_response),
            metadata: Set(tx.metadata),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let model = row
            .insert(conn)
            .await
            .map_err(ServiceError::store_ctx("insert", format!("transaction {}", transaction_id)))?;
        debug!(transaction_id = %model.transaction_id, id = model.id, "Transaction inserted");
        Ok(model)
    }

    async fn latest_in<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
        transaction_type: TransactionType,
    ) -> Result<Option<payment_transaction::Model>, ServiceError> {
        payment_transaction::Entity::find()
            .filter(payment_transaction::Column::OrderId.eq(order_id))
            .filter(payment_transaction::Column::TransactionType.eq(transaction_type))
            .order_by_desc(payment_transaction::Column::Id)
            .one(conn)
            .await
            .map_err(ServiceError::store_ctx("find latest", format!("order {}", order_id)))
    }

    async fn upsert_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        tx: NewTransaction,
    ) -> Result<payment_transaction::Model, ServiceError> {
        Self::check(&tx)?;
        let Some(mut existing) = Self::latest_in(conn, tx.order_id, tx.transaction_type).await?
        else {
            return self.insert_in(conn, tx).await;
        };

        existing.status = tx.status;
        existing.amount = tx.amount;
        if tx.external_id.is_some() {
            existing.external_id = tx.external_id;
        }
        if tx.raw_response.is_some() {
            existing.raw_response = tx.raw_response;
        }
        if tx.metadata.is_some() {
            existing.metadata = tx.metadata;
        }
        self.save_in(conn, existing).await
    }

    async fn save_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        mut model: payment_transaction::Model,
    ) -> Result<payment_transaction::Model, ServiceError> {
        model.apply_rollups();
        model.updated_at = self.clock.now();
        let id = model.id;

        let row = payment_transaction::ActiveModel {
            id: Unchanged(model.id),
            transaction_id: Set(model.transaction_id),
            idempotency_key: Set(model.idempotency_key),
            external_id: Set(model.external_id),
            order_id: Set(model.order_id),
            transaction_type: Set(model.transaction_type),
            status: Set(model.status),
            amount: Set(model.amount),
            authorized_amount: Set(model.authorized_amount),
            captured_amount: Set(model.captured_amount),
            refunded_amount: Set(model.refunded_amount),
            currency: Set(model.currency),
            provider: Set(model.provider),
            raw_response: Set(model.raw_response),
            metadata: Set(model.metadata),
            created_at: Set(model.created_at),
            updated_at: Set(model.updated_at),
        };

        row.update(conn).await.map_err(|e| match e {
            sea_orm::DbErr::RecordNotUpdated => {
                ServiceError::NotFound(format!("Transaction {} not found", id))
            }
            other => ServiceError::store("update", format!("transaction {}", id), other),
        })
    }

    async fn rows_in<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<Vec<payment_transaction::Model>, ServiceError> {
        payment_transaction::Entity::find()
            .filter(payment_transaction::Column::OrderId.eq(order_id))
            .order_by_asc(payment_transaction::Column::Id)
            .all(conn)
            .await
            .map_err(ServiceError::store_ctx("list", format!("order {}", order_id)))
    }

    async fn find_one(
        &self,
        operation: &'static str,
        column: payment_transaction::Column,
        value: &str,
    ) -> Result<payment_transaction::Model, ServiceError> {
        with_deadline(self.base.store_timeout(), operation, async {
            payment_transaction::Entity::find()
                .filter(column.eq(value))
                .order_by_desc(payment_transaction::Column::Id)
                .one(self.base.get_db())
                .await
                .map_err(ServiceError::store_ctx(operation, value.to_string()))?
                .ok_or_else(|| ServiceError::NotFound(format!("Transaction {} not found", value)))
        })
        .await
    }

    /// `SUM(column)` over the order's successful rows of one type.
    async fn sum_successful(
        &self,
        order_id: Uuid,
        transaction_type: TransactionType,
        column: payment_transaction::Column,
    ) -> Result<Decimal, ServiceError> {
        with_deadline(self.base.store_timeout(), "sum transactions", async {
            let total = payment_transaction::Entity::find()
                .select_only()
                .column_as(column.sum(), "total")
                .filter(payment_transaction::Column::OrderId.eq(order_id))
                .filter(payment_transaction::Column::TransactionType.eq(transaction_type))
                .filter(payment_transaction::Column::Status.eq(TransactionStatus::Successful))
                .into_tuple::<Option<Decimal>>()
                .one(self.base.get_db())
                .await
                .map_err(ServiceError::store_ctx("sum", format!("order {}", order_id)))?;
            Ok(total.flatten().unwrap_or(Decimal::ZERO))
        })
        .await
    }
}

#[async_trait]
impl TransactionStore for SeaOrmTransactionStore {
    #[instrument(skip(self, tx), fields(order_id = %tx.order_id, kind = %tx.transaction_type))]
    async fn create(&self, tx: NewTransaction) -> Result<payment_transaction::Model, ServiceError> {
        with_deadline(self.base.store_timeout(), "create transaction", async {
            let txn = begin(self.base.get_db(), "create transaction").await?;
            let model = self.insert_in(&txn, tx).await?;
            commit(txn, "create transaction").await?;
            Ok(model)
        })
        .await
    }

    #[instrument(skip(self, tx), fields(order_id = %tx.order_id, kind = %tx.transaction_type))]
    async fn create_or_update(
        &self,
        tx: NewTransaction,
    ) -> Result<payment_transaction::Model, ServiceError> {
        with_deadline(self.base.store_timeout(), "upsert transaction", async {
            let txn = begin(self.base.get_db(), "upsert transaction").await?;
            let model = self.upsert_in(&txn, tx).await?;
            commit(txn, "upsert transaction").await?;
            Ok(model)
        })
        .await
    }

    #[instrument(skip(self, tx, guard), fields(order_id = %tx.order_id, kind = %tx.transaction_type))]
    async fn write_and_total(
        &self,
        tx: NewTransaction,
        mode: WriteMode,
        guard: Option<WriteGuard>,
    ) -> Result<(payment_transaction::Model, LedgerTotals), ServiceError> {
        with_deadline(self.base.store_timeout(), "record transaction", async {
            let txn = begin(self.base.get_db(), "record transaction").await?;

            if let Some(guard) = guard {
                let before = LedgerTotals::from_transactions(&Self::rows_in(&txn, tx.order_id).await?);
                guard(&before, &tx)?;
            }

            let order_id = tx.order_id;
            let model = match mode {
                WriteMode::Append => self.insert_in(&txn, tx).await?,
                WriteMode::Upsert => self.upsert_in(&txn, tx).await?,
            };
            let totals = LedgerTotals::from_transactions(&Self::rows_in(&txn, order_id).await?);

            commit(txn, "record transaction").await?;
            Ok((model, totals))
        })
        .await
    }

    #[instrument(skip(self, tx), fields(order_id = %tx.order_id, kind = %tx.transaction_type))]
    async fn record_external(
        &self,
        tx: NewTransaction,
        mode: WriteMode,
    ) -> Result<(ExternalWrite, payment_transaction::Model, LedgerTotals), ServiceError> {
        with_deadline(self.base.store_timeout(), "record external transaction", async {
            Self::check(&tx)?;
            let external_id = match tx.external_id.as_deref().map(str::trim) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => {
                    return Err(ServiceError::InvalidInput(
                        "external id is required".to_string(),
                    ))
                }
            };
            let order_id = tx.order_id;
            let txn = begin(self.base.get_db(), "record external transaction").await?;

            let existing = payment_transaction::Entity::find()
                .filter(payment_transaction::Column::OrderId.eq(order_id))
                .filter(payment_transaction::Column::TransactionType.eq(tx.transaction_type))
                .filter(payment_transaction::Column::ExternalId.eq(external_id.as_str()))
                .one(&txn)
                .await
                .map_err(ServiceError::store_ctx("find by external id", external_id.clone()))?;

            let (outcome, model) = match existing {
                None => {
                    let model = match mode {
                        WriteMode::Append => self.insert_in(&txn, tx).await?,
                        WriteMode::Upsert => self.upsert_in(&txn, tx).await?,
                    };
                    (ExternalWrite::Inserted, model)
                }
                Some(mut row) => match classify_redelivery(&row, &tx) {
                    ExternalWrite::Updated => {
                        row.status = tx.status;
                        row.amount = tx.amount;
                        if tx.raw_response.is_some() {
                            row.raw_response = tx.raw_response;
                        }
                        (ExternalWrite::Updated, self.save_in(&txn, row).await?)
                    }
                    other => (other, row),
                },
            };
            let totals = LedgerTotals::from_transactions(&Self::rows_in(&txn, order_id).await?);

            commit(txn, "record external transaction").await?;
            Ok((outcome, model, totals))
        })
        .await
    }

    async fn get_by_id(&self, id: i64) -> Result<payment_transaction::Model, ServiceError> {
        with_deadline(self.base.store_timeout(), "get transaction", async {
            payment_transaction::Entity::find_by_id(id)
                .one(self.base.get_db())
                .await
                .map_err(ServiceError::store_ctx("find", format!("transaction {}", id)))?
                .ok_or_else(|| ServiceError::NotFound(format!("Transaction {} not found", id)))
        })
        .await
    }

    async fn get_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<payment_transaction::Model, ServiceError> {
        self.find_one(
            "get transaction by transaction id",
            payment_transaction::Column::TransactionId,
            transaction_id,
        )
        .await
    }

    async fn get_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<payment_transaction::Model, ServiceError> {
        self.find_one(
            "get transaction by external id",
            payment_transaction::Column::ExternalId,
            external_id,
        )
        .await
    }

    async fn get_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<payment_transaction::Model, ServiceError> {
        self.find_one(
            "get transaction by idempotency key",
            payment_transaction::Column::IdempotencyKey,
            key,
        )
        .await
    }

    async fn get_by_order_id(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<payment_transaction::Model>, ServiceError> {
        with_deadline(self.base.store_timeout(), "list transactions", async {
            Self::rows_in(self.base.get_db(), order_id).await
        })
        .await
    }

    async fn get_latest_by_order_id_and_type(
        &self,
        order_id: Uuid,
        transaction_type: TransactionType,
    ) -> Result<payment_transaction::Model, ServiceError> {
        with_deadline(self.base.store_timeout(), "get latest transaction", async {
            Self::latest_in(self.base.get_db(), order_id, transaction_type)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!(
                        "No {} transaction for order {}",
                        transaction_type, order_id
                    ))
                })
        })
        .await
    }

    async fn sum_authorized_amount_by_order_id(&self, order_id: Uuid) -> Result<Decimal, ServiceError> {
        self.sum_successful(
            order_id,
            TransactionType::Authorize,
            payment_transaction::Column::AuthorizedAmount,
        )
        .await
    }

    async fn sum_captured_amount_by_order_id(&self, order_id: Uuid) -> Result<Decimal, ServiceError> {
        self.sum_successful(
            order_id,
            TransactionType::Capture,
            payment_transaction::Column::CapturedAmount,
        )
        .await
    }

    async fn sum_refunded_amount_by_order_id(&self, order_id: Uuid) -> Result<Decimal, ServiceError> {
        self.sum_successful(
            order_id,
            TransactionType::Refund,
            payment_transaction::Column::RefundedAmount,
        )
        .await
    }

    async fn sum_amount_by_order_id_and_type(
        &self,
        order_id: Uuid,
        transaction_type: TransactionType,
    ) -> Result<Decimal, ServiceError> {
        self.sum_successful(order_id, transaction_type, payment_transaction::Column::Amount)
            .await
    }

    async fn count_successful_by_order_id_and_type(
        &self,
        order_id: Uuid,
        transaction_type: TransactionType,
    ) -> Result<u64, ServiceError> {
        with_deadline(self.base.store_timeout(), "count transactions", async {
            payment_transaction::Entity::find()
                .filter(payment_transaction::Column::OrderId.eq(order_id))
                .filter(payment_transaction::Column::TransactionType.eq(transaction_type))
                .filter(payment_transaction::Column::Status.eq(TransactionStatus::Successful))
                .count(self.base.get_db())
                .await
                .map_err(ServiceError::store_ctx("count", format!("order {}", order_id)))
        })
        .await
    }

    async fn totals(&self, order_id: Uuid) -> Result<LedgerTotals, ServiceError> {
        with_deadline(self.base.store_timeout(), "total transactions", async {
            let rows = Self::rows_in(self.base.get_db(), order_id).await?;
            Ok(LedgerTotals::from_transactions(&rows))
        })
        .await
    }

    #[instrument(skip(self, model), fields(id = model.id, status = %model.status))]
    async fn update(
        &self,
        model: payment_transaction::Model,
    ) -> Result<payment_transaction::Model, ServiceError> {
        with_deadline(self.base.store_timeout(), "update transaction", async {
            self.save_in(self.base.get_db(), model).await
        })
        .await
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: i64) -> Result<(), ServiceError> {
        with_deadline(self.base.store_timeout(), "delete transaction", async {
            let result = payment_transaction::Entity::delete_by_id(id)
                .exec(self.base.get_db())
                .await
                .map_err(ServiceError::store_ctx("delete", format!("transaction {}", id)))?;
            if result.rows_affected == 0 {
                return Err(ServiceError::NotFound(format!("Transaction {} not found", id)));
            }
            Ok(())
        })
        .await
    }
}
