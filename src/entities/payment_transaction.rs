use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::payment_transaction::{derive_rollups, Rollups};

/// One payment attempt against an order.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_transactions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub transaction_id: String,
    #[sea_orm(nullable)]
    pub idempotency_key: Option<String>,
    #[sea_orm(nullable)]
    pub external_id: Option<String>,
    pub order_id: Uuid,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    #[sea_orm(column_type = "Decimal(None)")]
    pub amount: Decimal,
    #[sea_orm(column_type = "Decimal(None)")]
    pub authorized_amount: Decimal,
    #[sea_orm(column_type = "Decimal(None)")]
    pub captured_amount: Decimal,
    #[sea_orm(column_type = "Decimal(None)")]
    pub refunded_amount: Decimal,
    pub currency: String,
    pub provider: String,
    #[sea_orm(column_type = "Json", nullable)]
    pub raw_response: Option<Json>,
    #[sea_orm(column_type = "Json", nullable)]
    pub metadata: Option<Json>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Moves the attempt to `status` and re-derives its rollup fields.
    pub fn update_status(&mut self, status: TransactionStatus) {
        self.status = status;
        self.apply_rollups();
    }

    /// Recomputes rollups from the current type, status and amount.
    pub fn apply_rollups(&mut self) {
        let Rollups {
            authorized,
            captured,
            refunded,
        } = derive_rollups(self.transaction_type, self.status, self.amount);
        self.authorized_amount = authorized;
        self.captured_amount = captured;
        self.refunded_amount = refunded;
    }

    pub fn rollups(&self) -> Rollups {
        Rollups {
            authorized: self.authorized_amount,
            captured: self.captured_amount,
            refunded: self.refunded_amount,
        }
    }

    pub fn is_successful(&self) -> bool {
        self.status == TransactionStatus::Successful
    }
}

/// Kind of payment attempt.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionType {
    #[sea_orm(string_value = "authorize")]
    Authorize,
    #[sea_orm(string_value = "capture")]
    Capture,
    #[sea_orm(string_value = "refund")]
    Refund,
    #[sea_orm(string_value = "cancel")]
    Cancel,
}

/// Outcome of a payment attempt.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "successful")]
    Successful,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl TransactionStatus {
    /// Forward moves a recorded attempt may make: pending settles either way,
    /// a success can later be reversed.
    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Successful) | (Pending, Failed) | (Successful, Failed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TransactionStatus::Pending, TransactionStatus::Successful, true)]
    #[case(TransactionStatus::Pending, TransactionStatus::Failed, true)]
    #[case(TransactionStatus::Successful, TransactionStatus::Failed, true)]
    #[case(TransactionStatus::Successful, TransactionStatus::Pending, false)]
    #[case(TransactionStatus::Failed, TransactionStatus::Pending, false)]
    #[case(TransactionStatus::Failed, TransactionStatus::Successful, false)]
    #[case(TransactionStatus::Pending, TransactionStatus::Pending, false)]
    fn status_moves_only_forward(
        #[case] from: TransactionStatus,
        #[case] to: TransactionStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }
}
