use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session-scoped checkout row. Items live in `checkout_items`.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "checkouts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub session_id: String,
    #[sea_orm(nullable)]
    pub user_id: Option<Uuid>,
    pub status: CheckoutStatus,
    pub currency: String,
    #[sea_orm(column_type = "Decimal(None)")]
    pub total_amount: Decimal,
    #[sea_orm(column_type = "Decimal(None)")]
    pub shipping_cost: Decimal,
    #[sea_orm(column_type = "Decimal(None)")]
    pub discount_amount: Decimal,
    #[sea_orm(column_type = "Decimal(None)")]
    pub final_amount: Decimal,
    #[sea_orm(column_type = "Decimal(None)")]
    pub total_weight: Decimal,
    #[sea_orm(column_type = "Json", nullable)]
    pub applied_discount: Option<Json>,
    #[sea_orm(column_type = "Json", nullable)]
    pub shipping_address: Option<Json>,
    #[sea_orm(column_type = "Json", nullable)]
    pub billing_address: Option<Json>,
    #[sea_orm(column_type = "Json", nullable)]
    pub customer_details: Option<Json>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[sea_orm(nullable)]
    pub expires_at: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub completed_at: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub converted_order_id: Option<Uuid>,
    pub version: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::checkout_item::Entity")]
    CheckoutItems,
}

impl Related<super::checkout_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CheckoutItems.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Checkout status enumeration
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
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CheckoutStatus {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "abandoned")]
    Abandoned,
    #[sea_orm(string_value = "expired")]
    Expired,
    #[sea_orm(string_value = "completed")]
    Completed,
}

impl CheckoutStatus {
    /// Every state other than `Active` is terminal for the same checkout.
    pub fn is_terminal(self) -> bool {
        !matches!(self, CheckoutStatus::Active)
    }
}
