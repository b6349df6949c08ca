//! Ledger value types: rollup derivation, transaction identifiers and
//! per-order totals.

use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::entities::payment_transaction::{self, TransactionStatus, TransactionType};

/// Per-transaction rollup amounts. At most one is non-zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rollups {
    pub authorized: Decimal,
    pub captured: Decimal,
    pub refunded: Decimal,
}

/// Derives the rollup fields of a transaction from its type, status and amount.
///
/// Only a Successful transaction carries a rollup, and only in the field that
/// matches its type. Cancel never rolls up.
pub fn derive_rollups(
    transaction_type: TransactionType,
    status: TransactionStatus,
    amount: Decimal,
) -> Rollups {
    let mut rollups = Rollups::default();
    if status != TransactionStatus::Successful {
        return rollups;
    }
    match transaction_type {
        TransactionType::Authorize => rollups.authorized = amount,
        TransactionType::Capture => rollups.captured = amount,
        TransactionType::Refund => rollups.refunded = amount,
        TransactionType::Cancel => {}
    }
    rollups
}

impl TransactionType {
    /// Short code used inside generated transaction ids.
    pub fn code(self) -> &'static str {
        match self {
            TransactionType::Authorize => "AUTH",
            TransactionType::Capture => "CAPT",
            TransactionType::Refund => "REFUND",
            TransactionType::Cancel => "CANCEL",
        }
    }
}

static TRANSACTION_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^TXN-(AUTH|CAPT|REFUND|CANCEL)-(\d{4})-(\d{3,})$")
        .expect("transaction id pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionNumber {
    pub type_code: String,
    pub year: i32,
    pub sequence: i64,
}

/// `TXN-<CODE>-<YYYY>-<NNN>`, zero-padded to at least three digits.
pub fn format_transaction_id(transaction_type: TransactionType, year: i32, sequence: i64) -> String {
    format!("TXN-{}-{}-{:03}", transaction_type.code(), year, sequence)
}

pub fn parse_transaction_id(value: &str) -> Option<TransactionNumber> {
    let caps = TRANSACTION_ID_RE.captures(value)?;
    Some(TransactionNumber {
        type_code: caps.get(1)?.as_str().to_string(),
        year: caps.get(2)?.as_str().parse().ok()?,
        sequence: caps.get(3)?.as_str().parse().ok()?,
    })
}

/// Prefix shared by every generated id of a (type, year) pair.
pub fn transaction_id_prefix(transaction_type: TransactionType, year: i32) -> String {
    format!("TXN-{}-{}-", transaction_type.code(), year)
}

/// A payment attempt as handed to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct NewTransaction {
    /// Left empty to have one generated.
    pub transaction_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub external_id: Option<String>,
    pub order_id: Uuid,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub amount: Decimal,
    #[validate(length(equal = 3))]
    pub currency: String,
    #[validate(length(min = 1, max = 64))]
    pub provider: String,
    pub raw_response: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

impl NewTransaction {
    pub fn new(
        order_id: Uuid,
        transaction_type: TransactionType,
        status: TransactionStatus,
        amount: Decimal,
        currency: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            transaction_id: None,
            idempotency_key: None,
            external_id: None,
            order_id,
            transaction_type,
            status,
            amount,
            currency: currency.into(),
            provider: provider.into(),
            raw_response: None,
            metadata: None,
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    pub fn with_raw_response(mut self, raw: serde_json::Value) -> Self {
        self.raw_response = Some(raw);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// True when the caller supplied a non-blank transaction id.
    pub fn has_transaction_id(&self) -> bool {
        self.transaction_id
            .as_deref()
            .is_some_and(|id| !id.trim().is_empty())
    }
}

/// Successful-only totals for one order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTotals {
    pub authorized: Decimal,
    pub captured: Decimal,
    pub refunded: Decimal,
    pub cancelled: bool,
}

impl LedgerTotals {
    pub fn from_transactions<'a, I>(rows: I) -> Self
    where
        I: IntoIterator<Item = &'a payment_transaction::Model>,
    {
        rows.into_iter()
            .filter(|row| row.is_successful())
            .fold(Self::default(), |mut acc, row| {
                let rollups = derive_rollups(row.transaction_type, row.status, row.amount);
                acc.authorized += rollups.authorized;
                acc.captured += rollups.captured;
                acc.refunded += rollups.refunded;
                if row.transaction_type == TransactionType::Cancel {
                    acc.cancelled = true;
                }
                acc
            })
    }

    pub fn remaining_capturable(&self) -> Decimal {
        self.authorized - self.captured
    }

    pub fn remaining_refundable(&self) -> Decimal {
        self.captured - self.refunded
    }

    pub fn payment_status(&self) -> OrderPaymentStatus {
        if self.refunded > Decimal::ZERO {
            if self.refunded >= self.captured {
                OrderPaymentStatus::Refunded
            } else {
                OrderPaymentStatus::PartiallyRefunded
            }
        } else if self.captured > Decimal::ZERO {
            if self.captured >= self.authorized {
                OrderPaymentStatus::Captured
            } else {
                OrderPaymentStatus::PartiallyCaptured
            }
        } else if self.cancelled {
            OrderPaymentStatus::Cancelled
        } else if self.authorized > Decimal::ZERO {
            OrderPaymentStatus::Authorized
        } else {
            OrderPaymentStatus::Unpaid
        }
    }
}

/// Payment position of an order as derived from its ledger.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderPaymentStatus {
    Unpaid,
    Authorized,
    PartiallyCaptured,
    Captured,
    PartiallyRefunded,
    Refunded,
    Cancelled,
}
