pub mod commerce;
pub mod order;
pub mod order_item;
pub mod payment_transaction;
pub mod transaction_sequence;

pub use payment_transaction::{TransactionStatus, TransactionType};
