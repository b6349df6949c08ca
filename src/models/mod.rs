pub mod checkout;
pub mod payment_transaction;

pub use checkout::{
    Address, AppliedDiscount, Checkout, CheckoutError, CheckoutItem, CustomerDetails,
    NewCheckoutItem,
};
pub use payment_transaction::{
    derive_rollups, LedgerTotals, NewTransaction, OrderPaymentStatus, Rollups,
};
