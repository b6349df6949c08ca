/// Commerce entities module
pub mod checkout;
pub mod checkout_item;

// Re-export entities
pub use checkout::{CheckoutStatus, Entity as Checkout, Model as CheckoutModel};
pub use checkout_item::{Entity as CheckoutItem, Model as CheckoutItemModel};
