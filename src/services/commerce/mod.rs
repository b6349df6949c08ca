/// Commerce services module - checkout lifecycle and order conversion
pub mod checkout_lifecycle;
pub mod checkout_service;
pub mod order_bridge;
pub mod reclamation;

// Re-export services for convenience
pub use checkout_lifecycle::{CheckoutLifecycleManager, PaymentOutcome};
pub use checkout_service::CheckoutService;
pub use order_bridge::{OrderConversionBridge, SeaOrmOrderBridge};
pub use reclamation::{ReclamationSweep, SweepPolicy, SweepReport};
