// Checkout lifecycle, order conversion and reclamation
pub mod commerce;

// Payment transaction ledger
pub mod payments;
