use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;

pub mod checkout_store;
pub mod transaction_store;

pub use checkout_store::{CheckoutStore, SeaOrmCheckoutStore};
pub use transaction_store::{ExternalWrite, SeaOrmTransactionStore, TransactionStore, WriteMode};

/// Repository trait for common database operations
pub trait Repository {
    fn get_db(&self) -> &DatabaseConnection;

    /// Deadline applied to each store call.
    fn store_timeout(&self) -> Duration;
}

#[derive(Debug, Clone)]
pub struct BaseRepository {
    db: Arc<DatabaseConnection>,
    store_timeout: Duration,
}

impl BaseRepository {
    pub fn new(db: Arc<DatabaseConnection>, store_timeout: Duration) -> Self {
        Self { db, store_timeout }
    }
}

impl Repository for BaseRepository {
    fn get_db(&self) -> &DatabaseConnection {
        &self.db
    }

    fn store_timeout(&self) -> Duration {
        self.store_timeout
    }
}
