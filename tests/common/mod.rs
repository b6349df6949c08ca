#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use checkout_ledger::{
    clock::ManualClock,
    config::AppConfig,
    db,
    events,
    models::checkout::{Address, CustomerDetails, NewCheckoutItem},
    repositories::{CheckoutStore, SeaOrmCheckoutStore, SeaOrmTransactionStore, TransactionStore},
    AppServices,
};
use rust_decimal::Decimal;
use sea_orm::DatabaseConnection;
use uuid::Uuid;

/// Harness backed by a fresh in-memory SQLite database and a manual clock.
pub struct TestApp {
    pub db: Arc<DatabaseConnection>,
    pub clock: Arc<ManualClock>,
    pub config: AppConfig,
    pub services: AppServices,
    pub checkout_store: Arc<dyn CheckoutStore>,
    pub transaction_store: Arc<dyn TransactionStore>,
    _event_task: tokio::task::JoinHandle<()>,
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Builds the harness after letting `tweak` adjust the configuration.
    pub async fn with_config(tweak: impl FnOnce(&mut AppConfig)) -> Self {
        // One connection: every sqlite::memory: connection is its own database.
        let mut cfg = AppConfig::new("sqlite::memory:", "test");
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        tweak(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations");

        let db = Arc::new(pool);
        let clock = Arc::new(ManualClock::new(start_time()));
        let (services, rx) = AppServices::build(db.clone(), &cfg, clock.clone());
        let event_task = tokio::spawn(events::process_events(rx));

        let checkout_store: Arc<dyn CheckoutStore> =
            Arc::new(SeaOrmCheckoutStore::new(db.clone(), cfg.store_timeout()));
        let transaction_store: Arc<dyn TransactionStore> = Arc::new(SeaOrmTransactionStore::new(
            db.clone(),
            cfg.store_timeout(),
            clock.clone(),
        ));

        Self {
            db,
            clock,
            config: cfg,
            services,
            checkout_store,
            transaction_store,
            _event_task: event_task,
        }
    }

    pub fn advance_minutes(&self, minutes: i64) {
        self.clock.advance(chrono::Duration::minutes(minutes));
    }
}

pub fn item(quantity: i32, unit_price: Decimal) -> NewCheckoutItem {
    NewCheckoutItem {
        product_id: Uuid::new_v4(),
        variant_id: Uuid::new_v4(),
        quantity,
        unit_price,
        weight: Decimal::ONE,
        product_name: "Trail Runner".to_string(),
        variant_name: "Size 42".to_string(),
        sku: "TR-42".to_string(),
    }
}

pub fn address() -> Address {
    Address {
        first_name: "Ada".to_string(),
        last_name: "Lovelace".to_string(),
        company: None,
        address_line1: "12 Analytical Row".to_string(),
        address_line2: None,
        city: "London".to_string(),
        province: None,
        postal_code: "N1 9GU".to_string(),
        country_code: "GB".to_string(),
        phone: None,
    }
}

pub fn customer(email: &str) -> CustomerDetails {
    CustomerDetails {
        email: Some(email.to_string()),
        ..CustomerDetails::default()
    }
}
