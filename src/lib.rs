//! Checkout Ledger Library
//!
//! Checkout lifecycle management (session carts, completion, reclamation)
//! and an append-mostly payment transaction ledger.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod clock;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod models;
pub mod repositories;
pub mod services;

use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::events::{Event, EventSender};
use crate::repositories::{CheckoutStore, SeaOrmCheckoutStore, SeaOrmTransactionStore, TransactionStore};
use crate::services::commerce::{
    CheckoutLifecycleManager, CheckoutService, ReclamationSweep, SeaOrmOrderBridge, SweepPolicy,
};
use crate::services::payments::TransactionLedger;

/// Wired services sharing one connection pool, clock and event channel.
#[derive(Clone)]
pub struct AppServices {
    pub checkouts: Arc<CheckoutService>,
    pub lifecycle: Arc<CheckoutLifecycleManager>,
    pub sweep: Arc<ReclamationSweep>,
    pub ledger: Arc<TransactionLedger>,
    pub order_bridge: Arc<SeaOrmOrderBridge>,
    pub event_sender: Arc<EventSender>,
}

impl AppServices {
    /// Builds every service from `config`. The returned receiver must be
    /// drained (see [`events::process_events`]) or events are dropped once
    /// the channel fills.
    pub fn build(
        db: Arc<DatabaseConnection>,
        config: &AppConfig,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::Receiver<Event>) {
        let (sender, rx) = EventSender::channel(config.event_channel_capacity);
        let event_sender = Arc::new(sender);
        let store_timeout = config.store_timeout();

        let checkout_store: Arc<dyn CheckoutStore> =
            Arc::new(SeaOrmCheckoutStore::new(db.clone(), store_timeout));
        let transaction_store: Arc<dyn TransactionStore> = Arc::new(SeaOrmTransactionStore::new(
            db.clone(),
            store_timeout,
            clock.clone(),
        ));

        let lifecycle = CheckoutLifecycleManager::new(
            checkout_store.clone(),
            db,
            clock.clone(),
            event_sender.clone(),
            &config.checkout,
            store_timeout,
        );
        let sweep = ReclamationSweep::new(
            checkout_store.clone(),
            lifecycle.clone(),
            clock.clone(),
            event_sender.clone(),
            SweepPolicy::from_config(&config.checkout, &config.sweep),
        );
        let checkouts = CheckoutService::new(
            checkout_store,
            clock.clone(),
            event_sender.clone(),
            &config.checkout,
            config.default_currency.clone(),
        );

        let services = Self {
            checkouts: Arc::new(checkouts),
            lifecycle: Arc::new(lifecycle),
            sweep: Arc::new(sweep),
            ledger: Arc::new(TransactionLedger::new(transaction_store, event_sender.clone())),
            order_bridge: Arc::new(SeaOrmOrderBridge::new(clock)),
            event_sender,
        };
        (services, rx)
    }
}
