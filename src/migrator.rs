use anyhow::Result;
use sea_orm::{ConnectOptions, Database};
use sea_orm_migration::prelude::*;
use std::time::Duration;
use tracing::{error, info};

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240301_000001_create_checkout_tables::Migration),
            Box::new(m20240301_000002_create_order_tables::Migration),
            Box::new(m20240301_000003_create_payment_transactions_table::Migration),
            Box::new(m20240301_000004_create_transaction_sequences_table::Migration),
        ]
    }
}

mod m20240301_000001_create_checkout_tables {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000001_create_checkout_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Checkouts::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Checkouts::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Checkouts::SessionId).string().not_null())
                        .col(ColumnDef::new(Checkouts::UserId).uuid().null())
                        .col(ColumnDef::new(Checkouts::Status).string_len(16).not_null())
                        .col(ColumnDef::new(Checkouts::Currency).string_len(3).not_null())
                        .col(
                            ColumnDef::new(Checkouts::TotalAmount)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Checkouts::ShippingCost)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Checkouts::DiscountAmount)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Checkouts::FinalAmount)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Checkouts::TotalWeight)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Checkouts::AppliedDiscount).json().null())
                        .col(ColumnDef::new(Checkouts::ShippingAddress).json().null())
                        .col(ColumnDef::new(Checkouts::BillingAddress).json().null())
                        .col(ColumnDef::new(Checkouts::CustomerDetails).json().null())
                        .col(
                            ColumnDef::new(Checkouts::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Checkouts::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Checkouts::LastActivityAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Checkouts::ExpiresAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Checkouts::CompletedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(Checkouts::ConvertedOrderId).uuid().null())
                        .col(
                            ColumnDef::new(Checkouts::Version)
                                .integer()
                                .not_null()
                                .default(1),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(CheckoutItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CheckoutItems::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(CheckoutItems::CheckoutId).uuid().not_null())
                        .col(ColumnDef::new(CheckoutItems::Position).integer().not_null())
                        .col(ColumnDef::new(CheckoutItems::ProductId).uuid().not_null())
                        .col(ColumnDef::new(CheckoutItems::VariantId).uuid().not_null())
                        .col(ColumnDef::new(CheckoutItems::ProductName).string().not_null())
                        .col(ColumnDef::new(CheckoutItems::VariantName).string().not_null())
                        .col(ColumnDef::new(CheckoutItems::Sku).string().not_null())
                        .col(ColumnDef::new(CheckoutItems::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(CheckoutItems::UnitPrice)
                                .decimal()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutItems::Weight)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(CheckoutItems::Subtotal)
                                .decimal()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutItems::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_checkout_items_checkout_id")
                                .from(CheckoutItems::Table, CheckoutItems::CheckoutId)
                                .to(Checkouts::Table, Checkouts::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            // Sweep and lookup paths
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_checkouts_session_id")
                        .table(Checkouts::Table)
                        .col(Checkouts::SessionId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_checkouts_user_id")
                        .table(Checkouts::Table)
                        .col(Checkouts::UserId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_checkouts_status_last_activity")
                        .table(Checkouts::Table)
                        .col(Checkouts::Status)
                        .col(Checkouts::LastActivityAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_checkout_items_checkout_id")
                        .table(CheckoutItems::Table)
                        .col(CheckoutItems::CheckoutId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CheckoutItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Checkouts::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Checkouts {
        Table,
        Id,
        SessionId,
        UserId,
        Status,
        Currency,
        TotalAmount,
        ShippingCost,
        DiscountAmount,
        FinalAmount,
        TotalWeight,
        AppliedDiscount,
        ShippingAddress,
        BillingAddress,
        CustomerDetails,
        CreatedAt,
        UpdatedAt,
        LastActivityAt,
        ExpiresAt,
        CompletedAt,
        ConvertedOrderId,
        Version,
    }

    #[derive(DeriveIden)]
    enum CheckoutItems {
        Table,
        Id,
        CheckoutId,
        Position,
        ProductId,
        VariantId,
        ProductName,
        VariantName,
        Sku,
        Quantity,
        UnitPrice,
        Weight,
        Subtotal,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240301_000002_create_order_tables {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000002_create_order_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Orders::OrderNumber)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(
                            ColumnDef::new(Orders::CheckoutId)
                                .uuid()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Orders::SessionId).string().not_null())
                        .col(ColumnDef::new(Orders::UserId).uuid().null())
                        .col(ColumnDef::new(Orders::CustomerEmail).string().null())
                        .col(ColumnDef::new(Orders::Currency).string_len(3).not_null())
                        .col(
                            ColumnDef::new(Orders::TotalAmount)
                                .decimal()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::ShippingCost)
                                .decimal()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::DiscountAmount)
                                .decimal()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::FinalAmount)
                                .decimal()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Orders::DiscountCode).string().null())
                        .col(ColumnDef::new(Orders::ShippingAddress).json().null())
                        .col(ColumnDef::new(Orders::BillingAddress).json().null())
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(OrderItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(OrderItems::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(OrderItems::OrderId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::ProductId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::VariantId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::Sku).string().not_null())
                        .col(ColumnDef::new(OrderItems::Name).string().not_null())
                        .col(ColumnDef::new(OrderItems::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(OrderItems::UnitPrice)
                                .decimal()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItems::TotalPrice)
                                .decimal()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_items_order_id")
                                .from(OrderItems::Table, OrderItems::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_items_order_id")
                        .table(OrderItems::Table)
                        .col(OrderItems::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Orders {
        Table,
        Id,
        OrderNumber,
        CheckoutId,
        SessionId,
        UserId,
        CustomerEmail,
        Currency,
        TotalAmount,
        ShippingCost,
        DiscountAmount,
        FinalAmount,
        DiscountCode,
        ShippingAddress,
        BillingAddress,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum OrderItems {
        Table,
        Id,
        OrderId,
        ProductId,
        VariantId,
        Sku,
        Name,
        Quantity,
        UnitPrice,
        TotalPrice,
        CreatedAt,
    }
}

mod m20240301_000003_create_payment_transactions_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000003_create_payment_transactions_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PaymentTransactions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PaymentTransactions::Id)
                                .big_integer()
                                .primary_key()
                                .auto_increment()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::TransactionId)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::IdempotencyKey)
                                .string()
                                .null(),
                        )
                        .col(ColumnDef::new(PaymentTransactions::ExternalId).string().null())
                        .col(ColumnDef::new(PaymentTransactions::OrderId).uuid().not_null())
                        .col(
                            ColumnDef::new(PaymentTransactions::TransactionType)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::Status)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::Amount)
                                .decimal()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::AuthorizedAmount)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::CapturedAmount)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::RefundedAmount)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::Currency)
                                .string_len(3)
                                .not_null(),
                        )
                        .col(ColumnDef::new(PaymentTransactions::Provider).string().not_null())
                        .col(ColumnDef::new(PaymentTransactions::RawResponse).json().null())
                        .col(ColumnDef::new(PaymentTransactions::Metadata).json().null())
                        .col(
                            ColumnDef::new(PaymentTransactions::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // Authoritative guard for generated transaction numbers
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("uq_payment_transactions_transaction_id")
                        .table(PaymentTransactions::Table)
                        .col(PaymentTransactions::TransactionId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payment_transactions_order_type")
                        .table(PaymentTransactions::Table)
                        .col(PaymentTransactions::OrderId)
                        .col(PaymentTransactions::TransactionType)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payment_transactions_external_id")
                        .table(PaymentTransactions::Table)
                        .col(PaymentTransactions::ExternalId)
                        .to_owned(),
                )
                .await?;

            // One row per gateway reference and operation; NULL external ids never collide
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("uq_payment_transactions_order_type_external_id")
                        .table(PaymentTransactions::Table)
                        .col(PaymentTransactions::OrderId)
                        .col(PaymentTransactions::TransactionType)
                        .col(PaymentTransactions::ExternalId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payment_transactions_idempotency_key")
                        .table(PaymentTransactions::Table)
                        .col(PaymentTransactions::IdempotencyKey)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PaymentTransactions::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum PaymentTransactions {
        Table,
        Id,
        TransactionId,
        IdempotencyKey,
        ExternalId,
        OrderId,
        TransactionType,
        Status,
        Amount,
        AuthorizedAmount,
        CapturedAmount,
        RefundedAmount,
        Currency,
        Provider,
        RawResponse,
        Metadata,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240301_000004_create_transaction_sequences_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000004_create_transaction_sequences_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(TransactionSequences::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(TransactionSequences::TypeCode)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(TransactionSequences::Year)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(TransactionSequences::LastValue)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(TransactionSequences::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .primary_key(
                            Index::create()
                                .col(TransactionSequences::TypeCode)
                                .col(TransactionSequences::Year),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(TransactionSequences::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum TransactionSequences {
        Table,
        TypeCode,
        Year,
        LastValue,
        UpdatedAt,
    }
}

// Database migration CLI runner
pub async fn run_migration(db_url: &str) -> Result<()> {
    info!("Setting up database connection for migrations");

    let mut opt = ConnectOptions::new(db_url);
    opt.max_connections(5)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(300))
        .sqlx_logging(true);

    let db = Database::connect(opt).await?;

    info!("Running database migrations");

    match Migrator::up(&db, None).await {
        Ok(_) => {
            info!("Migrations completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Migration failed: {}", e);
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> sea_orm::DatabaseConnection {
        let mut opt = ConnectOptions::new("sqlite::memory:");
        opt.max_connections(1).min_connections(1);
        Database::connect(opt).await.unwrap()
    }

    #[tokio::test]
    async fn schema_builds_on_sqlite() {
        let db = memory_db().await;
        Migrator::up(&db, None).await.unwrap();

        let manager = SchemaManager::new(&db);
        for table in [
            "checkouts",
            "checkout_items",
            "orders",
            "order_items",
            "payment_transactions",
            "transaction_sequences",
        ] {
            assert!(manager.has_table(table).await.unwrap(), "missing table {}", table);
        }
        assert!(Migrator::get_pending_migrations(&db).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn schema_can_be_rolled_back_and_reapplied() {
        let db = memory_db().await;
        Migrator::up(&db, None).await.unwrap();
        Migrator::down(&db, None).await.unwrap();
        assert!(!SchemaManager::new(&db).has_table("checkouts").await.unwrap());
        Migrator::up(&db, None).await.unwrap();
        assert!(SchemaManager::new(&db).has_table("payment_transactions").await.unwrap());
    }
}
