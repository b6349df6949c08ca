/*!
 * Transaction and deadline helpers
 *
 * Every store round trip runs under a caller supplied deadline; multi-row
 * writes run inside an explicit transaction that rolls back on drop.
 */

use metrics::counter;
use sea_orm::{DatabaseConnection, DatabaseTransaction, TransactionTrait};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::errors::ServiceError;

/// Opens a transaction. Dropping it without [`commit`] rolls back.
pub async fn begin(
    db: &DatabaseConnection,
    operation: &'static str,
) -> Result<DatabaseTransaction, ServiceError> {
    counter!("checkout_ledger_db.transaction.started", 1);
    db.begin()
        .await
        .map_err(ServiceError::store_ctx(operation, "transaction"))
}

pub async fn commit(txn: DatabaseTransaction, operation: &'static str) -> Result<(), ServiceError> {
    txn.commit()
        .await
        .map_err(ServiceError::store_ctx(operation, "transaction"))?;
    counter!("checkout_ledger_db.transaction.committed", 1);
    Ok(())
}

/// Runs `fut` under `deadline`, reporting an elapsed deadline as
/// [`ServiceError::Timeout`].
pub async fn with_deadline<F, T>(
    deadline: Duration,
    operation: &'static str,
    fut: F,
) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation, ?deadline, "Store call exceeded its deadline");
            counter!("checkout_ledger_db.operation.timeout", 1, "operation" => operation);
            Err(ServiceError::Timeout(format!(
                "{} exceeded {:?}",
                operation, deadline
            )))
        }
    }
}
