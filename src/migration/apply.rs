use tracing::{debug, error};

use crate::cache::{LedgerKind, MigrationLedger};
use crate::engine::EngineConnection;
use crate::error::{DbQueueError, MigrationStage};
use crate::migration::execute::execute_migration_sql;

/// Next forward migration to apply, or 0 when there is none.
///
/// A queue without a ledger (a worker) never has anything to apply.
#[must_use]
pub fn find_next_migration_to_apply(ledger: Option<&MigrationLedger>) -> i64 {
    ledger.map_or(0, MigrationLedger::next_forward)
}

/// Apply loaded forward migrations one at a time, in ascending order.
///
/// Returns how many were applied. `applied` only ever advances by one per committed
/// migration.
///
/// # Errors
/// Returns an `Execute`-stage [`DbQueueError::MigrationError`] when a migration fails or an
/// iteration makes no progress. Migrations committed before the failure stay applied.
pub async fn apply_migrations(
    conn: &mut dyn EngineConnection,
    ledger: &mut MigrationLedger,
    dqm: &str,
) -> Result<usize, DbQueueError> {
    let mut count = 0;
    loop {
        let next = find_next_migration_to_apply(Some(ledger));
        if next == 0 {
            return Ok(count);
        }
        let before = ledger.applied();
        let sql = ledger
            .entry(next, LedgerKind::Forward)
            .map(|entry| entry.sql.clone())
            .unwrap_or_default();

        if let Err(e) = execute_migration_sql(conn, &sql, dqm).await {
            error!(dqm = %dqm, migration = next, "Migration apply failed: {e}");
            return Err(e);
        }
        ledger.mark_applied(next)?;
        debug!(dqm = %dqm, migration = next, "Migration applied");
        count += 1;

        if ledger.applied() <= before {
            return Err(DbQueueError::migration(
                MigrationStage::Execute,
                format!("migration apply stalled at {before}"),
            ));
        }
    }
}
