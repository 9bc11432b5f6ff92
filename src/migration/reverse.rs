use tracing::{debug, error};

use crate::cache::{LedgerKind, MigrationLedger};
use crate::engine::EngineConnection;
use crate::error::DbQueueError;
use crate::migration::execute::execute_migration_sql;

/// Next reverse migration to apply (the highest applied one), or 0 when there is none.
#[must_use]
pub fn find_next_reverse_migration_to_apply(ledger: Option<&MigrationLedger>) -> i64 {
    ledger.map_or(0, MigrationLedger::next_reverse)
}

/// Undo applied migrations from the top down until one has no reverse SQL.
///
/// # Errors
/// Returns an `Execute`-stage [`DbQueueError::MigrationError`] when a reverse migration fails;
/// `applied` then still names the migration that could not be undone.
pub async fn reverse_migrations(
    conn: &mut dyn EngineConnection,
    ledger: &mut MigrationLedger,
    dqm: &str,
) -> Result<usize, DbQueueError> {
    let mut count = 0;
    loop {
        let next = find_next_reverse_migration_to_apply(Some(ledger));
        if next == 0 {
            return Ok(count);
        }
        let sql = ledger
            .entry(next, LedgerKind::Reverse)
            .map(|entry| entry.sql.clone())
            .unwrap_or_default();
        if let Err(e) = execute_migration_sql(conn, &sql, dqm).await {
            error!(dqm = %dqm, migration = next, "Reverse migration failed: {e}");
            return Err(e);
        }
        ledger.mark_reverted(next)?;
        debug!(dqm = %dqm, migration = next, "Migration reversed");
        count += 1;
    }
}
