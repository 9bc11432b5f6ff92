//! Forward and reverse schema migrations driven by numbered `rhai` scripts.
//!
//! A lead runs migrations in phases:
//!
//! * **load** runs each not-yet-loaded script and records its SQL in the ledger,
//! * **apply** executes loaded forward SQL strictly in ascending order,
//! * **test** (optional) walks the reverse SQL back down before re-applying.
//!
//! [`determine_action`] picks the next phase from the ledger alone, so the cycle driver in the
//! lead can re-evaluate after every step.

pub mod apply;
pub mod execute;
pub mod files;
pub mod reverse;
pub mod sandbox;

use tracing::{debug, warn};

use crate::cache::{LedgerEntry, LedgerKind, MigrationLedger};
use crate::engine::EngineConnection;
use crate::error::DbQueueError;

pub use apply::{apply_migrations, find_next_migration_to_apply};
pub use execute::{execute_migration_sql, execute_single_migration, split_statements};
pub use files::{MigrationFile, MigrationSet, MigrationSets};
pub use reverse::{find_next_reverse_migration_to_apply, reverse_migrations};
pub use sandbox::{QUERY_DELIMITER, ScriptOutput};

/// Upper bound on load/apply rounds per startup.
pub const MAX_MIGRATION_CYCLES: usize = 10;

/// What the lead should do next for its migrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationAction {
    Load,
    Apply,
    None,
}

/// Next migration phase given the ledger.
#[must_use]
pub fn determine_action(ledger: &MigrationLedger) -> MigrationAction {
    if ledger.loaded() < ledger.available() {
        MigrationAction::Load
    } else if find_next_migration_to_apply(Some(ledger)) != 0 {
        MigrationAction::Apply
    } else {
        MigrationAction::None
    }
}

/// Log the ledger counters in the fixed status-line form.
pub fn log_status(verb: &str, ledger: &MigrationLedger, dqm: &str) {
    debug!(
        dqm = %dqm,
        "Migration {verb}: Available = {}, Loaded = {}, Applied = {}",
        ledger.available(),
        ledger.loaded(),
        ledger.applied()
    );
}

/// Run every script above `loaded` and record its SQL in the ledger.
///
/// Stops at the first failure; everything loaded before it stays loaded.
///
/// # Errors
/// Returns the [`DbQueueError::MigrationError`] of the script that failed.
pub async fn load_migrations(
    conn: &mut dyn EngineConnection,
    set: &MigrationSet,
    ledger: &mut MigrationLedger,
    engine_name: &str,
    schema: &str,
    dqm: &str,
) -> Result<usize, DbQueueError> {
    if !ledger.set_available(set.latest_available()) {
        warn!(
            dqm = %dqm,
            alert = true,
            "Migration set '{}' ends at {} but {} are already loaded",
            set.design(),
            set.latest_available(),
            ledger.loaded()
        );
    }
    let pending: Vec<i64> = set.numbers().filter(|n| *n > ledger.loaded()).collect();

    let mut count = 0;
    for number in pending {
        let output =
            execute_single_migration(conn, set, number, engine_name, schema, dqm).await?;
        let description = output.description.unwrap_or_default();
        let parts = [
            (LedgerKind::Reverse, output.reverse),
            (LedgerKind::Diagram, output.diagram),
            (LedgerKind::Forward, Some(output.forward)),
        ];
        for (kind, sql) in parts {
            if let Some(sql) = sql {
                ledger.record(LedgerEntry {
                    number,
                    kind,
                    sql,
                    description: description.clone(),
                });
            }
        }
        count += 1;
    }
    Ok(count)
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::engine::EngineRegistry;
    use crate::types::QueryRequest;

    fn script(table: &str) -> String {
        format!(
            r#"fn run_migration(engine, design, schema) {{
                #{{
                    forward: "CREATE TABLE {table} (id INTEGER);\n-- QUERY DELIMITER\nINSERT INTO {table} VALUES (1);",
                    reverse: "DROP TABLE {table};",
                    description: "create {table}",
                }}
            }}"#
        )
    }

    #[test]
    fn load_apply_and_reverse_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            let set = MigrationSet::new("shop")
                .with_script("shop_1.rhai", &script("a"))?
                .with_script("shop_2.rhai", &script("b"))?;
            let mut conn = EngineRegistry::load().connect("sqlite::memory:", "test").await?;
            let mut ledger = MigrationLedger::default();

            assert_eq!(determine_action(&ledger), MigrationAction::None);
            assert_eq!(find_next_migration_to_apply(None), 0);

            let loaded =
                load_migrations(conn.as_mut(), &set, &mut ledger, "sqlite", "", "DQM-shop-00-SMFC")
                    .await?;
            assert_eq!(loaded, 2);
            assert_eq!((ledger.available(), ledger.loaded(), ledger.applied()), (2, 2, 0));
            assert_eq!(determine_action(&ledger), MigrationAction::Apply);

            let applied = apply_migrations(conn.as_mut(), &mut ledger, "DQM-shop-00-SMFC").await?;
            assert_eq!(applied, 2);
            assert_eq!(ledger.applied(), 2);
            assert_eq!(determine_action(&ledger), MigrationAction::None);
            let rows = conn
                .execute_query(&QueryRequest::new("q", "SELECT id FROM b"))
                .await?;
            assert_eq!(rows.row_count, 1);

            let reversed = reverse_migrations(conn.as_mut(), &mut ledger, "DQM-shop-00-SMFC").await?;
            assert_eq!(reversed, 2);
            assert_eq!(ledger.applied(), 0);
            assert!(
                conn.execute_query(&QueryRequest::new("q", "SELECT id FROM a"))
                    .await
                    .is_err()
            );
            Ok(())
        })
    }

    #[test]
    fn failed_migration_halts_and_rolls_back() -> Result<(), Box<dyn std::error::Error>> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            let broken = r#"fn run_migration(e, d, s) {
                "CREATE TABLE c (id INTEGER);\n-- QUERY DELIMITER\nINSERT INTO missing VALUES (1);"
            }"#;
            let set = MigrationSet::new("shop")
                .with_script("shop_1.rhai", &script("a"))?
                .with_script("shop_2.rhai", broken)?
                .with_script("shop_3.rhai", &script("d"))?;
            let mut conn = EngineRegistry::load().connect("sqlite::memory:", "test").await?;
            let mut ledger = MigrationLedger::default();
            load_migrations(conn.as_mut(), &set, &mut ledger, "sqlite", "", "t").await?;

            let err = apply_migrations(conn.as_mut(), &mut ledger, "t")
                .await
                .expect_err("migration 2 fails");
            assert_eq!(err.migration_stage(), Some(crate::error::MigrationStage::Execute));
            assert_eq!(ledger.applied(), 1);
            // The CREATE in the failed migration was rolled back with it.
            assert!(
                conn.execute_query(&QueryRequest::new("q", "SELECT id FROM c"))
                    .await
                    .is_err()
            );
            Ok(())
        })
    }

    #[test]
    fn load_stages_fail_before_touching_the_database() -> Result<(), Box<dyn std::error::Error>> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            let mut conn = EngineRegistry::load().connect("sqlite::memory:", "test").await?;
            let empty = MigrationSet::new("none");
            let err = execute_single_migration(conn.as_mut(), &empty, 1, "sqlite", "", "t")
                .await
                .expect_err("empty set");
            assert_eq!(err.migration_stage(), Some(crate::error::MigrationStage::Module));

            let set = MigrationSet::new("shop").with_script("shop_1.rhai", &script("a"))?;
            let err = execute_single_migration(conn.as_mut(), &set, 5, "sqlite", "", "t")
                .await
                .expect_err("missing file");
            assert_eq!(err.migration_stage(), Some(crate::error::MigrationStage::File));
            Ok(())
        })
    }
}
