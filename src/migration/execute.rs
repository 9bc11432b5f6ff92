use tracing::{debug, error};

use crate::engine::EngineConnection;
use crate::error::{DbQueueError, MigrationStage};
use crate::migration::files::MigrationSet;
use crate::migration::sandbox::{QUERY_DELIMITER, ScriptOutput, spawn_script};
use crate::types::IsolationLevel;

/// Split a migration SQL body on `-- QUERY DELIMITER` lines, dropping empty statements.
#[must_use]
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    for line in sql.lines() {
        if line.trim() == QUERY_DELIMITER {
            push_statement(&mut statements, &mut current);
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    push_statement(&mut statements, &mut current);
    statements
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
    current.clear();
}

/// Run every statement of `sql` inside one `ReadCommitted` transaction.
///
/// # Errors
/// Returns an `Execute`-stage [`DbQueueError::MigrationError`] after rolling back when any
/// statement fails, or when the transaction cannot be started or committed.
pub async fn execute_migration_sql(
    conn: &mut dyn EngineConnection,
    sql: &str,
    dqm: &str,
) -> Result<usize, DbQueueError> {
    let statements = split_statements(sql);
    let execute_error =
        |e: DbQueueError| DbQueueError::migration(MigrationStage::Execute, e.to_string());

    let tx = conn
        .begin_transaction(IsolationLevel::ReadCommitted)
        .await
        .map_err(execute_error)?;
    for (index, statement) in statements.iter().enumerate() {
        if let Err(e) = conn.execute_batch(statement).await {
            error!(dqm = %dqm, statement = index + 1, "Migration statement failed: {e}");
            if let Err(rollback) = conn.rollback_transaction(tx).await {
                error!(dqm = %dqm, "Rollback after failed migration statement failed: {rollback}");
            }
            return Err(execute_error(e));
        }
    }
    conn.commit_transaction(tx).await.map_err(execute_error)?;
    debug!(dqm = %dqm, statements = statements.len(), "Migration SQL committed");
    Ok(statements.len())
}

/// Load migration `number` from `set`, run its script, and execute its `load` SQL.
///
/// The module, file and compile stages all finish before the connection is used, so a
/// failure in any of them leaves the database untouched.
///
/// # Errors
/// Returns [`DbQueueError::MigrationError`] tagged with the stage that failed.
pub async fn execute_single_migration(
    conn: &mut dyn EngineConnection,
    set: &MigrationSet,
    number: i64,
    engine_name: &str,
    schema: &str,
    dqm: &str,
) -> Result<ScriptOutput, DbQueueError> {
    if set.is_empty() {
        return Err(DbQueueError::migration(
            MigrationStage::Module,
            format!("migration set '{}' has no scripts", set.design()),
        ));
    }
    let file = set.file(number).ok_or_else(|| {
        DbQueueError::migration(
            MigrationStage::File,
            format!("{}_{number}.rhai not found", set.design()),
        )
    })?;
    let output = spawn_script(set, file, engine_name, schema, dqm).await?;

    if let Some(load) = output.load.as_deref() {
        execute_migration_sql(conn, load, dqm).await?;
    }
    debug!(dqm = %dqm, migration = number, file = %file.name, "Migration script loaded");
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_delimiter_lines() {
        let sql = "CREATE TABLE a (id INT);\n-- QUERY DELIMITER\n\n  -- QUERY DELIMITER  \nINSERT INTO a VALUES (1);\n";
        assert_eq!(
            split_statements(sql),
            vec!["CREATE TABLE a (id INT);", "INSERT INTO a VALUES (1);"]
        );
        assert!(split_statements("  \n-- QUERY DELIMITER\n").is_empty());
        assert_eq!(split_statements("SELECT 1 -- QUERY DELIMITER"), vec!["SELECT 1 -- QUERY DELIMITER"]);
    }
}
