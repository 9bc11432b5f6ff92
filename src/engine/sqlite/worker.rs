use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use rusqlite::TransactionBehavior;
use rusqlite::types::Value;
use tokio::sync::oneshot;

use crate::engine::RawRows;
use crate::error::DbQueueError;
use crate::types::IsolationLevel;

use super::values::sqlite_extract_value;

type Reply<T> = oneshot::Sender<Result<T, DbQueueError>>;

pub(super) enum Command {
    Execute {
        sql: String,
        params: Vec<Value>,
        cached: bool,
        respond_to: Reply<RawRows>,
    },
    ExecuteBatch {
        sql: String,
        respond_to: Reply<()>,
    },
    Prepare {
        sql: String,
        respond_to: Reply<()>,
    },
    BeginTransaction {
        isolation: IsolationLevel,
        respond_to: Reply<u64>,
    },
    CommitTx {
        tx_id: u64,
        respond_to: Reply<()>,
    },
    RollbackTx {
        tx_id: u64,
        respond_to: Reply<()>,
    },
    Ping {
        respond_to: Reply<()>,
    },
    Shutdown,
}

/// Handle to the thread that owns one `rusqlite::Connection`.
pub(super) struct SqliteWorker {
    sender: Sender<Command>,
}

impl SqliteWorker {
    /// Open `path` on a dedicated thread and wait for the open to finish.
    pub(super) async fn spawn(path: String, label: &str) -> Result<Self, DbQueueError> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let (opened_tx, opened_rx) = oneshot::channel();
        thread::Builder::new()
            .name(format!("sqlite-{label}"))
            .spawn(move || match rusqlite::Connection::open(&path) {
                Ok(mut conn) => {
                    let _ = opened_tx.send(Ok(()));
                    run_sqlite_worker(&mut conn, &receiver);
                }
                Err(err) => {
                    let _ = opened_tx.send(Err(DbQueueError::ConnectionError(format!(
                        "failed to open SQLite database '{path}': {err}"
                    ))));
                }
            })
            .map_err(|err| {
                DbQueueError::ConnectionError(format!("failed to spawn SQLite worker thread: {err}"))
            })?;

        opened_rx
            .await
            .map_err(|_| connection_error("SQLite worker exited before opening"))??;
        Ok(Self { sender })
    }

    fn send_command(&self, command: Command) -> Result<(), DbQueueError> {
        self.sender
            .send(command)
            .map_err(|_| connection_error("SQLite worker closed"))
    }

    pub(super) async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
        drop_message: &'static str,
    ) -> Result<T, DbQueueError> {
        let (tx, rx) = oneshot::channel();
        self.send_command(build(tx))?;
        rx.await.map_err(|_| connection_error(drop_message))?
    }
}

impl Drop for SqliteWorker {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
    }
}

fn connection_error(message: &str) -> DbQueueError {
    DbQueueError::ConnectionError(message.to_string())
}

fn run_sqlite_worker(conn: &mut rusqlite::Connection, receiver: &Receiver<Command>) {
    // Transaction ids never leave this thread.
    let mut next_tx_id: u64 = 1;

    while let Ok(command) = receiver.recv() {
        match command {
            Command::Shutdown => break,
            Command::BeginTransaction {
                isolation,
                respond_to,
            } => match begin(conn, isolation) {
                Ok(tx) => {
                    let tx_id = next_tx_id;
                    next_tx_id = next_tx_id.saturating_add(1);
                    let _ = respond_to.send(Ok(tx_id));
                    // rusqlite::Transaction borrows the connection, so it lives in its own
                    // loop until commit or rollback.
                    if run_tx_loop(tx_id, tx, receiver) == LoopExit::Shutdown {
                        break;
                    }
                }
                Err(err) => {
                    let _ = respond_to.send(Err(err));
                }
            },
            Command::CommitTx { respond_to, .. } | Command::RollbackTx { respond_to, .. } => {
                let _ = respond_to.send(Err(DbQueueError::QueryError(
                    "no active SQLite transaction".into(),
                )));
            }
            other => dispatch(conn, other),
        }
    }
}

#[derive(PartialEq, Eq)]
enum LoopExit {
    Finished,
    Shutdown,
}

fn begin(
    conn: &mut rusqlite::Connection,
    isolation: IsolationLevel,
) -> Result<rusqlite::Transaction<'_>, DbQueueError> {
    let read_uncommitted = i32::from(isolation == IsolationLevel::ReadUncommitted);
    conn.pragma_update(None, "read_uncommitted", read_uncommitted)?;
    let behavior = match isolation {
        IsolationLevel::Serializable => TransactionBehavior::Immediate,
        _ => TransactionBehavior::Deferred,
    };
    Ok(conn.transaction_with_behavior(behavior)?)
}

fn run_tx_loop(tx_id: u64, tx: rusqlite::Transaction<'_>, receiver: &Receiver<Command>) -> LoopExit {
    while let Ok(command) = receiver.recv() {
        match command {
            Command::CommitTx {
                tx_id: id,
                respond_to,
            } => {
                if id != tx_id {
                    let _ = respond_to.send(Err(tx_id_mismatch(tx_id, id)));
                    continue;
                }
                let _ = respond_to.send(tx.commit().map_err(DbQueueError::from));
                return LoopExit::Finished;
            }
            Command::RollbackTx {
                tx_id: id,
                respond_to,
            } => {
                if id != tx_id {
                    let _ = respond_to.send(Err(tx_id_mismatch(tx_id, id)));
                    continue;
                }
                let _ = respond_to.send(tx.rollback().map_err(DbQueueError::from));
                return LoopExit::Finished;
            }
            Command::BeginTransaction { respond_to, .. } => {
                let _ = respond_to.send(Err(DbQueueError::QueryError(
                    "SQLite transaction already in progress".into(),
                )));
            }
            // Dropping the transaction on shutdown rolls it back.
            Command::Shutdown => return LoopExit::Shutdown,
            other => dispatch(&tx, other),
        }
    }
    LoopExit::Shutdown
}

/// Statement-level commands; valid both inside and outside a transaction.
fn dispatch(conn: &rusqlite::Connection, command: Command) {
    match command {
        Command::Execute {
            sql,
            params,
            cached,
            respond_to,
        } => {
            let _ = respond_to.send(execute(conn, &sql, &params, cached));
        }
        Command::ExecuteBatch { sql, respond_to } => {
            let _ = respond_to.send(conn.execute_batch(&sql).map_err(DbQueueError::from));
        }
        Command::Prepare { sql, respond_to } => {
            let outcome = conn.prepare_cached(&sql).map(|_| ()).map_err(DbQueueError::from);
            let _ = respond_to.send(outcome);
        }
        Command::Ping { respond_to } => {
            let outcome = conn
                .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map(|_| ())
                .map_err(DbQueueError::from);
            let _ = respond_to.send(outcome);
        }
        Command::BeginTransaction { .. }
        | Command::CommitTx { .. }
        | Command::RollbackTx { .. }
        | Command::Shutdown => {}
    }
}

fn execute(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[Value],
    cached: bool,
) -> Result<RawRows, DbQueueError> {
    if cached {
        let mut stmt = conn.prepare_cached(sql)?;
        run_statement(&mut stmt, params)
    } else {
        let mut stmt = conn.prepare(sql)?;
        run_statement(&mut stmt, params)
    }
}

fn run_statement(stmt: &mut rusqlite::Statement<'_>, params: &[Value]) -> Result<RawRows, DbQueueError> {
    let param_refs: Vec<&dyn rusqlite::ToSql> =
        params.iter().map(|v| v as &dyn rusqlite::ToSql).collect();

    if stmt.column_count() == 0 {
        let affected = stmt.execute(&param_refs[..])?;
        return Ok(RawRows {
            affected: affected as u64,
            ..RawRows::default()
        });
    }

    let columns: Vec<String> = stmt
        .column_names()
        .iter()
        .map(std::string::ToString::to_string)
        .collect();
    let col_count = columns.len();
    let mut rows_iter = stmt.query(&param_refs[..])?;
    let mut rows = Vec::new();
    while let Some(row) = rows_iter.next()? {
        let mut values = Vec::with_capacity(col_count);
        for i in 0..col_count {
            values.push(sqlite_extract_value(row, i)?);
        }
        rows.push(values);
    }
    drop(rows_iter);

    // RETURNING statements report their row count as affected rows.
    let affected = if stmt.readonly() { 0 } else { rows.len() as u64 };
    Ok(RawRows {
        columns,
        rows,
        affected,
    })
}

fn tx_id_mismatch(active: u64, requested: u64) -> DbQueueError {
    DbQueueError::QueryError(format!(
        "SQLite transaction mismatch: active {active}, requested {requested}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_and_fresh_statements_agree() -> Result<(), Box<dyn std::error::Error>> {
        let conn = rusqlite::Connection::open_in_memory()?;
        conn.execute_batch("CREATE TABLE t (id INTEGER, name TEXT);")?;
        let insert = execute(
            &conn,
            "INSERT INTO t VALUES (?, ?)",
            &[Value::Integer(1), Value::Text("ann".into())],
            false,
        )?;
        assert_eq!(insert.affected, 1);
        assert!(insert.columns.is_empty());

        for cached in [true, false, true] {
            let rows = execute(&conn, "SELECT name FROM t WHERE id = ?", &[Value::Integer(1)], cached)?;
            assert_eq!(rows.columns, vec!["name".to_string()]);
            assert_eq!(rows.rows.len(), 1);
            assert_eq!(rows.affected, 0);
        }
        Ok(())
    }
}
