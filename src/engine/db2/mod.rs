//! IBM DB2 adapter.
//!
//! The CLI library is loaded at runtime, so builds never link against DB2. Each connection
//! runs on its own thread because CLI handles are blocking and not `Send`.

mod cli;

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::debug;

use crate::connstring::ConnectionConfig;
use crate::engine::{EngineAdapter, EngineConnection, PreparedStatement, RawRows, TxTracker};
use crate::error::DbQueueError;
use crate::types::{EngineType, IsolationLevel, QueryRequest, QueryResult, Transaction, TypedValue};

use cli::CliConnection;

/// DB2 adapter; `library` overrides the platform's default CLI library name.
#[derive(Debug, Clone, Default)]
pub struct Db2Adapter {
    pub library: Option<String>,
}

#[async_trait]
impl EngineAdapter for Db2Adapter {
    fn engine_type(&self) -> EngineType {
        EngineType::Db2
    }

    async fn connect(
        &self,
        config: &ConnectionConfig,
        label: &str,
    ) -> Result<Box<dyn EngineConnection>, DbQueueError> {
        let api = cli::api(self.library.as_deref())?;
        let (sender, receiver) = mpsc::channel::<Command>();
        let (opened_tx, opened_rx) = oneshot::channel();
        let conn_str = config.raw.clone();
        thread::Builder::new()
            .name(format!("db2-{label}"))
            .spawn(move || match CliConnection::connect(api, &conn_str) {
                Ok(conn) => {
                    let _ = opened_tx.send(Ok(()));
                    run_db2_worker(&conn, &receiver);
                }
                Err(e) => {
                    let _ = opened_tx.send(Err(e));
                }
            })
            .map_err(|e| {
                DbQueueError::ConnectionError(format!("failed to spawn DB2 worker thread: {e}"))
            })?;
        opened_rx
            .await
            .map_err(|_| DbQueueError::ConnectionError("DB2 worker exited before connecting".into()))??;
        debug!(dqm = %label, host = %config.host, db = %config.database, "connected to DB2");
        Ok(Box::new(Db2Connection {
            sender,
            tx: TxTracker::default(),
        }))
    }
}

type Reply<T> = oneshot::Sender<Result<T, DbQueueError>>;

enum Command {
    Execute {
        sql: String,
        params: Vec<TypedValue>,
        respond_to: Reply<RawRows>,
    },
    Begin {
        isolation: IsolationLevel,
        respond_to: Reply<()>,
    },
    End {
        commit: bool,
        respond_to: Reply<()>,
    },
    Shutdown,
}

fn run_db2_worker(conn: &CliConnection, receiver: &Receiver<Command>) {
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Execute {
                sql,
                params,
                respond_to,
            } => {
                let _ = respond_to.send(conn.execute(&sql, &params));
            }
            Command::Begin {
                isolation,
                respond_to,
            } => {
                let outcome = conn
                    .set_isolation(isolation)
                    .and_then(|()| conn.set_autocommit(false));
                let _ = respond_to.send(outcome);
            }
            Command::End { commit, respond_to } => {
                let outcome = conn
                    .end_transaction(commit)
                    .and_then(|()| conn.set_autocommit(true));
                let _ = respond_to.send(outcome);
            }
            Command::Shutdown => break,
        }
    }
}

pub struct Db2Connection {
    sender: Sender<Command>,
    tx: TxTracker,
}

impl Db2Connection {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, DbQueueError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .map_err(|_| DbQueueError::ConnectionError("DB2 worker closed".into()))?;
        rx.await
            .map_err(|_| DbQueueError::ConnectionError("DB2 worker dropped response".into()))?
    }

    async fn run(&self, sql: &str, params: &[TypedValue]) -> Result<QueryResult, DbQueueError> {
        let started = Instant::now();
        let sql = sql.to_string();
        let params = params.to_vec();
        let rows = self
            .request(|respond_to| Command::Execute {
                sql,
                params,
                respond_to,
            })
            .await?;
        rows.into_result(started)
    }

    async fn end(&mut self, tx: &Transaction, commit: bool) -> Result<(), DbQueueError> {
        self.tx.finish(tx)?;
        self.request(|respond_to| Command::End { commit, respond_to })
            .await
    }
}

#[async_trait]
impl EngineConnection for Db2Connection {
    fn engine_type(&self) -> EngineType {
        EngineType::Db2
    }

    async fn execute_query(&mut self, request: &QueryRequest) -> Result<QueryResult, DbQueueError> {
        self.run(&request.sql, &request.params).await
    }

    async fn prepare(&mut self, name: &str, sql: &str) -> Result<PreparedStatement, DbQueueError> {
        // The CLI re-prepares on execute; statements are tracked by text only.
        Ok(PreparedStatement {
            name: name.to_string(),
            sql: sql.to_string(),
        })
    }

    async fn execute_prepared(
        &mut self,
        stmt: &PreparedStatement,
        request: &QueryRequest,
    ) -> Result<QueryResult, DbQueueError> {
        self.run(&stmt.sql, &request.params).await
    }

    async fn execute_batch(&mut self, sql: &str) -> Result<(), DbQueueError> {
        self.run(sql, &[]).await.map(|_| ())
    }

    async fn begin_transaction(
        &mut self,
        isolation: IsolationLevel,
    ) -> Result<Transaction, DbQueueError> {
        let tx = self.tx.begin(isolation)?;
        if let Err(e) = self
            .request(|respond_to| Command::Begin {
                isolation,
                respond_to,
            })
            .await
        {
            self.tx.finish(&tx)?;
            return Err(e);
        }
        Ok(tx)
    }

    async fn commit_transaction(&mut self, tx: Transaction) -> Result<(), DbQueueError> {
        self.end(&tx, true).await
    }

    async fn rollback_transaction(&mut self, tx: Transaction) -> Result<(), DbQueueError> {
        self.end(&tx, false).await
    }

    async fn health_check(&mut self) -> bool {
        self.run("SELECT 1 FROM SYSIBM.SYSDUMMY1", &[]).await.is_ok()
    }

    async fn disconnect(&mut self) -> Result<(), DbQueueError> {
        let _ = self.sender.send(Command::Shutdown);
        Ok(())
    }
}

impl Drop for Db2Connection {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
    }
}
