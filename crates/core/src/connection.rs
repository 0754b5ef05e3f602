//! One logical database connection.
//!
//! The [`ConnectionManager`] owns a [`Driver`] by moving it into a dedicated
//! worker task. Every request is queued to that worker, so SQL for one
//! connection runs serialized and completions arrive in issue order. Callers
//! never wait on I/O: each request returns a [`Pending`] that resolves once
//! the worker is done, and lifecycle changes are published as
//! [`ConnectionEvent`]s.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::ConnectionConfig;
use crate::driver::{
    Driver, DriverError, OpenParams, QueryOutcome, Schema, Statement, TableMetadata,
};
use crate::events::{event_channel, ConnectionEvent, EventSender, EventStream, HostKeyConfirmer};
use crate::notify::{Notifier, NullNotifier};
use crate::registry::ConnectionRegistry;
use crate::sql;
use crate::tunnel::{Tunnel, TunnelConnector, TunnelEvent, TunnelParams};

const NOTIFICATION_TITLE: &str = "Query complete";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Failed(String),
    Closed,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection has already been started")]
    AlreadyStarted,
    #[error("connection worker has stopped")]
    WorkerStopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("connection is not open")]
    NotConnected,
    #[error("connection worker has stopped")]
    WorkerStopped,
    #[error("{0}")]
    Execution(#[from] DriverError),
}

/// Result of a statement run through [`ConnectionManager::exec_query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executed {
    /// Rows retrieved for reads, rows affected for writes.
    pub row_count: u64,
    pub outcome: QueryOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub rows_affected: u64,
    pub last_insert_id: Option<u64>,
}

/// Completion of a request queued on the connection worker.
#[derive(Debug)]
#[must_use = "the request result is only observable through the pending handle"]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T, QueryError>>,
}

impl<T> Pending<T> {
    /// Non-blocking check for UI loops; `None` while the worker is busy.
    pub fn try_take(&mut self) -> Option<Result<T, QueryError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(QueryError::WorkerStopped)),
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T, QueryError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(QueryError::WorkerStopped)))
    }
}

type Reply<T> = oneshot::Sender<Result<T, QueryError>>;

enum Command {
    Start,
    UseDatabase { name: String, reply: Reply<()> },
    Exec { statement: Statement, reply: Reply<Executed> },
    Update { statement: Statement, reply: Reply<UpdateOutcome> },
    Metadata { table: String, reply: Reply<TableMetadata> },
    Columns { table: String, reply: Reply<Schema> },
    ColumnNames { table: String, reply: Reply<Vec<String>> },
    CreateTableSql { table: String, reply: Reply<String> },
    CreateTable { table: String, reply: Reply<Executed> },
    DropTable { table: String, reply: Reply<Executed> },
    Shutdown,
}

#[derive(Debug)]
struct Snapshot {
    state: ConnectionState,
    connection_name: Option<String>,
    database_name: String,
    databases: Vec<String>,
    tables: Vec<String>,
}

pub struct ConnectionManagerBuilder {
    config: ConnectionConfig,
    driver: Box<dyn Driver>,
    tunnel_connector: Option<Arc<dyn TunnelConnector>>,
    notifier: Arc<dyn Notifier>,
    registry: Option<Arc<ConnectionRegistry>>,
}

impl ConnectionManagerBuilder {
    #[must_use]
    pub fn tunnel_connector(mut self, connector: Arc<dyn TunnelConnector>) -> Self {
        self.tunnel_connector = Some(connector);
        self
    }

    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Defaults to the process-wide registry.
    #[must_use]
    pub fn registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Spawns the connection worker; must be called within a tokio runtime.
    /// No I/O happens until [`ConnectionManager::start`].
    #[must_use]
    pub fn build(self) -> (ConnectionManager, EventStream) {
        let (events, stream) = event_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let snapshot = Arc::new(Mutex::new(Snapshot {
            state: ConnectionState::Idle,
            connection_name: None,
            database_name: self.config.database_name.clone(),
            databases: Vec::new(),
            tables: Vec::new(),
        }));

        let worker = Worker {
            config: self.config.clone(),
            driver: self.driver,
            snapshot: Arc::clone(&snapshot),
            events: events.clone(),
            notifier: self.notifier,
            registry: self
                .registry
                .unwrap_or_else(|| Arc::clone(shared_registry())),
            tunnel_connector: self.tunnel_connector,
            tunnel: None,
        };
        let worker = tokio::spawn(worker.run(command_rx));

        (
            ConnectionManager {
                config: self.config,
                commands,
                snapshot,
                events,
                started: AtomicBool::new(false),
                worker: Some(worker),
            },
            stream,
        )
    }
}

fn shared_registry() -> &'static Arc<ConnectionRegistry> {
    static REGISTRY: OnceLock<Arc<ConnectionRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Arc::new(ConnectionRegistry::new()))
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: Arc<Mutex<Snapshot>>,
    events: EventSender,
    started: AtomicBool,
    worker: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    #[must_use]
    pub fn builder(config: ConnectionConfig, driver: Box<dyn Driver>) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            config,
            driver,
            tunnel_connector: None,
            notifier: Arc::new(NullNotifier),
            registry: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Begins opening the connection, tunneled or direct. The outcome is
    /// reported as exactly one `ConnectionSuccess` or `ConnectionFailed`.
    pub fn start(&self) -> Result<(), ConnectionError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ConnectionError::AlreadyStarted);
        }
        self.commands
            .send(Command::Start)
            .map_err(|_| ConnectionError::WorkerStopped)
    }

    pub fn use_database(&self, name: impl Into<String>) -> Pending<()> {
        let name = name.into();
        self.request(|reply| Command::UseDatabase { name, reply })
    }

    pub fn exec_query(&self, statement: Statement) -> Pending<Executed> {
        self.request(|reply| Command::Exec { statement, reply })
    }

    pub fn query_table_content(&self, statement: Statement) -> Pending<Executed> {
        self.exec_query(statement)
    }

    pub fn query_table_update(&self, statement: Statement) -> Pending<UpdateOutcome> {
        self.request(|reply| Command::Update { statement, reply })
    }

    pub fn query_table_metadata(&self, table: impl Into<String>) -> Pending<TableMetadata> {
        let table = table.into();
        self.request(|reply| Command::Metadata { table, reply })
    }

    pub fn query_table_columns(&self, table: impl Into<String>) -> Pending<Schema> {
        let table = table.into();
        self.request(|reply| Command::Columns { table, reply })
    }

    pub fn column_names(&self, table: impl Into<String>) -> Pending<Vec<String>> {
        let table = table.into();
        self.request(|reply| Command::ColumnNames { table, reply })
    }

    pub fn query_create_table(&self, table: impl Into<String>) -> Pending<String> {
        let table = table.into();
        self.request(|reply| Command::CreateTableSql { table, reply })
    }

    pub fn create_table(&self, table: impl Into<String>) -> Pending<Executed> {
        let table = table.into();
        self.request(|reply| Command::CreateTable { table, reply })
    }

    pub fn delete_table(&self, table: impl Into<String>) -> Pending<Executed> {
        let table = table.into();
        self.request(|reply| Command::DropTable { table, reply })
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.snapshot.lock().state.clone()
    }

    #[must_use]
    pub fn connection_name(&self) -> Option<String> {
        self.snapshot.lock().connection_name.clone()
    }

    #[must_use]
    pub fn database_name(&self) -> String {
        self.snapshot.lock().database_name.clone()
    }

    #[must_use]
    pub fn databases(&self) -> Vec<String> {
        self.snapshot.lock().databases.clone()
    }

    #[must_use]
    pub fn tables(&self) -> Vec<String> {
        self.snapshot.lock().tables.clone()
    }

    pub(crate) fn events(&self) -> &EventSender {
        &self.events
    }

    /// Closes the driver, releases the handle name and tears down the tunnel,
    /// waiting for the workers to exit. Later calls do nothing.
    pub async fn cleanup(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.commands.send(Command::Shutdown);
        if let Err(error) = worker.await {
            tracing::warn!(%error, "connection worker ended abnormally");
        }
    }

    fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Pending<T> {
        let (reply, rx) = oneshot::channel();
        // A stopped worker drops the reply, which resolves as WorkerStopped.
        let _ = self.commands.send(command(reply));
        Pending { rx }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.commands.send(Command::Shutdown);
        }
    }
}

struct Worker {
    config: ConnectionConfig,
    driver: Box<dyn Driver>,
    snapshot: Arc<Mutex<Snapshot>>,
    events: EventSender,
    notifier: Arc<dyn Notifier>,
    registry: Arc<ConnectionRegistry>,
    tunnel_connector: Option<Arc<dyn TunnelConnector>>,
    tunnel: Option<Tunnel>,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Shutdown => break,
                Command::Start => self.start().await,
                Command::UseDatabase { name, reply } => {
                    let _ = reply.send(self.use_database(name).await);
                }
                Command::Exec { statement, reply } => {
                    let _ = reply.send(self.exec_query(&statement).await);
                }
                Command::Update { statement, reply } => {
                    let result = self.exec_query(&statement).await.map(|executed| UpdateOutcome {
                        rows_affected: executed.outcome.rows_affected,
                        last_insert_id: executed.outcome.last_insert_id,
                    });
                    let _ = reply.send(result);
                }
                Command::Metadata { table, reply } => {
                    let result = match self.ensure_open() {
                        Ok(()) => self.driver.metadata(&table).await.map_err(QueryError::from),
                        Err(error) => Err(error),
                    };
                    let _ = reply.send(result);
                }
                Command::Columns { table, reply } => {
                    let result = match self.ensure_open() {
                        Ok(()) => self.driver.columns(&table).await.map_err(QueryError::from),
                        Err(error) => Err(error),
                    };
                    let _ = reply.send(result);
                }
                Command::ColumnNames { table, reply } => {
                    let result = match self.ensure_open() {
                        Ok(()) => self
                            .driver
                            .record(&table)
                            .await
                            .map(|record| record.into_iter().map(|column| column.name).collect())
                            .map_err(QueryError::from),
                        Err(error) => Err(error),
                    };
                    let _ = reply.send(result);
                }
                Command::CreateTableSql { table, reply } => {
                    let _ = reply.send(self.create_table_sql(&table).await);
                }
                Command::CreateTable { table, reply } => {
                    let statement = Statement::new(self.driver.create_table_query(&table));
                    let _ = reply.send(self.exec_ddl(&statement).await);
                }
                Command::DropTable { table, reply } => {
                    let statement = Statement::new(sql::drop_table_sql(&table));
                    let _ = reply.send(self.exec_ddl(&statement).await);
                }
            }
        }
        self.teardown().await;
    }

    async fn start(&mut self) {
        self.snapshot.lock().state = ConnectionState::Connecting;

        let Some(params) = TunnelParams::from_config(&self.config) else {
            let host = self.config.host.clone();
            let port = self.config.port;
            self.open_database(&host, port).await;
            return;
        };

        let Some(connector) = self.tunnel_connector.clone() else {
            self.fail("SSH tunnel requested but no tunnel connector is available".to_string());
            return;
        };

        let confirmer = HostKeyConfirmer::new(self.events.clone());
        let (tunnel, outcome) = Tunnel::spawn(params, connector, confirmer);
        self.tunnel = Some(tunnel);

        match outcome.await {
            Ok(TunnelEvent::Opened {
                local_host,
                local_port,
            }) => self.open_database(&local_host, local_port).await,
            Ok(TunnelEvent::Failed(message)) => {
                self.shutdown_tunnel().await;
                self.fail(message);
            }
            Err(_) => {
                self.shutdown_tunnel().await;
                self.fail("SSH tunnel worker stopped before reporting".to_string());
            }
        }
    }

    async fn open_database(&mut self, host: &str, port: u16) {
        let connection_name = self.registry.register();
        let params = OpenParams {
            connection_name: connection_name.clone(),
            host: host.to_string(),
            port,
            database: self.config.database_name.clone(),
            user: self.config.username.clone(),
            password: self.config.password.clone(),
        };
        tracing::info!(
            connection = %connection_name,
            driver = %self.config.driver_name,
            "opening database at {host}:{port}"
        );

        if let Err(error) = self.driver.open(&params).await {
            self.registry.release(&connection_name);
            self.shutdown_tunnel().await;
            self.fail(error.to_string());
            return;
        }

        let databases = self.driver.databases().await.unwrap_or_else(|error| {
            tracing::warn!(%error, "failed to list databases");
            Vec::new()
        });
        {
            let mut snapshot = self.snapshot.lock();
            snapshot.state = ConnectionState::Open;
            snapshot.connection_name = Some(connection_name);
            snapshot.databases = databases;
        }
        if !self.config.database_name.is_empty() {
            self.populate_tables().await;
        }
        self.events.emit(ConnectionEvent::ConnectionSuccess);
    }

    fn fail(&mut self, message: String) {
        tracing::warn!(%message, "connection failed");
        self.snapshot.lock().state = ConnectionState::Failed(message.clone());
        self.events.emit(ConnectionEvent::ConnectionFailed(message));
    }

    fn ensure_open(&self) -> Result<(), QueryError> {
        if self.snapshot.lock().state == ConnectionState::Open {
            Ok(())
        } else {
            Err(QueryError::NotConnected)
        }
    }

    async fn populate_tables(&mut self) {
        let tables = self.driver.table_names().await.unwrap_or_else(|error| {
            tracing::warn!(%error, "failed to list tables");
            Vec::new()
        });
        self.snapshot.lock().tables = tables;
    }

    async fn use_database(&mut self, name: String) -> Result<(), QueryError> {
        self.exec_query(&Statement::new(sql::use_database_sql(&name)))
            .await?;
        self.snapshot.lock().database_name.clone_from(&name);
        self.populate_tables().await;
        self.events.emit(ConnectionEvent::DatabaseChanged(name));
        Ok(())
    }

    async fn exec_query(&mut self, statement: &Statement) -> Result<Executed, QueryError> {
        let result = match self.ensure_open() {
            Ok(()) => self
                .driver
                .execute(statement)
                .await
                .map_err(QueryError::from),
            Err(error) => Err(error),
        };

        let (row_count, status) = match &result {
            Ok(outcome) if outcome.is_select() => {
                let rows = self.driver.count_rows(outcome);
                (rows, format!("{rows} rows retrieved"))
            }
            Ok(outcome) => (
                outcome.rows_affected,
                format!("{} rows affected", outcome.rows_affected),
            ),
            Err(error) => (0, format!("Error: {error}")),
        };
        tracing::debug!(sql = %statement.sql, %status, "query executed");

        if !self.notifier.app_has_focus() {
            self.notifier.notify(NOTIFICATION_TITLE, &status);
        }
        self.events.emit(ConnectionEvent::QueryExecuted {
            statement: statement.sql.clone(),
            status,
        });

        result.map(|outcome| Executed { row_count, outcome })
    }

    async fn exec_ddl(&mut self, statement: &Statement) -> Result<Executed, QueryError> {
        let executed = self.exec_query(statement).await?;
        self.populate_tables().await;
        Ok(executed)
    }

    async fn create_table_sql(&mut self, table: &str) -> Result<String, QueryError> {
        self.ensure_open()?;
        let outcome = self
            .driver
            .execute(&Statement::new(sql::show_create_table_sql(table)))
            .await?;
        outcome
            .rows
            .first()
            .and_then(|row| row.value(1))
            .map(str::to_string)
            .ok_or_else(|| {
                QueryError::Execution(DriverError::new(format!(
                    "no CREATE TABLE statement returned for `{table}`"
                )))
            })
    }

    async fn shutdown_tunnel(&mut self) {
        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.shutdown().await;
        }
    }

    async fn teardown(&mut self) {
        let connection_name = self.snapshot.lock().connection_name.take();
        if let Some(connection_name) = connection_name {
            self.driver.close().await;
            self.registry.release(&connection_name);
            tracing::info!(connection = %connection_name, "database connection closed");
        }
        self.shutdown_tunnel().await;
        self.snapshot.lock().state = ConnectionState::Closed;
    }
}
