use async_trait::async_trait;
use thiserror::Error;

/// Driver-native error text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DriverError {
    message: String,
}

impl DriverError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Null,
    Text(String),
    Int(i64),
    UInt(u64),
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<u64> for SqlValue {
    fn from(value: u64) -> Self {
        Self::UInt(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// SQL text plus positionally bound `?` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    #[must_use]
    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRow {
    pub values: Vec<Option<String>>,
}

impl QueryRow {
    #[must_use]
    pub fn new(values: Vec<Option<String>>) -> Self {
        Self { values }
    }

    #[must_use]
    pub fn value(&self, column: usize) -> Option<&str> {
        self.values.get(column).and_then(Option::as_deref)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryOutcome {
    /// Empty for statements that produce no result set.
    pub columns: Vec<String>,
    pub rows: Vec<QueryRow>,
    pub rows_affected: u64,
    pub last_insert_id: Option<u64>,
}

impl QueryOutcome {
    #[must_use]
    pub fn is_select(&self) -> bool {
        !self.columns.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub declared_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableMetadata {
    pub name: String,
    pub engine: Option<String>,
    pub row_estimate: Option<u64>,
    pub data_length: Option<u64>,
    pub collation: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SqlColumn {
    pub name: String,
    pub data_type: String,
    pub length: Option<String>,
    pub is_unsigned: bool,
    pub allow_null: bool,
    pub key: String,
    pub default_value: Option<String>,
    pub extra: String,
    pub collation: Option<String>,
    pub comment: String,
}

pub type Schema = Vec<SqlColumn>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenParams {
    pub connection_name: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

/// Capability over a concrete SQL engine. One instance backs one connection
/// and is only ever driven from that connection's worker.
#[async_trait]
pub trait Driver: Send {
    async fn open(&mut self, params: &OpenParams) -> Result<(), DriverError>;
    async fn close(&mut self);

    async fn execute(&mut self, statement: &Statement) -> Result<QueryOutcome, DriverError>;

    async fn databases(&mut self) -> Result<Vec<String>, DriverError>;
    async fn table_names(&mut self) -> Result<Vec<String>, DriverError>;
    async fn record(&mut self, table: &str) -> Result<Vec<ColumnDescriptor>, DriverError>;
    async fn metadata(&mut self, table: &str) -> Result<TableMetadata, DriverError>;
    async fn columns(&mut self, table: &str) -> Result<Schema, DriverError>;

    fn create_table_query(&self, table: &str) -> String;

    /// Rows produced by a read statement. Engines that do not report a
    /// selected-row count override this.
    fn count_rows(&self, outcome: &QueryOutcome) -> u64 {
        outcome.rows.len() as u64
    }
}
