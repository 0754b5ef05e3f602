//! Paged, filterable, editable view over a single table.
//!
//! The model borrows its [`ConnectionManager`] and issues every statement
//! through it, so all SQL stays on the connection worker and every outcome is
//! also reported on the manager's `QueryExecuted` channel.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::connection::{ConnectionManager, QueryError};
use crate::driver::{ColumnDescriptor, QueryRow, Statement};
use crate::events::ConnectionEvent;
use crate::sql;

#[derive(Debug, Error)]
pub enum ContentModelError {
    #[error("table `{0}` has no primary key; editing is disabled")]
    NoPrimaryKey(String),
    #[error("row {0} is outside the current window")]
    RowOutOfRange(usize),
    #[error("column index {0} is out of range")]
    ColumnOutOfRange(usize),
    #[error("row {0} has a NULL primary key")]
    NullPrimaryKey(usize),
    #[error("unknown column `{0}`")]
    UnknownColumn(String),
    #[error("unsupported filter operator `{0}`")]
    UnsupportedOperator(String),
    #[error(transparent)]
    Query(#[from] QueryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    Equals,
}

impl FilterOperator {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Equals => "=",
        }
    }
}

impl FromStr for FilterOperator {
    type Err = ContentModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "=" => Ok(Self::Equals),
            other => Err(ContentModelError::UnsupportedOperator(other.to_string())),
        }
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Always carries a non-empty value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFilter {
    pub column: String,
    pub operator: FilterOperator,
    pub value: String,
}

pub struct TableContentModel<'c> {
    connection: &'c ConnectionManager,
    table: String,
    columns: Vec<ColumnDescriptor>,
    primary_key: Option<usize>,
    row_offset: u64,
    page_size: u64,
    total_rows: u64,
    filter: Option<TableFilter>,
    insert_pending: bool,
    rows: Vec<QueryRow>,
}

impl<'c> TableContentModel<'c> {
    /// Resolves the primary key, the column list and the row count, in that
    /// order. A table without a single-column key is still browsable but
    /// read-only. The window stays empty until [`Self::select`].
    pub async fn describe(
        connection: &'c ConnectionManager,
        table: impl Into<String>,
        page_size: u64,
    ) -> Result<Self, ContentModelError> {
        let table = table.into();

        let primary_key = match connection
            .exec_query(Statement::new(sql::primary_key_sql(&table)))
            .await
        {
            Ok(executed) => match executed.outcome.rows.as_slice() {
                [row] => row.value(4).map(str::to_string),
                [] => None,
                parts => {
                    tracing::warn!(
                        %table,
                        columns = parts.len(),
                        "composite primary key; table is read-only"
                    );
                    None
                }
            },
            Err(error) => {
                tracing::warn!(%table, %error, "primary key lookup failed; table is read-only");
                None
            }
        };

        let columns: Vec<ColumnDescriptor> = connection
            .exec_query(Statement::new(sql::show_columns_sql(&table)))
            .await
            .inspect_err(|error| tracing::warn!(%table, %error, "column lookup failed"))?
            .outcome
            .rows
            .iter()
            .map(|row| ColumnDescriptor {
                name: row.value(0).unwrap_or_default().to_string(),
                declared_type: row.value(1).unwrap_or_default().to_string(),
            })
            .collect();

        let total_rows = connection
            .exec_query(Statement::new(sql::count_rows_sql(&table)))
            .await
            .inspect_err(|error| tracing::warn!(%table, %error, "row count failed"))?
            .outcome
            .rows
            .first()
            .and_then(|row| row.value(0))
            .and_then(|count| count.parse().ok())
            .unwrap_or(0);

        let primary_key = primary_key
            .and_then(|key| columns.iter().position(|column| column.name == key));
        tracing::debug!(%table, ?primary_key, total_rows, "described table");

        Ok(Self {
            connection,
            table,
            columns,
            primary_key,
            row_offset: 0,
            page_size: page_size.max(1),
            total_rows,
            filter: None,
            insert_pending: false,
            rows: Vec::new(),
        })
    }

    /// Replaces the whole window with the page at the current offset and
    /// publishes `PagesChanged`. Previous row indices are invalidated.
    pub async fn select(&mut self) -> Result<(), ContentModelError> {
        let filter = self
            .filter
            .as_ref()
            .map(|filter| (filter.column.as_str(), filter.value.as_str()));
        let statement = sql::page_select(&self.table, filter, self.row_offset, self.page_size);

        let executed = self
            .connection
            .query_table_content(statement)
            .await
            .inspect_err(|error| {
                tracing::warn!(table = %self.table, %error, "page select failed");
            })?;

        self.rows = executed.outcome.rows;
        self.insert_pending = false;
        self.connection.events().emit(ConnectionEvent::PagesChanged {
            offset: self.row_offset,
            page_size: self.page_size,
            total: self.total_rows,
        });
        Ok(())
    }

    /// Moves one page forward. Paging past the data yields an empty window.
    pub async fn next_page(&mut self) -> Result<(), ContentModelError> {
        self.row_offset = self.row_offset.saturating_add(self.page_size);
        self.select().await
    }

    pub async fn prev_page(&mut self) -> Result<(), ContentModelError> {
        self.row_offset = self.row_offset.saturating_sub(self.page_size);
        self.select().await
    }

    /// Jumps straight to zero-based `page` with a single select.
    pub async fn seek_page(&mut self, page: u64) -> Result<(), ContentModelError> {
        self.row_offset = page.saturating_mul(self.page_size);
        self.select().await
    }

    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Fetched rows plus the placeholder while an insert is pending.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len() + usize::from(self.insert_pending)
    }

    #[must_use]
    pub fn primary_key_column(&self) -> Option<&str> {
        self.primary_key
            .and_then(|index| self.columns.get(index))
            .map(|column| column.name.as_str())
    }

    #[must_use]
    pub fn is_editable(&self) -> bool {
        self.primary_key.is_some()
    }

    #[must_use]
    pub fn is_insert_pending(&self) -> bool {
        self.insert_pending
    }

    #[must_use]
    pub fn row_offset(&self) -> u64 {
        self.row_offset
    }

    #[must_use]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    #[must_use]
    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }

    #[must_use]
    pub fn filter(&self) -> Option<&TableFilter> {
        self.filter.as_ref()
    }

    /// `None` for SQL NULL and out-of-range cells; the pending-insert row
    /// reads as empty strings.
    #[must_use]
    pub fn cell_value(&self, row: usize, column: usize) -> Option<&str> {
        if column >= self.columns.len() {
            return None;
        }
        match self.rows.get(row) {
            Some(fetched) => fetched.value(column),
            None if self.insert_pending && row == self.rows.len() => Some(""),
            None => None,
        }
    }

    /// Appends a placeholder row; nothing is sent until [`Self::commit_cell`].
    pub fn begin_insert(&mut self) -> Result<(), ContentModelError> {
        self.require_primary_key()?;
        self.insert_pending = true;
        Ok(())
    }

    /// Committing on the placeholder row inserts a new row whose primary key
    /// is `value`. Any other row is updated in place and the page reloaded.
    pub async fn commit_cell(
        &mut self,
        row: usize,
        column: usize,
        value: &str,
    ) -> Result<(), ContentModelError> {
        let key_index = self.require_primary_key()?;
        if column >= self.columns.len() {
            return Err(ContentModelError::ColumnOutOfRange(column));
        }
        let key_column = self.columns[key_index].name.clone();

        if self.insert_pending && row == self.rows.len() {
            let statement = sql::insert_key(&self.table, &key_column, value);
            self.connection
                .query_table_update(statement)
                .await
                .inspect_err(|error| {
                    tracing::warn!(table = %self.table, %error, "insert failed");
                })?;
            self.insert_pending = false;
            self.total_rows += 1;
            return self.select().await;
        }

        let key_value = self.key_value(row, key_index)?;
        let statement = sql::update_cell(
            &self.table,
            &self.columns[column].name,
            value,
            &key_column,
            &key_value,
        );
        self.connection
            .query_table_update(statement)
            .await
            .inspect_err(|error| {
                tracing::warn!(table = %self.table, %error, "update failed");
            })?;
        self.select().await
    }

    /// Deletes fetched rows `[first, first + count)` with a single statement.
    /// `total_rows` only moves when the delete succeeds.
    pub async fn delete_rows(&mut self, first: usize, count: usize) -> Result<(), ContentModelError> {
        let key_index = self.require_primary_key()?;
        if count == 0 {
            return Ok(());
        }
        let end = first
            .checked_add(count)
            .filter(|end| *end <= self.rows.len())
            .ok_or(ContentModelError::RowOutOfRange(first.saturating_add(count) - 1))?;

        let keys = (first..end)
            .map(|row| self.key_value(row, key_index))
            .collect::<Result<Vec<_>, _>>()?;
        let statement = sql::delete_keys(&self.table, &self.columns[key_index].name, &keys);
        self.connection
            .query_table_update(statement)
            .await
            .inspect_err(|error| {
                tracing::warn!(table = %self.table, %error, "delete failed");
            })?;
        self.total_rows = self.total_rows.saturating_sub(count as u64);
        Ok(())
    }

    /// An empty `value` clears the filter. Takes effect on the next select.
    pub fn set_filter(
        &mut self,
        column: &str,
        operator: &str,
        value: &str,
    ) -> Result<(), ContentModelError> {
        let operator = operator.parse::<FilterOperator>()?;
        if !self.columns.iter().any(|descriptor| descriptor.name == column) {
            return Err(ContentModelError::UnknownColumn(column.to_string()));
        }
        if value.is_empty() {
            self.filter = None;
            return Ok(());
        }
        self.filter = Some(TableFilter {
            column: column.to_string(),
            operator,
            value: value.to_string(),
        });
        Ok(())
    }

    pub fn clear_filter(&mut self) {
        self.filter = None;
    }

    fn key_value(&self, row: usize, key_index: usize) -> Result<String, ContentModelError> {
        self.rows
            .get(row)
            .ok_or(ContentModelError::RowOutOfRange(row))?
            .value(key_index)
            .map(str::to_string)
            .ok_or(ContentModelError::NullPrimaryKey(row))
    }

    fn require_primary_key(&self) -> Result<usize, ContentModelError> {
        self.primary_key
            .ok_or_else(|| ContentModelError::NoPrimaryKey(self.table.clone()))
    }
}
