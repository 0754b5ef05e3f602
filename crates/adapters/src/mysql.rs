use async_trait::async_trait;
use mysql_async::prelude::{Protocol, Queryable};
use mysql_async::{Conn, OptsBuilder, Params, QueryResult, Row, Value};
use sqlpane_core::driver::{
    ColumnDescriptor, Driver, DriverError, OpenParams, QueryOutcome, QueryRow, Schema, SqlColumn,
    SqlValue, Statement, TableMetadata,
};
use sqlpane_core::sql;

/// MySQL/MariaDB engine over a single `mysql_async` connection.
#[derive(Debug, Default)]
pub struct MysqlDriver {
    conn: Option<Conn>,
    connection_name: Option<String>,
}

impl MysqlDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn conn(&mut self) -> Result<&mut Conn, DriverError> {
        self.conn
            .as_mut()
            .ok_or_else(|| DriverError::new("MySQL connection is not open"))
    }
}

#[async_trait]
impl Driver for MysqlDriver {
    async fn open(&mut self, params: &OpenParams) -> Result<(), DriverError> {
        let conn = Conn::new(opts_from_params(params))
            .await
            .map_err(to_driver_error)?;
        self.conn = Some(conn);
        self.connection_name = Some(params.connection_name.clone());
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(error) = conn.disconnect().await {
                tracing::warn!(
                    connection = ?self.connection_name,
                    %error,
                    "MySQL disconnect failed"
                );
            }
        }
    }

    async fn execute(&mut self, statement: &Statement) -> Result<QueryOutcome, DriverError> {
        let conn = self.conn()?;
        // Text protocol for unparameterized SQL: USE and friends cannot be prepared.
        if statement.params.is_empty() {
            let result = conn
                .query_iter(statement.sql.as_str())
                .await
                .map_err(to_driver_error)?;
            drain(result).await
        } else {
            let params = Params::Positional(statement.params.iter().map(to_mysql_value).collect());
            let result = conn
                .exec_iter(statement.sql.as_str(), params)
                .await
                .map_err(to_driver_error)?;
            drain(result).await
        }
    }

    async fn databases(&mut self) -> Result<Vec<String>, DriverError> {
        self.conn()?
            .query_map("SHOW DATABASES", |database: String| database)
            .await
            .map_err(to_driver_error)
    }

    async fn table_names(&mut self) -> Result<Vec<String>, DriverError> {
        self.conn()?
            .query_map("SHOW TABLES", |table: String| table)
            .await
            .map_err(to_driver_error)
    }

    async fn record(&mut self, table: &str) -> Result<Vec<ColumnDescriptor>, DriverError> {
        let outcome = self
            .execute(&Statement::new(sql::show_columns_sql(table)))
            .await?;
        Ok(outcome
            .rows
            .iter()
            .map(|row| ColumnDescriptor {
                name: row.value(0).unwrap_or_default().to_string(),
                declared_type: row.value(1).unwrap_or_default().to_string(),
            })
            .collect())
    }

    async fn metadata(&mut self, table: &str) -> Result<TableMetadata, DriverError> {
        let statement = Statement::new(
            "SELECT TABLE_NAME, ENGINE, TABLE_ROWS, DATA_LENGTH, TABLE_COLLATION, \
             CAST(CREATE_TIME AS CHAR), CAST(UPDATE_TIME AS CHAR), TABLE_COMMENT \
             FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?",
        )
        .bind(table);
        let outcome = self.execute(&statement).await?;
        let row = outcome
            .rows
            .first()
            .ok_or_else(|| DriverError::new(format!("Table '{table}' doesn't exist")))?;
        Ok(metadata_from_row(row))
    }

    async fn columns(&mut self, table: &str) -> Result<Schema, DriverError> {
        let statement = Statement::new(format!(
            "SHOW FULL COLUMNS FROM {}",
            sql::quote_identifier(table)
        ));
        let outcome = self.execute(&statement).await?;
        Ok(outcome.rows.iter().map(column_from_row).collect())
    }

    fn create_table_query(&self, table: &str) -> String {
        format!(
            "CREATE TABLE {} (`id` INT UNSIGNED NOT NULL AUTO_INCREMENT, PRIMARY KEY (`id`)) \
             ENGINE=InnoDB",
            sql::quote_identifier(table)
        )
    }
}

async fn drain<P: Protocol>(mut result: QueryResult<'_, 'static, P>) -> Result<QueryOutcome, DriverError> {
    let columns = result
        .columns()
        .map(|columns| {
            columns
                .iter()
                .map(|column| column.name_str().into_owned())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let rows: Vec<Row> = result.collect().await.map_err(to_driver_error)?;
    let rows_affected = result.affected_rows();
    let last_insert_id = result.last_insert_id();
    result.drop_result().await.map_err(to_driver_error)?;

    Ok(QueryOutcome {
        columns,
        rows: rows.into_iter().map(row_to_query_row).collect(),
        rows_affected,
        last_insert_id,
    })
}

fn opts_from_params(params: &OpenParams) -> OptsBuilder {
    let mut builder = OptsBuilder::default()
        .ip_or_hostname(params.host.clone())
        .tcp_port(params.port)
        .user(Some(params.user.clone()))
        .prefer_socket(false);

    if !params.password.is_empty() {
        builder = builder.pass(Some(params.password.clone()));
    }
    if !params.database.is_empty() {
        builder = builder.db_name(Some(params.database.clone()));
    }
    builder
}

fn to_mysql_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::NULL,
        SqlValue::Text(text) => Value::Bytes(text.as_bytes().to_vec()),
        SqlValue::Int(value) => Value::Int(*value),
        SqlValue::UInt(value) => Value::UInt(*value),
    }
}

fn row_to_query_row(row: Row) -> QueryRow {
    QueryRow::new(row.unwrap().into_iter().map(mysql_value_to_string).collect())
}

fn mysql_value_to_string(value: Value) -> Option<String> {
    let text = match value {
        Value::NULL => return None,
        Value::Bytes(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Value::Int(value) => value.to_string(),
        Value::UInt(value) => value.to_string(),
        Value::Float(value) => value.to_string(),
        Value::Double(value) => value.to_string(),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            if micros == 0 {
                format!("{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}")
            } else {
                format!(
                    "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micros:06}"
                )
            }
        }
        Value::Time(is_negative, days, hours, minutes, seconds, micros) => {
            let sign = if is_negative { "-" } else { "" };
            let hours = days * 24 + u32::from(hours);
            if micros == 0 {
                format!("{sign}{hours:02}:{minutes:02}:{seconds:02}")
            } else {
                format!("{sign}{hours:02}:{minutes:02}:{seconds:02}.{micros:06}")
            }
        }
    };
    Some(text)
}

fn metadata_from_row(row: &QueryRow) -> TableMetadata {
    let text = |column: usize| row.value(column).map(str::to_string);
    let number = |column: usize| row.value(column).and_then(|value| value.parse().ok());
    TableMetadata {
        name: row.value(0).unwrap_or_default().to_string(),
        engine: text(1),
        row_estimate: number(2),
        data_length: number(3),
        collation: text(4),
        created_at: text(5),
        updated_at: text(6),
        comment: text(7).filter(|comment| !comment.is_empty()),
    }
}

/// Maps one `SHOW FULL COLUMNS` row: Field, Type, Collation, Null, Key,
/// Default, Extra, Privileges, Comment.
fn column_from_row(row: &QueryRow) -> SqlColumn {
    let (data_type, length, is_unsigned) = parse_column_type(row.value(1).unwrap_or_default());
    SqlColumn {
        name: row.value(0).unwrap_or_default().to_string(),
        data_type,
        length,
        is_unsigned,
        collation: row.value(2).map(str::to_string),
        allow_null: row
            .value(3)
            .is_some_and(|nullable| nullable.eq_ignore_ascii_case("YES")),
        key: row.value(4).unwrap_or_default().to_string(),
        default_value: row.value(5).map(str::to_string),
        extra: row.value(6).unwrap_or_default().to_string(),
        comment: row.value(8).unwrap_or_default().to_string(),
    }
}

/// Splits `int(10) unsigned` into `("int", Some("10"), true)`.
fn parse_column_type(declared: &str) -> (String, Option<String>, bool) {
    let declared = declared.trim();
    let is_unsigned = declared
        .split_whitespace()
        .any(|word| word.eq_ignore_ascii_case("unsigned"));
    let base = declared.split_whitespace().next().unwrap_or_default();

    match base.split_once('(') {
        Some((name, rest)) => (
            name.to_string(),
            Some(rest.trim_end_matches(')').to_string()),
            is_unsigned,
        ),
        None => (base.to_string(), None, is_unsigned),
    }
}

fn to_driver_error(error: mysql_async::Error) -> DriverError {
    match error {
        mysql_async::Error::Server(server) => DriverError::new(server.message),
        other => DriverError::new(other.to_string()),
    }
}
