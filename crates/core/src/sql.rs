use crate::driver::{SqlValue, Statement};

#[must_use]
pub fn quote_identifier(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

#[must_use]
pub fn use_database_sql(database: &str) -> String {
    format!("USE {}", quote_identifier(database))
}

#[must_use]
pub fn show_create_table_sql(table: &str) -> String {
    format!("SHOW CREATE TABLE {}", quote_identifier(table))
}

#[must_use]
pub fn drop_table_sql(table: &str) -> String {
    format!("DROP TABLE {}", quote_identifier(table))
}

/// Column 4 (`Column_name`) of each result row names a key part.
#[must_use]
pub fn primary_key_sql(table: &str) -> String {
    format!(
        "SHOW KEYS FROM {} WHERE Key_name = 'PRIMARY'",
        quote_identifier(table)
    )
}

#[must_use]
pub fn show_columns_sql(table: &str) -> String {
    format!("SHOW COLUMNS FROM {}", quote_identifier(table))
}

#[must_use]
pub fn count_rows_sql(table: &str) -> String {
    format!("SELECT count(*) FROM {}", quote_identifier(table))
}

/// `filter` is an equality `(column, value)` pair.
#[must_use]
pub fn page_select(table: &str, filter: Option<(&str, &str)>, offset: u64, limit: u64) -> Statement {
    let mut sql = format!("SELECT * FROM {}", quote_identifier(table));
    let mut params = Vec::with_capacity(3);
    if let Some((column, value)) = filter {
        sql.push_str(&format!(" WHERE {} = ?", quote_identifier(column)));
        params.push(SqlValue::from(value));
    }
    sql.push_str(" LIMIT ?, ?");
    params.push(SqlValue::UInt(offset));
    params.push(SqlValue::UInt(limit));
    Statement { sql, params }
}

#[must_use]
pub fn insert_key(table: &str, key_column: &str, value: &str) -> Statement {
    Statement::new(format!(
        "INSERT INTO {} ({}) VALUES (?)",
        quote_identifier(table),
        quote_identifier(key_column)
    ))
    .bind(value)
}

#[must_use]
pub fn update_cell(
    table: &str,
    column: &str,
    value: &str,
    key_column: &str,
    key_value: &str,
) -> Statement {
    Statement::new(format!(
        "UPDATE {} SET {} = ? WHERE {} = ?",
        quote_identifier(table),
        quote_identifier(column),
        quote_identifier(key_column)
    ))
    .bind(value)
    .bind(key_value)
}

#[must_use]
pub fn delete_keys(table: &str, key_column: &str, keys: &[String]) -> Statement {
    let placeholders = vec!["?"; keys.len()].join(", ");
    Statement {
        sql: format!(
            "DELETE FROM {} WHERE {} IN ({placeholders})",
            quote_identifier(table),
            quote_identifier(key_column)
        ),
        params: keys.iter().map(|key| SqlValue::from(key.as_str())).collect(),
    }
}
