//! In-memory driver used by the unit tests. It understands exactly the
//! statement shapes produced by [`crate::sql`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::driver::{
    ColumnDescriptor, Driver, DriverError, OpenParams, QueryOutcome, QueryRow, Schema, SqlColumn,
    SqlValue, Statement, TableMetadata,
};

pub(crate) type SharedDb = Arc<Mutex<MemoryDb>>;

#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryTable {
    pub columns: Vec<(String, String)>,
    pub primary_key: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl MemoryTable {
    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|(column, _)| column == name)
    }
}

#[derive(Debug, Default)]
pub(crate) struct MemoryDb {
    pub schemas: Vec<(String, BTreeMap<String, MemoryTable>)>,
    pub current: String,
    pub fail_open: Option<String>,
    /// Any statement containing this text fails.
    pub fail_matching: Option<String>,
    pub executed: Vec<Statement>,
    pub opened: Vec<OpenParams>,
    pub closed: usize,
}

impl MemoryDb {
    /// `shop` holds `orders` (five rows keyed by `id`) and `tags` (no key);
    /// `audit` holds `entries`.
    pub fn shop() -> SharedDb {
        let orders = MemoryTable {
            columns: vec![
                ("id".to_string(), "int(11)".to_string()),
                ("status".to_string(), "varchar(16)".to_string()),
                ("total".to_string(), "decimal(10,2)".to_string()),
            ],
            primary_key: vec!["id".to_string()],
            rows: [
                ("1", "open", "10.00"),
                ("2", "paid", "25.50"),
                ("3", "open", "7.25"),
                ("4", "shipped", "99.00"),
                ("5", "open", "3.10"),
            ]
            .into_iter()
            .map(|(id, status, total)| {
                vec![
                    Some(id.to_string()),
                    Some(status.to_string()),
                    Some(total.to_string()),
                ]
            })
            .collect(),
        };
        let tags = MemoryTable {
            columns: vec![("label".to_string(), "varchar(32)".to_string())],
            primary_key: Vec::new(),
            rows: vec![vec![Some("rush".to_string())], vec![None]],
        };
        let entries = MemoryTable {
            columns: vec![("id".to_string(), "int(11)".to_string())],
            primary_key: vec!["id".to_string()],
            rows: Vec::new(),
        };

        let shop = BTreeMap::from([("orders".to_string(), orders), ("tags".to_string(), tags)]);
        let audit = BTreeMap::from([("entries".to_string(), entries)]);
        Arc::new(Mutex::new(Self {
            schemas: vec![("shop".to_string(), shop), ("audit".to_string(), audit)],
            ..Self::default()
        }))
    }

    pub fn table(&self, name: &str) -> Option<&MemoryTable> {
        self.current_schema().and_then(|tables| tables.get(name))
    }

    fn current_schema(&self) -> Option<&BTreeMap<String, MemoryTable>> {
        self.schemas
            .iter()
            .find(|(name, _)| *name == self.current)
            .map(|(_, tables)| tables)
    }

    fn current_schema_mut(&mut self) -> Option<&mut BTreeMap<String, MemoryTable>> {
        let current = self.current.clone();
        self.schemas
            .iter_mut()
            .find(|(name, _)| *name == current)
            .map(|(_, tables)| tables)
    }

    fn missing(&self, table: &str) -> DriverError {
        DriverError::new(format!("Table '{}.{table}' doesn't exist", self.current))
    }

    fn execute(&mut self, statement: &Statement) -> Result<QueryOutcome, DriverError> {
        self.executed.push(statement.clone());
        if let Some(pattern) = &self.fail_matching {
            if statement.sql.contains(pattern.as_str()) {
                return Err(DriverError::new(format!("statement rejected: {pattern}")));
            }
        }

        let sql = statement.sql.as_str();
        let names = identifiers(sql);
        let params: Vec<Option<String>> = statement.params.iter().map(param_text).collect();
        let first = names.first().cloned().unwrap_or_default();

        if sql.starts_with("USE ") {
            if !self.schemas.iter().any(|(name, _)| *name == first) {
                return Err(DriverError::new(format!("Unknown database '{first}'")));
            }
            self.current = first;
            return Ok(QueryOutcome::default());
        }
        if sql.starts_with("SHOW CREATE TABLE ") {
            let table = self.table(&first).ok_or_else(|| self.missing(&first))?;
            let body = table
                .columns
                .iter()
                .map(|(name, kind)| format!("`{name}` {kind}"))
                .collect::<Vec<_>>()
                .join(", ");
            return Ok(select(
                &["Table", "Create Table"],
                vec![vec![Some(first.clone()), Some(format!("CREATE TABLE `{first}` ({body})"))]],
            ));
        }
        if sql.starts_with("SHOW KEYS FROM ") {
            let table = self.table(&first).ok_or_else(|| self.missing(&first))?;
            let rows = table
                .primary_key
                .iter()
                .enumerate()
                .map(|(seq, key)| {
                    vec![
                        Some(first.clone()),
                        Some("0".to_string()),
                        Some("PRIMARY".to_string()),
                        Some((seq + 1).to_string()),
                        Some(key.clone()),
                    ]
                })
                .collect();
            return Ok(select(
                &["Table", "Non_unique", "Key_name", "Seq_in_index", "Column_name"],
                rows,
            ));
        }
        if sql.starts_with("SHOW COLUMNS FROM ") {
            let table = self.table(&first).ok_or_else(|| self.missing(&first))?;
            let rows = table
                .columns
                .iter()
                .map(|(name, kind)| {
                    let key = if table.primary_key.contains(name) { "PRI" } else { "" };
                    vec![
                        Some(name.clone()),
                        Some(kind.clone()),
                        Some("YES".to_string()),
                        Some(key.to_string()),
                        None,
                        Some(String::new()),
                    ]
                })
                .collect();
            return Ok(select(&["Field", "Type", "Null", "Key", "Default", "Extra"], rows));
        }
        if sql.starts_with("SELECT count(*) FROM ") {
            let table = self.table(&first).ok_or_else(|| self.missing(&first))?;
            return Ok(select(
                &["count(*)"],
                vec![vec![Some(table.rows.len().to_string())]],
            ));
        }
        if sql.starts_with("SELECT * FROM ") {
            let table = self.table(&first).ok_or_else(|| self.missing(&first))?;
            let (filter, window) = if names.len() > 1 {
                let column = table
                    .column_index(&names[1])
                    .ok_or_else(|| DriverError::new(format!("Unknown column '{}'", names[1])))?;
                (Some((column, params[0].clone())), &params[1..])
            } else {
                (None, &params[..])
            };
            let offset = parse_count(window.first());
            let limit = parse_count(window.get(1));
            let rows = table
                .rows
                .iter()
                .filter(|row| match &filter {
                    Some((column, value)) => row[*column] == *value,
                    None => true,
                })
                .skip(offset)
                .take(limit)
                .cloned()
                .collect();
            let columns: Vec<&str> = table.columns.iter().map(|(name, _)| name.as_str()).collect();
            return Ok(select(&columns, rows));
        }
        if sql.starts_with("INSERT INTO ") {
            let current = self.current.clone();
            let table = self
                .current_schema_mut()
                .and_then(|tables| tables.get_mut(&first))
                .ok_or_else(|| DriverError::new(format!("Table '{current}.{first}' doesn't exist")))?;
            let column = table
                .column_index(&names[1])
                .ok_or_else(|| DriverError::new(format!("Unknown column '{}'", names[1])))?;
            if table.rows.iter().any(|row| row[column] == params[0]) {
                return Err(DriverError::new(format!(
                    "Duplicate entry '{}' for key 'PRIMARY'",
                    params[0].clone().unwrap_or_default()
                )));
            }
            let mut row = vec![None; table.columns.len()];
            row[column].clone_from(&params[0]);
            table.rows.push(row);
            return Ok(write(1));
        }
        if sql.starts_with("UPDATE ") {
            let current = self.current.clone();
            let table = self
                .current_schema_mut()
                .and_then(|tables| tables.get_mut(&first))
                .ok_or_else(|| DriverError::new(format!("Table '{current}.{first}' doesn't exist")))?;
            let column = table
                .column_index(&names[1])
                .ok_or_else(|| DriverError::new(format!("Unknown column '{}'", names[1])))?;
            let key = table
                .column_index(&names[2])
                .ok_or_else(|| DriverError::new(format!("Unknown column '{}'", names[2])))?;
            let mut affected = 0;
            for row in table.rows.iter_mut().filter(|row| row[key] == params[1]) {
                row[column].clone_from(&params[0]);
                affected += 1;
            }
            return Ok(write(affected));
        }
        if sql.starts_with("DELETE FROM ") {
            let current = self.current.clone();
            let table = self
                .current_schema_mut()
                .and_then(|tables| tables.get_mut(&first))
                .ok_or_else(|| DriverError::new(format!("Table '{current}.{first}' doesn't exist")))?;
            let key = table
                .column_index(&names[1])
                .ok_or_else(|| DriverError::new(format!("Unknown column '{}'", names[1])))?;
            let before = table.rows.len();
            table.rows.retain(|row| !params.contains(&row[key]));
            return Ok(write((before - table.rows.len()) as u64));
        }
        if sql.starts_with("CREATE TABLE ") {
            let tables = self
                .current_schema_mut()
                .ok_or_else(|| DriverError::new("No database selected"))?;
            tables.insert(
                first,
                MemoryTable {
                    columns: vec![("id".to_string(), "int(11)".to_string())],
                    primary_key: vec!["id".to_string()],
                    rows: Vec::new(),
                },
            );
            return Ok(write(0));
        }
        if sql.starts_with("DROP TABLE ") {
            let current = self.current.clone();
            self.current_schema_mut()
                .and_then(|tables| tables.remove(&first))
                .ok_or_else(|| DriverError::new(format!("Unknown table '{current}.{first}'")))?;
            return Ok(write(0));
        }

        Err(DriverError::new(format!(
            "You have an error in your SQL syntax near '{sql}'"
        )))
    }
}

fn identifiers(sql: &str) -> Vec<String> {
    sql.split('`')
        .skip(1)
        .step_by(2)
        .map(str::to_string)
        .collect()
}

fn param_text(value: &SqlValue) -> Option<String> {
    match value {
        SqlValue::Null => None,
        SqlValue::Text(text) => Some(text.clone()),
        SqlValue::Int(value) => Some(value.to_string()),
        SqlValue::UInt(value) => Some(value.to_string()),
    }
}

fn parse_count(value: Option<&Option<String>>) -> usize {
    value
        .and_then(Option::as_deref)
        .and_then(|text| text.parse().ok())
        .unwrap_or(0)
}

fn select(columns: &[&str], rows: Vec<Vec<Option<String>>>) -> QueryOutcome {
    QueryOutcome {
        columns: columns.iter().map(|column| (*column).to_string()).collect(),
        rows: rows.into_iter().map(QueryRow::new).collect(),
        ..QueryOutcome::default()
    }
}

fn write(rows_affected: u64) -> QueryOutcome {
    QueryOutcome {
        rows_affected,
        ..QueryOutcome::default()
    }
}

pub(crate) struct MemoryDriver {
    db: SharedDb,
}

impl MemoryDriver {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn open(&mut self, params: &OpenParams) -> Result<(), DriverError> {
        let mut db = self.db.lock();
        db.opened.push(params.clone());
        if let Some(message) = db.fail_open.clone() {
            return Err(DriverError::new(message));
        }
        db.current.clone_from(&params.database);
        Ok(())
    }

    async fn close(&mut self) {
        self.db.lock().closed += 1;
    }

    async fn execute(&mut self, statement: &Statement) -> Result<QueryOutcome, DriverError> {
        self.db.lock().execute(statement)
    }

    async fn databases(&mut self) -> Result<Vec<String>, DriverError> {
        Ok(self.db.lock().schemas.iter().map(|(name, _)| name.clone()).collect())
    }

    async fn table_names(&mut self) -> Result<Vec<String>, DriverError> {
        Ok(self
            .db
            .lock()
            .current_schema()
            .map(|tables| tables.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn record(&mut self, table: &str) -> Result<Vec<ColumnDescriptor>, DriverError> {
        let db = self.db.lock();
        let found = db.table(table).ok_or_else(|| db.missing(table))?;
        Ok(found
            .columns
            .iter()
            .map(|(name, kind)| ColumnDescriptor {
                name: name.clone(),
                declared_type: kind.clone(),
            })
            .collect())
    }

    async fn metadata(&mut self, table: &str) -> Result<TableMetadata, DriverError> {
        let db = self.db.lock();
        let found = db.table(table).ok_or_else(|| db.missing(table))?;
        Ok(TableMetadata {
            name: table.to_string(),
            engine: Some("InnoDB".to_string()),
            row_estimate: Some(found.rows.len() as u64),
            ..TableMetadata::default()
        })
    }

    async fn columns(&mut self, table: &str) -> Result<Schema, DriverError> {
        let db = self.db.lock();
        let found = db.table(table).ok_or_else(|| db.missing(table))?;
        Ok(found
            .columns
            .iter()
            .map(|(name, kind)| SqlColumn {
                name: name.clone(),
                data_type: kind.clone(),
                allow_null: true,
                key: if found.primary_key.contains(name) {
                    "PRI".to_string()
                } else {
                    String::new()
                },
                ..SqlColumn::default()
            })
            .collect())
    }

    fn create_table_query(&self, table: &str) -> String {
        format!("CREATE TABLE `{table}` (`id` int(11) NOT NULL AUTO_INCREMENT, PRIMARY KEY (`id`))")
    }
}
