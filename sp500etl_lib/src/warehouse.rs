//! Warehouse sink: a schema-typed table that accepts partition replaces.

use std::cell::OnceCell;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use crate::retry::Transient;
use crate::schema::{Column, ColumnType, TableSchema};
use crate::types::{DateRange, EnrichedRow};

/// Text encoding of `TIMESTAMP` values. Sorts lexically in time order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(thiserror::Error, Debug)]
pub enum WarehouseError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot create warehouse directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("table {0} does not exist")]
    TableNotFound(String),
    #[error("invalid table name '{0}'")]
    InvalidTableName(String),
    #[error("column \"{column}\" of {table} has unsupported type '{declared}'")]
    UnsupportedType {
        table: String,
        column: String,
        declared: String,
    },
}

impl Transient for WarehouseError {
    fn is_transient(&self) -> bool {
        match self {
            WarehouseError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::SystemIoFailure
            ),
            _ => false,
        }
    }
}

/// A bulk-insert sink with declared, case-sensitive column names.
pub trait WarehouseSink {
    /// Declared columns of `table`, in order.
    fn table_schema(&self, table: &str) -> Result<TableSchema, WarehouseError>;

    /// Deletes every row whose `DATE` falls in `partition` and inserts
    /// `rows`, atomically. Returns the number of rows inserted.
    fn replace_partition(
        &self,
        table: &str,
        partition: &DateRange,
        rows: &[EnrichedRow],
    ) -> Result<usize, WarehouseError>;

    /// Rows in `table`, optionally restricted to one date partition.
    fn row_count(&self, table: &str, partition: Option<&DateRange>) -> Result<usize, WarehouseError>;
}

/// Table identifiers are plain ASCII words; they are still quoted in SQL.
pub fn validate_table_name(name: &str) -> Result<(), WarehouseError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                && name.len() <= 128
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(WarehouseError::InvalidTableName(name.to_string()))
    }
}

fn connect(path: &Path) -> Result<Connection, WarehouseError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| WarehouseError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    tracing::debug!(path = %path.display(), "warehouse opened");
    Ok(conn)
}

/// Double-quotes an identifier so its case is preserved.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `CREATE TABLE` statement for `schema`, every identifier quoted.
pub fn create_table_sql(table: &str, schema: &TableSchema) -> String {
    let columns: Vec<String> = schema
        .columns
        .iter()
        .map(|c| {
            let not_null = if c.nullable { "" } else { " NOT NULL" };
            format!("{} {}{}", quote_ident(&c.name), c.ty.sql_name(), not_null)
        })
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(table),
        columns.join(", ")
    )
}

/// SQLite-backed warehouse. SQLite keeps declared column types verbatim,
/// which is what the load-time schema check compares against.
///
/// A warehouse built with [`SqliteWarehouse::open_lazy`] connects on first
/// use; until then the database file and its directory are left alone.
pub struct SqliteWarehouse {
    path: Option<PathBuf>,
    conn: OnceCell<Connection>,
}

impl SqliteWarehouse {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WarehouseError> {
        let warehouse = Self::open_lazy(path);
        warehouse.connection()?;
        Ok(warehouse)
    }

    /// Defers creating the directory and opening `path` until the first
    /// statement runs.
    pub fn open_lazy(path: impl AsRef<Path>) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            conn: OnceCell::new(),
        }
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, WarehouseError> {
        let conn = OnceCell::new();
        let _ = conn.set(Connection::open_in_memory()?);
        Ok(Self { path: None, conn })
    }

    pub fn is_connected(&self) -> bool {
        self.conn.get().is_some()
    }

    #[doc(hidden)]
    pub fn conn(&self) -> Result<&Connection, WarehouseError> {
        self.connection()
    }

    fn connection(&self) -> Result<&Connection, WarehouseError> {
        if let Some(conn) = self.conn.get() {
            return Ok(conn);
        }
        let conn = match &self.path {
            Some(path) => connect(path)?,
            None => Connection::open_in_memory()?,
        };
        Ok(self.conn.get_or_init(|| conn))
    }

    /// Creates `table` with `schema` unless it already exists, plus an index
    /// on `DATE` for partition deletes.
    pub fn init_table(&self, table: &str, schema: &TableSchema) -> Result<(), WarehouseError> {
        validate_table_name(table)?;
        let tx = self.connection()?.unchecked_transaction()?;
        tx.execute_batch(&create_table_sql(table, schema))?;
        if schema.columns.iter().any(|c| c.name == "DATE") {
            tx.execute_batch(&format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} (\"DATE\")",
                quote_ident(&format!("idx_{}_date", table)),
                quote_ident(table)
            ))?;
        }
        tx.commit()?;
        tracing::info!(table, "warehouse table ready");
        Ok(())
    }

    fn table_exists(&self, table: &str) -> Result<bool, WarehouseError> {
        let found: Option<String> = self
            .connection()?
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn require_table(&self, table: &str) -> Result<(), WarehouseError> {
        validate_table_name(table)?;
        if !self.table_exists(table)? {
            return Err(WarehouseError::TableNotFound(table.to_string()));
        }
        Ok(())
    }
}

impl WarehouseSink for SqliteWarehouse {
    fn table_schema(&self, table: &str) -> Result<TableSchema, WarehouseError> {
        self.require_table(table)?;
        let sql = format!("PRAGMA table_info({})", quote_ident(table));
        let mut stmt = self.connection()?.prepare(&sql)?;
        let declared = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut columns = Vec::with_capacity(declared.len());
        for (name, ty, not_null) in declared {
            let column_type =
                ColumnType::from_declared(&ty).ok_or_else(|| WarehouseError::UnsupportedType {
                    table: table.to_string(),
                    column: name.clone(),
                    declared: ty.clone(),
                })?;
            columns.push(Column::new(&name, column_type, not_null == 0));
        }
        Ok(TableSchema::new(columns))
    }

    fn replace_partition(
        &self,
        table: &str,
        partition: &DateRange,
        rows: &[EnrichedRow],
    ) -> Result<usize, WarehouseError> {
        self.require_table(table)?;
        let (lower, upper) = partition.timestamp_bounds();
        let names: Vec<String> = TableSchema::daily_prices()
            .names()
            .into_iter()
            .map(quote_ident)
            .collect();
        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();

        let tx = self.connection()?.unchecked_transaction()?;
        let deleted = tx.execute(
            &format!(
                "DELETE FROM {} WHERE \"DATE\" >= ?1 AND \"DATE\" < ?2",
                quote_ident(table)
            ),
            params![
                lower.format(TIMESTAMP_FORMAT).to_string(),
                upper.format(TIMESTAMP_FORMAT).to_string()
            ],
        )?;

        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(table),
                names.join(", "),
                placeholders.join(", ")
            ))?;
            for row in rows {
                inserted += stmt.execute(params![
                    row.date.format(TIMESTAMP_FORMAT).to_string(),
                    row.symbol.as_str(),
                    row.open,
                    row.high,
                    row.low,
                    row.close,
                    row.adj_close,
                    row.volume,
                    row.close_change,
                    row.close_pct_change,
                ])?;
            }
        }

        tx.commit()?;
        tracing::debug!(table, %partition, deleted, inserted, "partition replaced");
        Ok(inserted)
    }

    fn row_count(&self, table: &str, partition: Option<&DateRange>) -> Result<usize, WarehouseError> {
        self.require_table(table)?;
        let count: i64 = match partition {
            Some(range) => {
                let (lower, upper) = range.timestamp_bounds();
                self.connection()?.query_row(
                    &format!(
                        "SELECT COUNT(*) FROM {} WHERE \"DATE\" >= ?1 AND \"DATE\" < ?2",
                        quote_ident(table)
                    ),
                    params![
                        lower.format(TIMESTAMP_FORMAT).to_string(),
                        upper.format(TIMESTAMP_FORMAT).to_string()
                    ],
                    |row| row.get(0),
                )?
            }
            None => self.connection()?.query_row(
                &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
                [],
                |row| row.get(0),
            )?,
        };
        Ok(count as usize)
    }
}
