//! The `init-warehouse` subcommand.

use anyhow::{Context, Result};
use sp500etl_lib::{PipelineConfig, SqliteWarehouse, TableSchema};

/// Creates `table` with the daily price schema unless it already exists.
pub fn ensure_table(warehouse: &SqliteWarehouse, table: &str) -> Result<()> {
    warehouse
        .init_table(table, &TableSchema::daily_prices())
        .with_context(|| format!("failed to initialize table {}", table))
}

pub fn run(config: &PipelineConfig) -> Result<()> {
    let path = &config.warehouse.path;
    let warehouse = SqliteWarehouse::open(path)
        .with_context(|| format!("cannot open warehouse {}", path.display()))?;
    ensure_table(&warehouse, &config.warehouse.table)?;
    eprintln!(
        "Table {} ready in {}",
        config.warehouse.table,
        path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sp500etl_lib::WarehouseSink;

    #[test]
    fn test_ensure_table_is_repeatable() {
        let warehouse = SqliteWarehouse::open_in_memory().unwrap();
        ensure_table(&warehouse, "SP500_DATA").unwrap();
        ensure_table(&warehouse, "SP500_DATA").unwrap();
        let schema = warehouse.table_schema("SP500_DATA").unwrap();
        assert_eq!(schema, TableSchema::daily_prices());
    }

    #[test]
    fn test_ensure_table_rejects_bad_name() {
        let warehouse = SqliteWarehouse::open_in_memory().unwrap();
        assert!(ensure_table(&warehouse, "SP500 DATA; DROP").is_err());
    }
}
