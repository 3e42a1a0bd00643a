//! Explicit column descriptors for the warehouse table.
//!
//! The target table uses quoted, case-sensitive identifiers, so column
//! names are compared byte-for-byte. A dataset is only loaded when its
//! descriptor lines up with the table's declared schema position by
//! position.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Warehouse column types the pipeline produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    Timestamp,
    String,
    Float,
    BigInt,
}

impl ColumnType {
    /// Maps a declared SQL type to a column type. Unknown declarations
    /// return `None` and are reported as type mismatches.
    pub fn from_declared(declared: &str) -> Option<Self> {
        match declared.trim().to_ascii_uppercase().as_str() {
            "TIMESTAMP" | "TIMESTAMP_NTZ" | "DATETIME" => Some(Self::Timestamp),
            "STRING" | "TEXT" | "VARCHAR" => Some(Self::String),
            "FLOAT" | "DOUBLE" | "REAL" => Some(Self::Float),
            "BIGINT" | "INTEGER" => Some(Self::BigInt),
            _ => None,
        }
    }

    /// The SQL type name used in DDL.
    pub fn sql_name(&self) -> &'static str {
        match self {
            Self::Timestamp => "TIMESTAMP",
            Self::String => "STRING",
            Self::Float => "FLOAT",
            Self::BigInt => "BIGINT",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: &str, ty: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            ty,
            nullable,
        }
    }
}

/// Ordered column list of a table or dataset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// The daily price table: `"DATE" TIMESTAMP, "SYMBOL" STRING,
    /// "OPEN".."ADJ_CLOSE" FLOAT, "VOLUME" BIGINT, "close_change" FLOAT,
    /// "close_pct_change" FLOAT`.
    pub fn daily_prices() -> Self {
        Self::new(vec![
            Column::new("DATE", ColumnType::Timestamp, false),
            Column::new("SYMBOL", ColumnType::String, false),
            Column::new("OPEN", ColumnType::Float, false),
            Column::new("HIGH", ColumnType::Float, false),
            Column::new("LOW", ColumnType::Float, false),
            Column::new("CLOSE", ColumnType::Float, false),
            Column::new("ADJ_CLOSE", ColumnType::Float, false),
            Column::new("VOLUME", ColumnType::BigInt, false),
            Column::new("close_change", ColumnType::Float, true),
            Column::new("close_pct_change", ColumnType::Float, true),
        ])
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Checks that rows described by `self` can be inserted into a table
    /// declared as `table`: same names (exact case), same order, same
    /// types, and no nullable column feeding a NOT NULL one.
    pub fn check_against(&self, table_name: &str, table: &TableSchema) -> Result<(), SchemaMismatch> {
        let mut problems = Vec::new();
        let len = self.columns.len().max(table.columns.len());
        for position in 0..len {
            match (self.columns.get(position), table.columns.get(position)) {
                (Some(ours), Some(theirs)) => {
                    if ours.name != theirs.name {
                        problems.push(ColumnProblem::NameDiffers {
                            position,
                            expected: theirs.name.clone(),
                            found: ours.name.clone(),
                        });
                        continue;
                    }
                    if ours.ty != theirs.ty {
                        problems.push(ColumnProblem::TypeDiffers {
                            name: ours.name.clone(),
                            expected: theirs.ty.to_string(),
                            found: ours.ty.to_string(),
                        });
                    }
                    if ours.nullable && !theirs.nullable {
                        problems.push(ColumnProblem::NullableIntoNotNull {
                            name: ours.name.clone(),
                        });
                    }
                }
                (Some(ours), None) => problems.push(ColumnProblem::Unexpected {
                    name: ours.name.clone(),
                }),
                (None, Some(theirs)) => problems.push(ColumnProblem::Missing {
                    name: theirs.name.clone(),
                }),
                (None, None) => {}
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(SchemaMismatch {
                table: table_name.to_string(),
                problems,
            })
        }
    }

    /// Checks a staged CSV header against this descriptor's names.
    pub fn check_header(&self, artifact: &str, header: &[&str]) -> Result<(), SchemaMismatch> {
        let header_schema = TableSchema::new(
            header
                .iter()
                .zip(self.columns.iter().map(Some).chain(std::iter::repeat(None)))
                .map(|(name, described)| {
                    let (ty, nullable) = described
                        .map(|c| (c.ty, c.nullable))
                        .unwrap_or((ColumnType::String, true));
                    Column::new(name, ty, nullable)
                })
                .collect(),
        );
        header_schema.check_against(artifact, self)
    }
}

/// One way a dataset column disagrees with the table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnProblem {
    NameDiffers {
        position: usize,
        expected: String,
        found: String,
    },
    TypeDiffers {
        name: String,
        expected: String,
        found: String,
    },
    NullableIntoNotNull {
        name: String,
    },
    Missing {
        name: String,
    },
    Unexpected {
        name: String,
    },
}

impl fmt::Display for ColumnProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NameDiffers {
                position,
                expected,
                found,
            } => {
                if expected.eq_ignore_ascii_case(found) {
                    write!(
                        f,
                        "column {} is \"{}\" but table declares \"{}\" (case differs)",
                        position, found, expected
                    )
                } else {
                    write!(
                        f,
                        "column {} is \"{}\" but table declares \"{}\"",
                        position, found, expected
                    )
                }
            }
            Self::TypeDiffers {
                name,
                expected,
                found,
            } => write!(f, "\"{}\" has type {} but table declares {}", name, found, expected),
            Self::NullableIntoNotNull { name } => {
                write!(f, "\"{}\" is nullable but table declares NOT NULL", name)
            }
            Self::Missing { name } => write!(f, "missing column \"{}\"", name),
            Self::Unexpected { name } => write!(f, "unexpected column \"{}\"", name),
        }
    }
}

/// The dataset and target table disagree on their columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaMismatch {
    pub table: String,
    pub problems: Vec<ColumnProblem>,
}

impl fmt::Display for SchemaMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "schema mismatch for {}: ", self.table)?;
        for (i, problem) in self.problems.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", problem)?;
        }
        Ok(())
    }
}

impl std::error::Error for SchemaMismatch {}
