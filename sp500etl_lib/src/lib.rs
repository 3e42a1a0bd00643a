//! Library layer for the S&P 500 daily price pipeline.
//!
//! Universe resolution, extraction from the chart API, per-ticker lag
//! metrics, blob staging, and schema-checked warehouse loads. Each stage
//! hands the next one a [`StagingHandle`], never the data itself.

pub mod config;
pub mod error;
pub mod extract;
pub mod load;
pub mod pipeline;
pub mod retry;
pub mod schema;
pub mod staging;
pub mod transform;
pub mod types;
pub mod universe;
pub mod warehouse;

pub use marketdata_api;

pub use config::PipelineConfig;
pub use error::{PipelineError, RowDefect, RowValidationError, SymbolFetchError};
pub use extract::{ExtractOptions, ExtractProgress, Extractor, PriceSource, YahooSource};
pub use load::{LoadSummary, Loader, Manifest};
pub use pipeline::{DefaultPipeline, Pipeline, RunReport, RunStatus};
pub use retry::RetryPolicy;
pub use schema::{ColumnType, SchemaMismatch, TableSchema};
pub use staging::{BlobStore, FsBlobStore, MemoryBlobStore, StagingHandle};
pub use types::{Dataset, EnrichedRow, PriceRow, RawDataset, RunDate, RunWindow, Ticker};
pub use universe::{UniverseResolver, UniverseSource};
pub use warehouse::{SqliteWarehouse, WarehouseError, WarehouseSink};
