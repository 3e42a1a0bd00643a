//! Loader: staging snapshots and loading them into the warehouse.
//!
//! Artifacts are CSV files under run-date keys with a JSON manifest
//! sidecar. The transformed manifest carries the schema descriptor that is
//! checked against the target table before anything is written.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::retry::{retry_io, RetryPolicy};
use crate::schema::TableSchema;
use crate::staging::{raw_key, transformed_key, BlobStore, StagingHandle};
use crate::types::{
    Dataset, DateRange, EnrichedRow, PriceRow, RawDataset, RunDate, RunWindow, SkippedTicker,
    Ticker,
};
use crate::warehouse::WarehouseSink;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Raw,
    Transformed,
}

/// Sidecar describing a staged artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub kind: ArtifactKind,
    pub run_date: RunDate,
    pub window: RunWindow,
    pub rows: usize,
    pub tickers: usize,
    /// Column descriptor of the CSV body. Present on transformed artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<TableSchema>,
    #[serde(default)]
    pub skipped: Vec<SkippedTicker>,
    pub created_at: DateTime<Utc>,
}

/// Raw extract rows, with the vendor export's column names.
#[derive(Debug, Serialize, Deserialize)]
struct RawCsvRow {
    #[serde(rename = "Datetime")]
    date: NaiveDateTime,
    #[serde(rename = "Symbol")]
    symbol: Ticker,
    #[serde(rename = "Open")]
    open: Option<f64>,
    #[serde(rename = "High")]
    high: Option<f64>,
    #[serde(rename = "Low")]
    low: Option<f64>,
    #[serde(rename = "Close")]
    close: Option<f64>,
    #[serde(rename = "Adj Close")]
    adj_close: Option<f64>,
    #[serde(rename = "Volume")]
    volume: Option<i64>,
}

/// A transformed artifact read back from staging.
#[derive(Clone, Debug, PartialEq)]
pub struct StagedDataset {
    pub handle: StagingHandle,
    pub manifest: Manifest,
    pub dataset: Dataset,
}

/// What a load wrote.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub handle: StagingHandle,
    pub table: String,
    pub partition: DateRange,
    pub rows: usize,
}

pub struct Loader<B: BlobStore, W: WarehouseSink> {
    store: B,
    sink: W,
    prefix: String,
    retry: RetryPolicy,
}

impl<B: BlobStore, W: WarehouseSink> Loader<B, W> {
    pub fn new(store: B, sink: W, prefix: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            store,
            sink,
            prefix: prefix.into(),
            retry,
        }
    }

    pub fn store(&self) -> &B {
        &self.store
    }

    pub fn sink(&self) -> &W {
        &self.sink
    }

    /// Handle the transformed artifact of `run_date` is staged under.
    pub fn transformed_handle(&self, run_date: RunDate) -> StagingHandle {
        StagingHandle::new(transformed_key(&self.prefix, run_date))
    }

    /// Handle the raw extract of `run_date` is staged under.
    pub fn raw_handle(&self, run_date: RunDate) -> StagingHandle {
        StagingHandle::new(raw_key(&self.prefix, run_date))
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<StagingHandle, PipelineError> {
        let store = &self.store;
        retry_io(&self.retry, &format!("stage {}", key), move || async move {
            store.put(key, bytes)
        })
        .await
    }

    async fn get(&self, handle: &StagingHandle) -> Result<Vec<u8>, PipelineError> {
        let store = &self.store;
        retry_io(&self.retry, &format!("read {}", handle), move || async move {
            store.get(handle)
        })
        .await
    }

    async fn write_artifact(
        &self,
        key: &str,
        body: &[u8],
        manifest: &Manifest,
    ) -> Result<StagingHandle, PipelineError> {
        let handle = self.put(key, body).await?;
        let manifest_json = serde_json::to_vec_pretty(manifest)?;
        self.put(handle.manifest().key(), &manifest_json).await?;
        tracing::info!(key, rows = manifest.rows, "artifact staged");
        Ok(handle)
    }

    async fn exists(&self, handle: &StagingHandle) -> Result<bool, PipelineError> {
        let store = &self.store;
        retry_io(&self.retry, &format!("stat {}", handle), move || async move {
            store.exists(handle)
        })
        .await
    }

    async fn read_manifest(
        &self,
        handle: &StagingHandle,
        expected: ArtifactKind,
    ) -> Result<Manifest, PipelineError> {
        if !self.exists(handle).await? {
            return Err(PipelineError::MissingArtifact {
                key: handle.key().to_string(),
            });
        }
        let manifest_handle = handle.manifest();
        let bytes = self.get(&manifest_handle).await?;
        let manifest: Manifest =
            serde_json::from_slice(&bytes).map_err(|e| PipelineError::CorruptArtifact {
                key: manifest_handle.key().to_string(),
                reason: e.to_string(),
            })?;
        if manifest.kind != expected {
            return Err(PipelineError::CorruptArtifact {
                key: handle.key().to_string(),
                reason: format!("expected a {:?} artifact, found {:?}", expected, manifest.kind),
            });
        }
        Ok(manifest)
    }

    /// Stages the raw extract, replacing any earlier snapshot of the run.
    pub async fn stage_raw(&self, raw: &RawDataset) -> Result<StagingHandle, PipelineError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for (ticker, rows) in &raw.series {
            for row in rows {
                writer.serialize(RawCsvRow {
                    date: row.date,
                    symbol: ticker.clone(),
                    open: row.open,
                    high: row.high,
                    low: row.low,
                    close: row.close,
                    adj_close: row.adj_close,
                    volume: row.volume,
                })?;
            }
        }
        let body = into_bytes(writer)?;
        let manifest = Manifest {
            kind: ArtifactKind::Raw,
            run_date: raw.window.run_date,
            window: raw.window,
            rows: raw.row_count(),
            tickers: raw.series.len(),
            schema: None,
            skipped: raw.skipped.clone(),
            created_at: Utc::now(),
        };
        let key = raw_key(&self.prefix, raw.window.run_date);
        self.write_artifact(&key, &body, &manifest).await
    }

    pub async fn read_raw(&self, handle: &StagingHandle) -> Result<RawDataset, PipelineError> {
        let manifest = self.read_manifest(handle, ArtifactKind::Raw).await?;
        let bytes = self.get(handle).await?;
        let corrupt = |e: csv::Error| PipelineError::CorruptArtifact {
            key: handle.key().to_string(),
            reason: e.to_string(),
        };

        let mut series: BTreeMap<Ticker, Vec<PriceRow>> = BTreeMap::new();
        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let mut count = 0usize;
        for record in reader.deserialize::<RawCsvRow>() {
            let row = record.map_err(corrupt)?;
            series.entry(row.symbol).or_default().push(PriceRow {
                date: row.date,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                adj_close: row.adj_close,
                volume: row.volume,
            });
            count += 1;
        }
        check_row_count(handle, &manifest, count)?;

        Ok(RawDataset {
            window: manifest.window,
            series,
            skipped: manifest.skipped,
        })
    }

    /// Stages the transformed dataset with its schema descriptor.
    pub async fn stage_transformed(
        &self,
        dataset: &Dataset,
        skipped: &[SkippedTicker],
    ) -> Result<StagingHandle, PipelineError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in &dataset.rows {
            writer.serialize(row)?;
        }
        if dataset.rows.is_empty() {
            writer.write_record(TableSchema::daily_prices().names())?;
        }
        let body = into_bytes(writer)?;
        let manifest = Manifest {
            kind: ArtifactKind::Transformed,
            run_date: dataset.window.run_date,
            window: dataset.window,
            rows: dataset.len(),
            tickers: dataset.ticker_count(),
            schema: Some(TableSchema::daily_prices()),
            skipped: skipped.to_vec(),
            created_at: Utc::now(),
        };
        let key = transformed_key(&self.prefix, dataset.window.run_date);
        self.write_artifact(&key, &body, &manifest).await
    }

    /// Reads a transformed artifact and checks its CSV header against the
    /// manifest's descriptor.
    pub async fn read_transformed(
        &self,
        handle: &StagingHandle,
    ) -> Result<StagedDataset, PipelineError> {
        let manifest = self.read_manifest(handle, ArtifactKind::Transformed).await?;
        let schema = manifest
            .schema
            .clone()
            .ok_or_else(|| PipelineError::CorruptArtifact {
                key: handle.manifest().key().to_string(),
                reason: "manifest has no schema descriptor".to_string(),
            })?;
        let bytes = self.get(handle).await?;
        let corrupt = |e: csv::Error| PipelineError::CorruptArtifact {
            key: handle.key().to_string(),
            reason: e.to_string(),
        };

        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let header = reader.headers().map_err(corrupt)?.clone();
        let header: Vec<&str> = header.iter().collect();
        schema.check_header(handle.key(), &header)?;

        let rows = reader
            .deserialize::<EnrichedRow>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(corrupt)?;
        check_row_count(handle, &manifest, rows.len())?;

        Ok(StagedDataset {
            handle: handle.clone(),
            dataset: Dataset {
                window: manifest.window,
                rows,
            },
            manifest,
        })
    }

    /// Loads a staged dataset into `table`, replacing the run's reporting
    /// window. The schema is checked before any write; a mismatch leaves
    /// the table untouched.
    pub async fn load(
        &self,
        handle: &StagingHandle,
        table: &str,
    ) -> Result<LoadSummary, PipelineError> {
        let staged = self.read_transformed(handle).await?;
        let rows = staged.dataset.len();
        let fail = |source: PipelineError| match source {
            PipelineError::TransientIo { .. } | PipelineError::Warehouse(_) => {
                PipelineError::LoadFailed {
                    handle: handle.clone(),
                    table: table.to_string(),
                    rows,
                    source: Box::new(source),
                }
            }
            other => other,
        };

        let sink = &self.sink;
        let declared = retry_io(&self.retry, &format!("describe {}", table), move || async move {
            sink.table_schema(table)
        })
        .await
        .map_err(fail)?;

        let descriptor = staged
            .manifest
            .schema
            .as_ref()
            .ok_or_else(|| PipelineError::CorruptArtifact {
                key: handle.manifest().key().to_string(),
                reason: "manifest has no schema descriptor".to_string(),
            })?;
        descriptor.check_against(table, &declared)?;

        let partition = staged.dataset.window.reporting;
        let target = &partition;
        let batch = staged.dataset.rows.as_slice();
        let inserted = retry_io(
            &self.retry,
            &format!("load {} into {}", handle, table),
            move || async move { sink.replace_partition(table, target, batch) },
        )
        .await
        .map_err(fail)?;

        tracing::info!(%handle, table, %partition, rows = inserted, "load finished");
        Ok(LoadSummary {
            handle: handle.clone(),
            table: table.to_string(),
            partition,
            rows: inserted,
        })
    }
}

fn into_bytes(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, PipelineError> {
    writer
        .into_inner()
        .map_err(|e| PipelineError::Csv(csv::Error::from(e.into_error())))
}

fn check_row_count(
    handle: &StagingHandle,
    manifest: &Manifest,
    found: usize,
) -> Result<(), PipelineError> {
    if manifest.rows != found {
        return Err(PipelineError::CorruptArtifact {
            key: handle.key().to_string(),
            reason: format!("manifest lists {} rows, artifact has {}", manifest.rows, found),
        });
    }
    Ok(())
}
