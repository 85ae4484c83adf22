//! The external collaborators this crate treats as out of scope: the
//! remote object-store SQL service (`RemoteScanClient`) and the
//! compute-offload execution environment `DummyTop` delegates to
//! (`ComputeOffloadClient`). Both are trait boundaries; this crate ships
//! one in-process implementation of each so the operators in
//! `sql_table_scan`/`topk_table_scan`/`dummy_top` can be exercised
//! without a real S3/Lambda dependency.

use async_trait::async_trait;
use datafusion::arrow::array::Array;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::arrow::util::display::{ArrayFormatter, FormatOptions};
use datafusion::execution::context::SessionContext;
use datafusion::prelude::CsvReadOptions;
use scanflow_core::error::EngineError;
use scanflow_core::message::RowTuple;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The format descriptor a scan is issued against, mirroring the
/// original's `use_native` CSV-vs-Parquet-like cursor distinction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFormat {
    Csv,
    Parquet,
}

/// What a `scan()` call returns: the header, every data row (stringified,
/// tuple-mode path), the same data as one `RecordBatch` (batch-mode
/// path), and the accounting numbers `SQLTableScan` folds into its
/// metrics.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub header: RowTuple,
    pub rows: Vec<RowTuple>,
    pub batch: RecordBatch,
    pub bytes_scanned: u64,
    pub bytes_returned: u64,
    pub request_count: u64,
}

/// The remote object-store scan service, specified only by interface:
/// emit a SQL string against a key, get back rows plus accounting. This
/// crate's only implementation, `DataFusionScanClient`, evaluates the
/// SQL in-process against registered tables and plays the remote
/// service's role for tests and local demos.
#[async_trait]
pub trait RemoteScanClient: Send + Sync {
    async fn scan(&self, key: &str, sql: &str, format: ScanFormat) -> Result<ScanOutcome, EngineError>;
}

/// Converts a batch's columns to stringified row tuples the way the
/// original's CSV-backed s3 select cursor handed rows to
/// `TupleMessage` - every value goes through `Display`, no typed
/// round-trip. Casting back to a typed `ScalarValue` (sort/join keys,
/// bloom values) happens downstream, driven by each operator's own
/// declared column types.
pub fn batch_to_tuples(batch: &RecordBatch) -> Result<(RowTuple, Vec<RowTuple>), EngineError> {
    let header: RowTuple = batch.schema().fields().iter().map(|f| f.name().clone()).collect();
    let opts = FormatOptions::default().with_display_error(true);
    let formatters: Vec<ArrayFormatter> = batch
        .columns()
        .iter()
        .map(|col| ArrayFormatter::try_new(col.as_ref(), &opts).map_err(|e| EngineError::schema("batch_to_tuples", format!("formatter: {e}"))))
        .collect::<Result<_, _>>()?;

    let mut rows = Vec::with_capacity(batch.num_rows());
    for row_idx in 0..batch.num_rows() {
        let mut row = Vec::with_capacity(formatters.len());
        for (col_idx, formatter) in formatters.iter().enumerate() {
            if batch.column(col_idx).is_null(row_idx) {
                row.push(String::new());
            } else {
                row.push(formatter.value(row_idx).to_string());
            }
        }
        rows.push(row);
    }
    Ok((header, rows))
}

/// Rough in-memory size, used as `bytes_returned`/`bytes_scanned` in
/// place of a real S3 bytes-transferred counter.
fn approx_batch_bytes(batch: &RecordBatch) -> u64 {
    batch.columns().iter().map(|c| c.get_array_memory_size() as u64).sum()
}

/// In-process stand-in for the remote object-store SQL service: tables
/// are registered ahead of time under a key (CSV file or in-memory
/// batch), and `scan` evaluates the caller's SQL against them with
/// DataFusion's `SessionContext`. Every SQL string `SQLTableScan` emits
/// is expected to reference its `key` as the table name, exactly as the
/// original's SQL referenced `S3Object`.
pub struct DataFusionScanClient {
    ctx: SessionContext,
}

impl Default for DataFusionScanClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DataFusionScanClient {
    pub fn new() -> Self {
        Self { ctx: SessionContext::new() }
    }

    pub async fn register_csv(&self, table: &str, path: &str) -> Result<(), EngineError> {
        self.ctx
            .register_csv(table, path, CsvReadOptions::new())
            .await
            .map_err(|e| EngineError::Remote(format!("register_csv('{table}', '{path}') failed: {e}")))
    }

    pub fn register_batch(&self, table: &str, batch: RecordBatch) -> Result<(), EngineError> {
        let schema = batch.schema();
        let provider = datafusion::datasource::MemTable::try_new(schema, vec![vec![batch]])
            .map_err(|e| EngineError::Remote(format!("building mem table '{table}' failed: {e}")))?;
        self.ctx
            .register_table(table, Arc::new(provider))
            .map_err(|e| EngineError::Remote(format!("register_table('{table}') failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl RemoteScanClient for DataFusionScanClient {
    async fn scan(&self, key: &str, sql: &str, _format: ScanFormat) -> Result<ScanOutcome, EngineError> {
        let df = self
            .ctx
            .sql(sql)
            .await
            .map_err(|e| EngineError::Remote(format!("scan of '{key}' failed to plan '{sql}': {e}")))?;
        let batches = df
            .collect()
            .await
            .map_err(|e| EngineError::Remote(format!("scan of '{key}' failed to execute '{sql}': {e}")))?;

        let merged = match batches.first() {
            Some(first) => {
                let schema = first.schema();
                datafusion::arrow::compute::concat_batches(&schema, &batches)
                    .map_err(|e| EngineError::Remote(format!("concat_batches for '{key}' failed: {e}")))?
            }
            // An empty result set with no batches at all: nothing to
            // concatenate, no header to report either (mirrors the
            // original treating an empty scan as a normal completion).
            None => RecordBatch::new_empty(Arc::new(datafusion::arrow::datatypes::Schema::empty())),
        };

        let (header, rows) = batch_to_tuples(&merged)?;
        let bytes = approx_batch_bytes(&merged);

        Ok(ScanOutcome {
            header,
            rows,
            batch: merged,
            bytes_scanned: bytes,
            bytes_returned: bytes,
            request_count: 1,
        })
    }
}

/// Request shape for the compute-offload top-K variant (`DummyTop`),
/// mirroring the original's literal Lambda payload dict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeOffloadRequest {
    pub path: String,
    pub table_first_part: String,
    pub table_parts: usize,
    pub k: usize,
    pub sort_order: String,
    pub sort_field: String,
    pub sample_size: usize,
    pub queried_columns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComputeOffloadResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: ComputeOffloadBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComputeOffloadBody {
    pub data: Vec<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub metrics: serde_json::Value,
}

/// The compute-offload execution environment `DummyTop` posts a JSON
/// request to and parses a JSON response from. Specified only by
/// interface; this crate treats the worker's result as opaque beyond
/// the shape above.
#[async_trait]
pub trait ComputeOffloadClient: Send + Sync {
    async fn invoke(&self, request: ComputeOffloadRequest) -> Result<ComputeOffloadResponse, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn datafusion_client_scans_registered_batch() {
        use datafusion::arrow::array::Int64Array;
        use datafusion::arrow::datatypes::{DataType, Field, Schema};

        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1, 2, 3]))]).unwrap();

        let client = DataFusionScanClient::new();
        client.register_batch("t", batch).unwrap();

        let outcome = client.scan("t", "SELECT x FROM t WHERE x > 1", ScanFormat::Csv).await.unwrap();
        assert_eq!(outcome.header, vec!["x".to_string()]);
        assert_eq!(outcome.rows, vec![vec!["2".to_string()], vec!["3".to_string()]]);
        assert_eq!(outcome.request_count, 1);
    }
}
