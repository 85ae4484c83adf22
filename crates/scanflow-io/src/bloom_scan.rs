//! `SQLTableScanBloomUse`: a scan that waits for a broadcast bloom
//! filter before it issues its SQL, rewriting the base query to carry
//! the filter's predicate. Grounded on `s3filter/op/bloom_create.py`'s
//! companion scan side (the original's `SQLTableScanBloomUse`), paired
//! with `scanflow_core::bloom::SlicedBloomFilter::to_sql_predicate`.

use crate::remote::{RemoteScanClient, ScanFormat};
use crate::sql_table_scan::append_predicate;
use async_trait::async_trait;
use scanflow_core::bloom::SlicedBloomFilter;
use scanflow_core::error::EngineError;
use scanflow_core::message::Message;
use scanflow_core::operator::{Env, Operator, OperatorId, OperatorKind};
use std::sync::Arc;
use tracing::{info, warn};

/// Scans `key` with `base_sql`, but only after its producer (a
/// `BloomCreate`) has broadcast a filter: the scan appends the filter's
/// `to_sql_predicate(column_expr)` onto `base_sql` before issuing it,
/// so the remote side filters out most non-matching rows before they
/// ever leave the object store.
pub struct SqlTableScanBloomUse {
    name: String,
    client: Arc<dyn RemoteScanClient>,
    key: String,
    base_sql: String,
    column_expr: String,
    format: ScanFormat,
    filter: Option<Arc<SlicedBloomFilter>>,
    rows_out: u64,
    bytes_scanned: u64,
    bytes_returned: u64,
    request_count: u64,
}

impl SqlTableScanBloomUse {
    pub fn new(name: impl Into<String>, client: Arc<dyn RemoteScanClient>, key: impl Into<String>, base_sql: impl Into<String>, column_expr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client,
            key: key.into(),
            base_sql: base_sql.into(),
            column_expr: column_expr.into(),
            format: ScanFormat::Csv,
            filter: None,
            rows_out: 0,
            bytes_scanned: 0,
            bytes_returned: 0,
            request_count: 0,
        }
    }

    async fn run_scan(&mut self, env: &mut Env<'_>) -> Result<(), EngineError> {
        let sql = match &self.filter {
            Some(filter) => {
                let predicate = filter.to_sql_predicate(&self.column_expr);
                append_predicate(&self.base_sql, &predicate)
            }
            None => {
                warn!(operator = %self.name, "no bloom filter received before completion, scanning unfiltered");
                self.base_sql.clone()
            }
        };

        info!(operator = %self.name, key = %self.key, sql = %sql, "sql_table_scan_bloom_use: scanning");
        let outcome = self.client.scan(&self.key, &sql, self.format).await?;
        self.bytes_scanned = outcome.bytes_scanned;
        self.bytes_returned = outcome.bytes_returned;
        self.request_count = outcome.request_count;

        env.send(vec![Message::Tuple(outcome.header)]).await?;
        self.rows_out += outcome.rows.len() as u64;
        for row in outcome.rows {
            env.send(vec![Message::Tuple(row)]).await?;
        }
        env.complete().await
    }
}

#[async_trait]
impl Operator for SqlTableScanBloomUse {
    fn kind(&self) -> OperatorKind {
        OperatorKind::BloomUseScan
    }

    async fn on_receive(&mut self, env: &mut Env<'_>, messages: Vec<Message>, _producer: OperatorId) -> Result<(), EngineError> {
        for message in messages {
            match message {
                Message::Bloom(filter) => self.filter = Some(filter),
                other => return Err(EngineError::schema(&self.name, format!("unexpected message {other:?}, expected a bloom filter"))),
            }
        }
        // BloomCreate sends exactly one filter then completes; act as
        // soon as it arrives rather than waiting for the drain hook.
        if self.filter.is_some() && !env.is_completed() {
            self.run_scan(env).await?;
        }
        Ok(())
    }

    async fn on_drain(&mut self, env: &mut Env<'_>) -> Result<(), EngineError> {
        if !env.is_completed() {
            self.run_scan(env).await?;
        }
        Ok(())
    }

    fn metrics_extra(&self) -> serde_json::Value {
        serde_json::json!({
            "rows_out": self.rows_out,
            "bytes_scanned": self.bytes_scanned,
            "bytes_returned": self.bytes_returned,
            "request_count": self.request_count,
            "bloom_received": self.filter.is_some(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::DataFusionScanClient;
    use datafusion::arrow::array::Int64Array;
    use datafusion::arrow::datatypes::{DataType, Field, Schema};
    use datafusion::arrow::record_batch::RecordBatch;
    use scanflow_core::config::GraphConfig;
    use scanflow_core::message::{RowTable, RowTuple};
    use scanflow_core::plan::QueryPlan;
    use scanflow_tx::bloom_create::BloomCreate;

    struct FeedOnce {
        rows: Vec<RowTuple>,
    }

    #[async_trait]
    impl Operator for FeedOnce {
        async fn run(&mut self, env: &mut Env<'_>) -> Result<(), EngineError> {
            for row in self.rows.drain(..) {
                env.send(vec![Message::Tuple(row)]).await?;
            }
            env.complete().await
        }

        async fn on_receive(&mut self, _env: &mut Env<'_>, _messages: Vec<Message>, _producer: OperatorId) -> Result<(), EngineError> {
            Ok(())
        }
    }

    struct Capture {
        rows: RowTable,
    }

    #[async_trait]
    impl Operator for Capture {
        async fn on_receive(&mut self, _env: &mut Env<'_>, messages: Vec<Message>, _producer: OperatorId) -> Result<(), EngineError> {
            for m in messages {
                if let Message::Tuple(t) = m {
                    self.rows.push(t);
                }
            }
            Ok(())
        }

        async fn on_snapshot(&mut self, _env: &mut Env<'_>) -> Result<RowTable, EngineError> {
            Ok(self.rows.clone())
        }
    }

    #[tokio::test]
    async fn waits_for_filter_then_scans_with_predicate_appended() {
        let client = Arc::new(DataFusionScanClient::new());
        let schema = Arc::new(Schema::new(vec![Field::new("orderkey", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1, 2, 3, 4, 5]))]).unwrap();
        client.register_batch("orders", batch).unwrap();

        let mut plan = QueryPlan::new(GraphConfig::default());
        let src = plan.add_operator(
            "src",
            FeedOnce {
                rows: vec![vec!["orderkey".into()], vec!["2".into()], vec!["4".into()]],
            },
        );
        let bloom = plan.add_operator("bloom", BloomCreate::new("bloom", "orderkey", 8192));
        let scan = plan.add_operator(
            "scan",
            SqlTableScanBloomUse::new("scan", client, "orders", "SELECT orderkey FROM orders", "CAST(orderkey AS INT)"),
        );
        let sink = plan.add_operator("sink", Capture { rows: Vec::new() });
        plan.connect(src, bloom).unwrap();
        plan.connect(bloom, scan).unwrap();
        plan.connect(scan, sink).unwrap();
        plan.execute().await.unwrap();

        let rows = plan.tuples(sink).await.unwrap();
        assert_eq!(rows[0], vec!["orderkey".to_string()]);
        // every value not in {2, 4} must have been filtered out server-side;
        // the bloom filter may admit false positives but never a false negative.
        let returned: Vec<i64> = rows[1..].iter().map(|r| r[0].parse().unwrap()).collect();
        assert!(returned.contains(&2));
        assert!(returned.contains(&4));
    }

    #[test]
    fn connecting_a_generic_consumer_to_bloom_create_is_rejected() {
        let mut plan = QueryPlan::new(GraphConfig::default());
        let bloom = plan.add_operator("bloom", BloomCreate::new("bloom", "orderkey", 8192));
        let not_bloom_use = plan.add_operator(
            "sink",
            Capture { rows: Vec::new() },
        );
        let result = plan.connect(bloom, not_bloom_use);
        assert!(result.is_err());
    }
}
