//! `SQLTableScan` / `SQLShardedTableScan`: source operators that emit a
//! SQL string to the `RemoteScanClient` and stream the rows or batch
//! back into the graph. Grounded on the original's (not retrieved in
//! `original_source/`, but referenced throughout `top.py`/
//! `bloom_create.py`/`nested_loop_join.py` as every leaf producer in
//! every demo pipeline) `SQLTableScan`/`SQLShardedTableScan` pair: a
//! single scan against one key, or the same scan fanned out across a
//! list of shard part indices with counters summed across shards.

use crate::remote::{RemoteScanClient, ScanFormat};
use async_trait::async_trait;
use scanflow_core::error::EngineError;
use scanflow_core::message::Message;
use scanflow_core::operator::{Env, Operator, OperatorId};
use std::sync::Arc;
use tracing::{info, warn};

/// Everything the scan needs that the caller decided at graph-assembly
/// time: which key, which SQL, which format, and the three boolean
/// flags §4.3 calls out (`use_batches`/`secure_transport`/
/// `use_native_cursor`). The latter two have no observable effect on
/// this crate's in-process `DataFusionScanClient` but are kept on the
/// config so a real remote client implementation has somewhere to read
/// them from.
#[derive(Debug, Clone)]
pub struct SqlTableScanConfig {
    pub key: String,
    pub sql: String,
    pub format: ScanFormat,
    pub use_batches: bool,
    pub secure_transport: bool,
    pub use_native_cursor: bool,
}

impl SqlTableScanConfig {
    pub fn new(key: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            sql: sql.into(),
            format: ScanFormat::Csv,
            use_batches: false,
            secure_transport: true,
            use_native_cursor: false,
        }
    }

    pub fn with_batches(mut self, use_batches: bool) -> Self {
        self.use_batches = use_batches;
        self
    }
}

/// A source operator (no producers): issues one SQL query against one
/// key and streams the result into the graph, tuple-at-a-time or as one
/// batch depending on `config.use_batches`.
pub struct SqlTableScan {
    name: String,
    client: Arc<dyn RemoteScanClient>,
    config: SqlTableScanConfig,
    rows_out: u64,
    bytes_scanned: u64,
    bytes_returned: u64,
    request_count: u64,
}

impl SqlTableScan {
    pub fn new(name: impl Into<String>, client: Arc<dyn RemoteScanClient>, config: SqlTableScanConfig) -> Self {
        Self {
            name: name.into(),
            client,
            config,
            rows_out: 0,
            bytes_scanned: 0,
            bytes_returned: 0,
            request_count: 0,
        }
    }
}

#[async_trait]
impl Operator for SqlTableScan {
    async fn run(&mut self, env: &mut Env<'_>) -> Result<(), EngineError> {
        info!(operator = %self.name, key = %self.config.key, sql = %self.config.sql, "sql_table_scan: starting");
        let outcome = self.client.scan(&self.config.key, &self.config.sql, self.config.format).await?;

        self.bytes_scanned = outcome.bytes_scanned;
        self.bytes_returned = outcome.bytes_returned;
        self.request_count = outcome.request_count;

        if self.config.use_batches {
            self.rows_out += outcome.batch.num_rows() as u64;
            env.send(vec![Message::Batch(outcome.batch)]).await?;
        } else {
            env.send(vec![Message::Tuple(outcome.header)]).await?;
            self.rows_out += outcome.rows.len() as u64;
            for row in outcome.rows {
                env.send(vec![Message::Tuple(row)]).await?;
            }
        }

        info!(operator = %self.name, rows = self.rows_out, bytes = self.bytes_returned, "sql_table_scan: completed");
        env.complete().await
    }

    async fn on_receive(&mut self, _env: &mut Env<'_>, _messages: Vec<Message>, _producer: OperatorId) -> Result<(), EngineError> {
        Err(EngineError::schema(&self.name, "SQLTableScan is a source and has no producers"))
    }

    fn metrics_extra(&self) -> serde_json::Value {
        serde_json::json!({
            "rows_out": self.rows_out,
            "bytes_scanned": self.bytes_scanned,
            "bytes_returned": self.bytes_returned,
            "request_count": self.request_count,
        })
    }
}

/// How a sharded scan fans out across its shards: one request after
/// another, or up to `limit` concurrently in flight.
#[derive(Debug, Clone, Copy)]
pub enum ShardConcurrency {
    Sequential,
    Bounded(usize),
}

/// Scans a list of part indices concatenated onto a key prefix (e.g.
/// `orders.0001`, `orders.0002`, ...), summing byte/row counters across
/// shards and emitting every shard's rows (or batches) into the graph as
/// they complete.
pub struct SqlShardedTableScan {
    name: String,
    client: Arc<dyn RemoteScanClient>,
    key_prefix: String,
    parts: Vec<u32>,
    sql: String,
    format: ScanFormat,
    use_batches: bool,
    concurrency: ShardConcurrency,
    rows_out: u64,
    bytes_scanned: u64,
    bytes_returned: u64,
    request_count: u64,
}

impl SqlShardedTableScan {
    pub fn new(name: impl Into<String>, client: Arc<dyn RemoteScanClient>, key_prefix: impl Into<String>, parts: Vec<u32>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client,
            key_prefix: key_prefix.into(),
            parts,
            sql: sql.into(),
            format: ScanFormat::Csv,
            use_batches: false,
            concurrency: ShardConcurrency::Sequential,
            rows_out: 0,
            bytes_scanned: 0,
            bytes_returned: 0,
            request_count: 0,
        }
    }

    pub fn with_batches(mut self, use_batches: bool) -> Self {
        self.use_batches = use_batches;
        self
    }

    pub fn with_concurrency(mut self, concurrency: ShardConcurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    fn shard_key(&self, part: u32) -> String {
        format!("{}{}", self.key_prefix, part)
    }
}

#[async_trait]
impl Operator for SqlShardedTableScan {
    async fn run(&mut self, env: &mut Env<'_>) -> Result<(), EngineError> {
        let bound = match self.concurrency {
            ShardConcurrency::Sequential => 1,
            ShardConcurrency::Bounded(n) => n.max(1),
        };

        let mut header_sent = false;
        let mut remaining: Vec<u32> = self.parts.clone();

        while !remaining.is_empty() {
            if env.is_completed() {
                // a downstream consumer has signaled it wants no more.
                break;
            }
            let batch_of_parts: Vec<u32> = remaining.drain(..remaining.len().min(bound)).collect();

            let scans = batch_of_parts.iter().map(|&part| {
                let key = self.shard_key(part);
                let client = self.client.clone();
                let sql = self.sql.replace("{key}", &key);
                let format = self.format;
                async move { client.scan(&key, &sql, format).await }
            });
            let outcomes = futures::future::join_all(scans).await;

            for outcome in outcomes {
                let outcome = outcome?;
                self.bytes_scanned += outcome.bytes_scanned;
                self.bytes_returned += outcome.bytes_returned;
                self.request_count += outcome.request_count;

                if self.use_batches {
                    self.rows_out += outcome.batch.num_rows() as u64;
                    env.send(vec![Message::Batch(outcome.batch)]).await?;
                } else {
                    if !header_sent {
                        env.send(vec![Message::Tuple(outcome.header)]).await?;
                        header_sent = true;
                    }
                    self.rows_out += outcome.rows.len() as u64;
                    for row in outcome.rows {
                        env.send(vec![Message::Tuple(row)]).await?;
                    }
                }
            }
        }

        info!(operator = %self.name, shards = self.parts.len(), rows = self.rows_out, "sql_sharded_table_scan: completed");
        env.complete().await
    }

    async fn on_receive(&mut self, _env: &mut Env<'_>, _messages: Vec<Message>, _producer: OperatorId) -> Result<(), EngineError> {
        Err(EngineError::schema(&self.name, "SQLShardedTableScan is a source and has no producers"))
    }

    fn metrics_extra(&self) -> serde_json::Value {
        serde_json::json!({
            "rows_out": self.rows_out,
            "bytes_scanned": self.bytes_scanned,
            "bytes_returned": self.bytes_returned,
            "request_count": self.request_count,
            "shard_count": self.parts.len(),
        })
    }
}

/// A sharded scan's `sql` template may reference `{key}`, substituted
/// with that shard's own key (e.g. `orders.0`, `orders.1`) before each
/// request - every shard otherwise shares identical column names and
/// predicate, differing only in which object it targets.
///
/// Rewrites a base SQL statement to carry an appended `WHERE`/`AND`
/// predicate, used both by `SQLTableScanBloomUse` (a bloom disjunction)
/// and `TopKTableScan` (a threshold comparison). Strips a trailing `;`
/// first, matching the original's `s3sql.rstrip(';')` before appending.
pub fn append_predicate(base_sql: &str, predicate: &str) -> String {
    let trimmed = base_sql.trim().trim_end_matches(';').trim_end();
    let upper = trimmed.to_ascii_uppercase();
    if upper.contains(" WHERE ") {
        format!("{trimmed} AND ({predicate})")
    } else {
        format!("{trimmed} WHERE {predicate}")
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
    use scanflow_core::message::RowTuple;
    use scanflow_core::plan::QueryPlan;

    fn int_batch(name: &str, values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new(name, DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    struct Capture {
        rows: Vec<RowTuple>,
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

        async fn on_snapshot(&mut self, _env: &mut Env<'_>) -> Result<scanflow_core::message::RowTable, EngineError> {
            Ok(self.rows.clone())
        }
    }

    #[tokio::test]
    async fn scans_and_streams_matching_rows() {
        let client = Arc::new(DataFusionScanClient::new());
        client.register_batch("orders", int_batch("price", vec![100, 2500, 1900])).unwrap();

        let mut plan = QueryPlan::new(GraphConfig::default());
        let scan = plan.add_operator(
            "scan",
            SqlTableScan::new("scan", client, SqlTableScanConfig::new("orders", "SELECT price FROM orders WHERE price < 2000")),
        );
        let sink = plan.add_operator("sink", Capture { rows: Vec::new() });
        plan.connect(scan, sink).unwrap();
        plan.execute().await.unwrap();

        let rows = plan.tuples(sink).await.unwrap();
        assert_eq!(rows[0], vec!["price".to_string()]);
        assert_eq!(rows.len(), 3);
        assert!(rows[1..].iter().any(|r| r[0] == "100"));
        assert!(rows[1..].iter().any(|r| r[0] == "1900"));
    }

    #[tokio::test]
    async fn shards_are_concatenated_with_summed_counters() {
        let client = Arc::new(DataFusionScanClient::new());
        client.register_batch("orders.0", int_batch("price", vec![100, 200])).unwrap();
        client.register_batch("orders.1", int_batch("price", vec![300, 400, 500])).unwrap();

        let mut plan = QueryPlan::new(GraphConfig::default());
        let scan = plan.add_operator(
            "scan",
            SqlShardedTableScan::new("scan", client, "orders.", vec![0, 1], "SELECT price FROM {key}"),
        );
        let sink = plan.add_operator("sink", Capture { rows: Vec::new() });
        plan.connect(scan, sink).unwrap();
        plan.execute().await.unwrap();

        let rows = plan.tuples(sink).await.unwrap();
        assert_eq!(rows.len(), 6); // 1 header + 5 rows across both shards
        assert_eq!(rows[0], vec!["price".to_string()]);
    }

    #[test]
    fn append_predicate_adds_where_or_and() {
        assert_eq!(append_predicate("SELECT 1 FROM t", "x > 1"), "SELECT 1 FROM t WHERE x > 1");
        assert_eq!(append_predicate("SELECT 1 FROM t WHERE y = 2;", "x > 1"), "SELECT 1 FROM t WHERE y = 2 AND (x > 1)");
    }
}
