//! `TopKTableScan`: a sampled-threshold top-K source. Grounded on
//! `s3filter/op/top.py`'s `TopKTableScan`: a pilot sample narrows the
//! search space to a `WHERE` predicate, the filtered full scan does the
//! heavy lifting server-side, and a local `Top` does the final ranking.

use crate::remote::{RemoteScanClient, ScanFormat};
use crate::sql_table_scan::{append_predicate, ShardConcurrency, SqlShardedTableScan, SqlTableScan, SqlTableScanConfig};
use async_trait::async_trait;
use scanflow_core::config::GraphConfig;
use scanflow_core::error::EngineError;
use scanflow_core::message::{Message, RowTable, RowTuple};
use scanflow_core::operator::{Env, Operator, OperatorId};
use scanflow_core::plan::QueryPlan;
use scanflow_core::scalar::{ColType, ScalarValue};
use scanflow_tx::expr::{ColumnRef, Order, SortExpr};
use scanflow_tx::top::Top;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

/// A shard fan-out spec for the filtered full scan, mirroring the
/// original's `shards_start`/`shards_end`/`shards_prefix`/`processes`.
#[derive(Debug, Clone)]
pub struct ShardSpec {
    pub key_prefix: String,
    pub parts: Vec<u32>,
    pub concurrency: ShardConcurrency,
}

#[derive(Debug, Clone)]
pub struct TopKTableScanConfig {
    pub key: String,
    pub base_sql: String,
    pub sort_column: String,
    pub sort_col_type: ColType,
    pub order: Order,
    pub max_tuples: usize,
    pub k_scale: usize,
    pub is_conservative: bool,
    pub format: ScanFormat,
    pub shards: Option<ShardSpec>,
}

impl TopKTableScanConfig {
    pub fn new(key: impl Into<String>, base_sql: impl Into<String>, sort_column: impl Into<String>, sort_col_type: ColType, order: Order, max_tuples: usize) -> Self {
        Self {
            key: key.into(),
            base_sql: base_sql.into(),
            sort_column: sort_column.into(),
            sort_col_type,
            order,
            max_tuples,
            k_scale: 2,
            is_conservative: true,
            format: ScanFormat::Csv,
            shards: None,
        }
    }
}

fn sql_type_name(t: ColType) -> &'static str {
    match t {
        ColType::Int => "INT",
        ColType::Float => "FLOAT",
        ColType::Str => "VARCHAR",
        ColType::Bool => "BOOLEAN",
        ColType::Date => "DATE",
    }
}

/// Nudges a threshold one representable step in the direction that
/// loosens the filter, used for the one-step retry when a conservative
/// threshold happened to exclude every row (the true top-K value was
/// itself present in the pilot sample).
fn widen(threshold: &ScalarValue, order: Order) -> ScalarValue {
    let loosen_up = matches!(order, Order::Asc); // ASC uses `<= threshold`; loosen by raising it.
    match threshold {
        ScalarValue::Int(v) => ScalarValue::Int(if loosen_up { v + 1 } else { v - 1 }),
        ScalarValue::Float(v) => ScalarValue::Float(if loosen_up { v + f64::EPSILON.max(1e-9) } else { v - f64::EPSILON.max(1e-9) }),
        other => other.clone(),
    }
}

/// Least/most significant value of a sample's top-K, with respect to
/// sort order: LSV is the conservative (wider-net) bound, MSV the
/// aggressive (narrower) one. Mirrors `TopKTableScan.get_significant_values`.
fn significant_values(mut values: Vec<ScalarValue>, order: Order) -> Option<(ScalarValue, ScalarValue)> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp_typed(b).unwrap_or(Ordering::Equal));
    let (lo, hi) = (values.first().unwrap().clone(), values.last().unwrap().clone());
    match order {
        // ascending sample: smallest values are the candidates. lsv (loose) = the largest of
        // them, msv (tight) = the smallest.
        Order::Asc => Some((hi, lo)),
        // descending sample: largest values are the candidates. lsv (loose) = the smallest of
        // them, msv (tight) = the largest.
        Order::Desc => Some((lo, hi)),
    }
}

/// A source operator feeding a fixed in-memory table through, used to
/// thread already-materialized rows (a pilot sample, a fallback result)
/// back through a local `Top` for final ranking.
struct RowFeed {
    header: RowTuple,
    rows: Vec<RowTuple>,
}

#[async_trait]
impl Operator for RowFeed {
    async fn run(&mut self, env: &mut Env<'_>) -> Result<(), EngineError> {
        env.send(vec![Message::Tuple(self.header.clone())]).await?;
        for row in self.rows.drain(..) {
            env.send(vec![Message::Tuple(row)]).await?;
        }
        env.complete().await
    }

    async fn on_receive(&mut self, _env: &mut Env<'_>, _messages: Vec<Message>, _producer: OperatorId) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Ranks `rows` (sharing `header`) down to the `max_tuples` best by
/// `sort_exprs`, via a scratch `QueryPlan` feeding `RowFeed -> Top -> Collate`.
async fn rank(header: RowTuple, rows: Vec<RowTuple>, max_tuples: usize, sort_exprs: Vec<SortExpr>) -> Result<RowTable, EngineError> {
    let mut plan = QueryPlan::new(GraphConfig::default());
    let src = plan.add_operator("topk_rank_src", RowFeed { header, rows });
    let top = plan.add_operator("topk_rank_top", Top::new("topk_rank_top", max_tuples, sort_exprs));
    let sink = plan.add_operator("topk_rank_sink", crate::collate::Collate::new());
    plan.connect(src, top).map_err(|e| EngineError::internal(e.to_string()))?;
    plan.connect(top, sink).map_err(|e| EngineError::internal(e.to_string()))?;
    plan.execute().await?;
    plan.tuples(sink).await
}

pub struct TopKTableScan {
    name: String,
    client: Arc<dyn RemoteScanClient>,
    config: TopKTableScanConfig,
    sampling_time: std::time::Duration,
    filtered_rows_before_fallback: usize,
    used_fallback: bool,
    retried_with_widened_threshold: bool,
}

impl TopKTableScan {
    pub fn new(name: impl Into<String>, client: Arc<dyn RemoteScanClient>, config: TopKTableScanConfig) -> Self {
        Self {
            name: name.into(),
            client,
            config,
            sampling_time: std::time::Duration::ZERO,
            filtered_rows_before_fallback: 0,
            used_fallback: false,
            retried_with_widened_threshold: false,
        }
    }

    fn sort_exprs(&self) -> Vec<SortExpr> {
        vec![SortExpr::new(ColumnRef::Name(self.config.sort_column.clone()), self.config.sort_col_type, self.config.order)]
    }

    /// Pilot sample: `SELECT CAST(col AS T) FROM key LIMIT s*K`, ranked
    /// locally down to its own top-K. Returns the sample's header and
    /// its top-K rows (single projected column).
    async fn sample(&self) -> Result<(RowTuple, Vec<RowTuple>), EngineError> {
        let sample_size = self.config.k_scale * self.config.max_tuples;
        let projection = format!("CAST({} AS {})", self.config.sort_column, sql_type_name(self.config.sort_col_type));
        let sql = format!("SELECT {projection} AS {} FROM {} LIMIT {sample_size}", self.config.sort_column, self.config.key);

        let mut plan = QueryPlan::new(GraphConfig::default());
        let scan = plan.add_operator(
            "topk_sample_scan",
            SqlTableScan::new("topk_sample_scan", self.client.clone(), SqlTableScanConfig::new(&self.config.key, sql)),
        );
        let top = plan.add_operator("topk_sample_top", Top::new("topk_sample_top", self.config.max_tuples, self.sort_exprs()));
        let sink = plan.add_operator("topk_sample_collate", crate::collate::Collate::new());
        plan.connect(scan, top).map_err(|e| EngineError::internal(e.to_string()))?;
        plan.connect(top, sink).map_err(|e| EngineError::internal(e.to_string()))?;
        plan.execute().await?;
        let table = plan.tuples(sink).await?;

        let header = table.first().cloned().unwrap_or_else(|| vec![self.config.sort_column.clone()]);
        let rows = table.into_iter().skip(1).collect();
        Ok((header, rows))
    }

    async fn filtered_scan(&self, threshold: &ScalarValue) -> Result<(RowTuple, Vec<RowTuple>), EngineError> {
        let comp = match self.config.order {
            Order::Asc => "<=",
            Order::Desc => ">=",
        };
        let predicate = format!(
            "CAST({} AS {}) {comp} {}",
            self.config.sort_column,
            sql_type_name(self.config.sort_col_type),
            threshold.to_sql_literal()
        );
        let filtered_sql = append_predicate(&self.config.base_sql, &predicate);

        match &self.config.shards {
            None => {
                let mut plan = QueryPlan::new(GraphConfig::default());
                let scan = plan.add_operator(
                    "topk_filtered_scan",
                    SqlTableScan::new("topk_filtered_scan", self.client.clone(), SqlTableScanConfig::new(&self.config.key, filtered_sql)),
                );
                let sink = plan.add_operator("topk_filtered_collate", crate::collate::Collate::new());
                plan.connect(scan, sink).map_err(|e| EngineError::internal(e.to_string()))?;
                plan.execute().await?;
                let table = plan.tuples(sink).await?;
                let header = table.first().cloned().unwrap_or_default();
                Ok((header, table.into_iter().skip(1).collect()))
            }
            Some(shards) => {
                let sql_template = filtered_sql.replace(&self.config.key, "{key}");
                let mut plan = QueryPlan::new(GraphConfig::default());
                let scan = plan.add_operator(
                    "topk_filtered_sharded_scan",
                    SqlShardedTableScan::new("topk_filtered_sharded_scan", self.client.clone(), shards.key_prefix.clone(), shards.parts.clone(), sql_template)
                        .with_concurrency(shards.concurrency),
                );
                let sink = plan.add_operator("topk_filtered_collate", crate::collate::Collate::new());
                plan.connect(scan, sink).map_err(|e| EngineError::internal(e.to_string()))?;
                plan.execute().await?;
                let table = plan.tuples(sink).await?;
                let header = table.first().cloned().unwrap_or_default();
                Ok((header, table.into_iter().skip(1).collect()))
            }
        }
    }
}

#[async_trait]
impl Operator for TopKTableScan {
    async fn run(&mut self, env: &mut Env<'_>) -> Result<(), EngineError> {
        let sample_start = std::time::Instant::now();
        let (sample_header, sample_rows) = self.sample().await?;
        self.sampling_time = sample_start.elapsed();

        let sample_values: Vec<ScalarValue> = sample_rows
            .iter()
            .map(|r| self.config.sort_col_type.cast(&r[0]))
            .collect::<Result<_, _>>()?;

        let (lsv, msv) = match significant_values(sample_values, self.config.order) {
            Some(v) => v,
            None => {
                // Nothing came back from the sample: nothing to threshold against,
                // fall straight through with the unfiltered base query.
                warn!(operator = %self.name, "pilot sample returned no rows, scanning unfiltered");
                let (header, rows) = self
                    .filtered_scan(&match self.config.sort_col_type {
                        ColType::Int => ScalarValue::Int(i64::MAX),
                        ColType::Float => ScalarValue::Float(f64::MAX),
                        _ => ScalarValue::Str(String::new()),
                    })
                    .await?;
                let ranked = rank(header, rows, self.config.max_tuples, self.sort_exprs()).await?;
                for row in ranked {
                    env.send(vec![Message::Tuple(row)]).await?;
                }
                return env.complete().await;
            }
        };

        let threshold = if self.config.is_conservative { lsv } else { msv };
        info!(operator = %self.name, ?threshold, is_conservative = self.config.is_conservative, "topk_table_scan: derived threshold from pilot sample");

        let (mut header, mut rows) = self.filtered_scan(&threshold).await?;
        self.filtered_rows_before_fallback = rows.len();

        if rows.is_empty() && sample_rows.len() == self.config.max_tuples && self.config.is_conservative {
            let widened = widen(&threshold, self.config.order);
            warn!(operator = %self.name, ?widened, "filtered scan returned nothing though the sample was full, retrying once with a widened threshold");
            self.retried_with_widened_threshold = true;
            let (h2, r2) = self.filtered_scan(&widened).await?;
            header = h2;
            rows = r2;
        }

        let final_table = if rows.len() < self.config.max_tuples {
            self.used_fallback = true;
            warn!(operator = %self.name, filtered = rows.len(), k = self.config.max_tuples, "fewer than K rows survived the threshold, falling back to the sample top-K");
            let mut table = vec![sample_header];
            table.extend(sample_rows);
            table
        } else {
            rank(header, rows, self.config.max_tuples, self.sort_exprs()).await?
        };

        for row in final_table {
            env.send(vec![Message::Tuple(row)]).await?;
        }
        env.complete().await
    }

    async fn on_receive(&mut self, _env: &mut Env<'_>, _messages: Vec<Message>, _producer: OperatorId) -> Result<(), EngineError> {
        Err(EngineError::schema(&self.name, "TopKTableScan is a source and has no producers"))
    }

    fn metrics_extra(&self) -> serde_json::Value {
        serde_json::json!({
            "sampling_time_secs": self.sampling_time.as_secs_f64(),
            "filtered_rows_before_fallback": self.filtered_rows_before_fallback,
            "used_sample_fallback": self.used_fallback,
            "retried_with_widened_threshold": self.retried_with_widened_threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collate::Collate;
    use crate::remote::DataFusionScanClient;
    use datafusion::arrow::array::Int64Array;
    use datafusion::arrow::datatypes::{DataType, Field, Schema};
    use datafusion::arrow::record_batch::RecordBatch;

    fn prices_table(n: i64) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("price", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from((1..=n).collect::<Vec<_>>()))]).unwrap()
    }

    #[tokio::test]
    async fn conservative_threshold_returns_true_top_k_desc() {
        let client = Arc::new(DataFusionScanClient::new());
        client.register_batch("prices", prices_table(1000)).unwrap();

        let mut config = TopKTableScanConfig::new("prices", "SELECT price FROM prices", "price", ColType::Int, Order::Desc, 10);
        config.k_scale = 5;
        config.is_conservative = true;

        let mut plan = QueryPlan::new(GraphConfig::default());
        let scan = plan.add_operator("topk", TopKTableScan::new("topk", client, config));
        let sink = plan.add_operator("sink", Collate::new());
        plan.connect(scan, sink).unwrap();
        plan.execute().await.unwrap();

        let rows = plan.tuples(sink).await.unwrap();
        let values: Vec<i64> = rows[1..].iter().map(|r| r[0].parse().unwrap()).collect();
        assert_eq!(values.len(), 10);
        let mut expected: Vec<i64> = (991..=1000).collect();
        expected.sort_by(|a, b| b.cmp(a));
        assert_eq!(values, expected);
    }

    #[tokio::test]
    async fn falls_back_to_sample_when_filtered_scan_is_too_narrow() {
        let client = Arc::new(DataFusionScanClient::new());
        // only 3 rows total: any sufficiently wide sample already IS the answer,
        // and the filtered re-scan could legitimately come back short.
        client.register_batch("tiny", prices_table(3)).unwrap();

        let mut config = TopKTableScanConfig::new("tiny", "SELECT price FROM tiny", "price", ColType::Int, Order::Desc, 10);
        config.k_scale = 5;
        config.is_conservative = true;

        let mut plan = QueryPlan::new(GraphConfig::default());
        let scan = plan.add_operator("topk", TopKTableScan::new("topk", client, config));
        let sink = plan.add_operator("sink", Collate::new());
        plan.connect(scan, sink).unwrap();
        plan.execute().await.unwrap();

        let rows = plan.tuples(sink).await.unwrap();
        assert_eq!(rows.len() - 1, 3); // every row in the table, via fallback
    }
}
