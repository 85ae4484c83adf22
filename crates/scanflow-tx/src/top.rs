//! Streaming top-K, grounded on `s3filter/op/top.py`'s `Top`: a bounded
//! heap in row mode, an `nsmallest`/`nlargest`-style merge-and-trim in
//! batch mode. Unlike `Sort`, `Top` never buffers more than `k` rows (or
//! one merged batch) and only emits its result once every producer has
//! completed.

use crate::expr::{Order, SortExpr};
use async_trait::async_trait;
use datafusion::arrow::array::ArrayRef;
use datafusion::arrow::compute::{concat_batches, lexsort_to_indices, take, SortColumn, SortOptions};
use datafusion::arrow::record_batch::RecordBatch;
use scanflow_core::error::EngineError;
use scanflow_core::message::{Message, RowTuple};
use scanflow_core::operator::{Env, Operator, OperatorId};
use scanflow_core::scalar::ScalarValue;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

fn rank_cmp(a: &[ScalarValue], b: &[ScalarValue], sort_exprs: &[SortExpr]) -> Ordering {
    for (i, expr) in sort_exprs.iter().enumerate() {
        let cmp = a[i].partial_cmp_typed(&b[i]).unwrap_or(Ordering::Equal);
        let cmp = match expr.order {
            Order::Asc => cmp,
            Order::Desc => cmp.reverse(),
        };
        if cmp != Ordering::Equal {
            return cmp;
        }
    }
    Ordering::Equal
}

/// A buffered row plus its precomputed comparison key and a shared
/// handle to the sort expressions that define it, so `Ord` stays
/// self-contained: the max of a `BinaryHeap<RankedEntry>` is always the
/// row that should be evicted first, whichever direction the caller's
/// sort order actually runs in (see `rank_cmp`).
struct RankedEntry {
    row: RowTuple,
    keys: Vec<ScalarValue>,
    sort_exprs: Arc<Vec<SortExpr>>,
}

impl PartialEq for RankedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for RankedEntry {}
impl PartialOrd for RankedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for RankedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        rank_cmp(&self.keys, &other.keys, &self.sort_exprs)
    }
}

/// Keeps the `k` best rows (or one `k`-row merged batch) seen across all
/// producers, emitted in final sorted order once draining.
pub struct Top {
    name: String,
    max_tuples: usize,
    sort_exprs: Arc<Vec<SortExpr>>,
    header: Option<RowTuple>,
    heap: BinaryHeap<RankedEntry>,
    global_batch: Option<RecordBatch>,
    kept_rows: usize,
}

impl Top {
    pub fn new(name: impl Into<String>, max_tuples: usize, sort_exprs: Vec<SortExpr>) -> Self {
        Self {
            name: name.into(),
            max_tuples,
            sort_exprs: Arc::new(sort_exprs),
            header: None,
            heap: BinaryHeap::new(),
            global_batch: None,
            kept_rows: 0,
        }
    }

    fn keys_for(&self, header: &[String], row: &[String]) -> Result<Vec<ScalarValue>, EngineError> {
        self.sort_exprs
            .iter()
            .map(|expr| {
                let idx = expr
                    .column
                    .resolve(header)
                    .ok_or_else(|| EngineError::schema(&self.name, format!("sort column {:?} not in header {:?}", expr.column, header)))?;
                expr.col_type.cast(&row[idx])
            })
            .collect()
    }

    fn push_row(&mut self, row: RowTuple, keys: Vec<ScalarValue>) {
        let entry = RankedEntry {
            row,
            keys,
            sort_exprs: Arc::clone(&self.sort_exprs),
        };
        if self.heap.len() < self.max_tuples {
            self.heap.push(entry);
        } else if let Some(worst) = self.heap.peek() {
            if entry.cmp(worst) == Ordering::Less {
                self.heap.pop();
                self.heap.push(entry);
            }
        }
    }

    fn merge_batch(&mut self, batch: RecordBatch) -> Result<(), EngineError> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        let merged = match self.global_batch.take() {
            Some(existing) => concat_batches(&existing.schema(), [&existing, &batch])
                .map_err(|e| EngineError::schema(&self.name, format!("concat_batches failed: {e}")))?,
            None => batch,
        };
        self.global_batch = Some(self.trim_to_k(merged)?);
        Ok(())
    }

    fn trim_to_k(&self, batch: RecordBatch) -> Result<RecordBatch, EngineError> {
        let schema = batch.schema();
        let sort_columns = self
            .sort_exprs
            .iter()
            .map(|expr| {
                let name = match &expr.column {
                    crate::expr::ColumnRef::Name(n) => n.clone(),
                    crate::expr::ColumnRef::Index(i) => schema.field(*i).name().clone(),
                };
                let idx = schema
                    .index_of(&name)
                    .map_err(|e| EngineError::schema(&self.name, format!("column '{name}' not in batch schema: {e}")))?;
                Ok(SortColumn {
                    values: batch.column(idx).clone(),
                    options: Some(SortOptions {
                        descending: matches!(expr.order, Order::Desc),
                        nulls_first: false,
                    }),
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        let indices = lexsort_to_indices(&sort_columns, Some(self.max_tuples))
            .map_err(|e| EngineError::schema(&self.name, format!("lexsort_to_indices failed: {e}")))?;

        let columns: Result<Vec<ArrayRef>, _> = batch.columns().iter().map(|col| take(col.as_ref(), &indices, None)).collect();
        let columns = columns.map_err(|e| EngineError::schema(&self.name, format!("take failed: {e}")))?;

        RecordBatch::try_new(schema, columns).map_err(|e| EngineError::schema(&self.name, format!("rebuilding top-k batch failed: {e}")))
    }
}

#[async_trait]
impl Operator for Top {
    async fn on_receive(&mut self, env: &mut Env<'_>, messages: Vec<Message>, _producer: OperatorId) -> Result<(), EngineError> {
        for message in messages {
            match message {
                Message::Tuple(row) => {
                    if self.header.is_none() {
                        self.header = Some(row.clone());
                        env.send(vec![Message::Tuple(row)]).await?;
                    } else {
                        let header = self.header.clone().expect("checked above");
                        let keys = self.keys_for(&header, &row)?;
                        self.push_row(row, keys);
                    }
                }
                Message::Batch(batch) => self.merge_batch(batch)?,
                other => env.send(vec![other]).await?,
            }
        }
        Ok(())
    }

    async fn on_drain(&mut self, env: &mut Env<'_>) -> Result<(), EngineError> {
        self.kept_rows = self.heap.len() + self.global_batch.as_ref().map_or(0, |b| b.num_rows());
        if let Some(batch) = self.global_batch.take() {
            env.send(vec![Message::Batch(batch)]).await?;
        }
        let mut entries: Vec<RankedEntry> = std::mem::take(&mut self.heap).into_vec();
        entries.sort_by(|a, b| a.cmp(b));
        for entry in entries {
            env.send(vec![Message::Tuple(entry.row)]).await?;
        }
        Ok(())
    }

    fn metrics_extra(&self) -> serde_json::Value {
        serde_json::json!({ "kept_rows": self.kept_rows, "max_tuples": self.max_tuples })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ColumnRef;
    use async_trait::async_trait;
    use scanflow_core::config::GraphConfig;
    use scanflow_core::plan::QueryPlan;
    use scanflow_core::scalar::ColType;

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
    async fn keeps_top_2_descending_by_price() {
        let mut plan = QueryPlan::new(GraphConfig::default());
        let src = plan.add_operator(
            "src",
            FeedOnce {
                rows: vec![
                    vec!["id".into(), "price".into()],
                    vec!["1".into(), "300".into()],
                    vec!["2".into(), "900".into()],
                    vec!["3".into(), "500".into()],
                    vec!["4".into(), "50".into()],
                ],
            },
        );
        let top = plan.add_operator(
            "top",
            Top::new("top", 2, vec![SortExpr::new(ColumnRef::Name("price".into()), ColType::Int, Order::Desc)]),
        );
        let sink = plan.add_operator("sink", Capture { rows: Vec::new() });
        plan.connect(src, top).unwrap();
        plan.connect(top, sink).unwrap();
        plan.execute().await.unwrap();
        let rows = plan.tuples(sink).await.unwrap();
        // header + the 2 best (900, 500), highest first.
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1][1], "900");
        assert_eq!(rows[2][1], "500");
    }

    struct BatchFeedOnce {
        batches: Vec<RecordBatch>,
    }

    #[async_trait]
    impl Operator for BatchFeedOnce {
        async fn run(&mut self, env: &mut Env<'_>) -> Result<(), EngineError> {
            for batch in self.batches.drain(..) {
                env.send(vec![Message::Batch(batch)]).await?;
            }
            env.complete().await
        }

        async fn on_receive(&mut self, _env: &mut Env<'_>, _messages: Vec<Message>, _producer: OperatorId) -> Result<(), EngineError> {
            Ok(())
        }
    }

    struct BatchCapture {
        batch: Option<RecordBatch>,
    }

    #[async_trait]
    impl Operator for BatchCapture {
        async fn on_receive(&mut self, _env: &mut Env<'_>, messages: Vec<Message>, _producer: OperatorId) -> Result<(), EngineError> {
            for m in messages {
                if let Message::Batch(b) = m {
                    self.batch = Some(b);
                }
            }
            Ok(())
        }

        async fn on_snapshot(&mut self, _env: &mut Env<'_>) -> Result<scanflow_core::message::RowTable, EngineError> {
            let Some(batch) = &self.batch else {
                return Ok(Vec::new());
            };
            let prices = batch
                .column(0)
                .as_any()
                .downcast_ref::<datafusion::arrow::array::Int64Array>()
                .expect("price column is Int64");
            Ok(prices.iter().map(|v| vec![v.expect("non-null price").to_string()]).collect())
        }
    }

    fn price_batch(values: Vec<i64>) -> RecordBatch {
        use datafusion::arrow::datatypes::{DataType, Field, Schema};
        let schema = Arc::new(Schema::new(vec![Field::new("price", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(datafusion::arrow::array::Int64Array::from(values))]).unwrap()
    }

    #[tokio::test]
    async fn batch_mode_merges_and_trims_to_k_across_multiple_batches() {
        let mut plan = QueryPlan::new(GraphConfig::default());
        let src = plan.add_operator(
            "src",
            BatchFeedOnce {
                batches: vec![price_batch(vec![10, 900, 50]), price_batch(vec![500, 20, 999])],
            },
        );
        let top = plan.add_operator(
            "top",
            Top::new("top", 3, vec![SortExpr::new(ColumnRef::Name("price".into()), ColType::Int, Order::Desc)]),
        );
        let sink = plan.add_operator("sink", BatchCapture { batch: None });
        plan.connect(src, top).unwrap();
        plan.connect(top, sink).unwrap();
        plan.execute().await.unwrap();

        let rows = plan.tuples(sink).await.unwrap();
        let prices: Vec<i64> = rows.iter().map(|r| r[0].parse().unwrap()).collect();
        assert_eq!(prices, vec![999, 900, 500]);
    }
}
