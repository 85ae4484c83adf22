//! Blocking multi-key sort, grounded on `s3filter/op/sort.py`'s `Sort` +
//! `HeapSortableTuple`: buffer every data row, then drain in order once
//! the producer completes. The Python original drives a `heapq`
//! push/pop-all loop; since a blocking sort has nothing to emit until
//! every row has arrived anyway, a single stable `Vec::sort_by` over the
//! buffered rows is equivalent and simpler in Rust.

use crate::expr::{Order, SortExpr};
use async_trait::async_trait;
use scanflow_core::error::EngineError;
use scanflow_core::message::{Message, RowTuple};
use scanflow_core::operator::{Env, Operator, OperatorId};
use scanflow_core::scalar::ScalarValue;
use std::cmp::Ordering;

pub struct Sort {
    name: String,
    sort_exprs: Vec<SortExpr>,
    header: Option<RowTuple>,
    rows: Vec<RowTuple>,
    buffered_rows: usize,
}

impl Sort {
    pub fn new(name: impl Into<String>, sort_exprs: Vec<SortExpr>) -> Self {
        Self {
            name: name.into(),
            sort_exprs,
            header: None,
            rows: Vec::new(),
            buffered_rows: 0,
        }
    }

    fn compare(&self, a: &[String], b: &[String]) -> Result<Ordering, EngineError> {
        let header = self.header.as_ref().expect("header captured before any data row is buffered");
        for expr in &self.sort_exprs {
            let idx = expr
                .column
                .resolve(header)
                .ok_or_else(|| EngineError::schema(&self.name, format!("sort column {:?} not in header {:?}", expr.column, header)))?;
            let va = expr.col_type.cast(&a[idx])?;
            let vb = expr.col_type.cast(&b[idx])?;
            let cmp = va
                .partial_cmp_typed(&vb)
                .ok_or_else(|| EngineError::schema(&self.name, "sort values are not comparable (type mismatch)"))?;
            let cmp = match expr.order {
                Order::Asc => cmp,
                Order::Desc => cmp.reverse(),
            };
            if cmp != Ordering::Equal {
                return Ok(cmp);
            }
        }
        Ok(Ordering::Equal)
    }
}

#[async_trait]
impl Operator for Sort {
    async fn on_receive(&mut self, env: &mut Env<'_>, messages: Vec<Message>, _producer: OperatorId) -> Result<(), EngineError> {
        for message in messages {
            match message {
                Message::Tuple(row) => {
                    if self.header.is_none() {
                        self.header = Some(row.clone());
                        env.send(vec![Message::Tuple(row)]).await?;
                    } else {
                        self.rows.push(row);
                    }
                }
                other => env.send(vec![other]).await?,
            }
        }
        Ok(())
    }

    async fn on_drain(&mut self, env: &mut Env<'_>) -> Result<(), EngineError> {
        let mut rows = std::mem::take(&mut self.rows);
        self.buffered_rows = rows.len();
        // sort_by is stable: ties keep arrival order, matching the
        // original's left-to-right tie-break over equal sort keys.
        let mut err = None;
        rows.sort_by(|a, b| match self.compare(a, b) {
            Ok(ord) => ord,
            Err(e) => {
                if err.is_none() {
                    err = Some(e.to_string());
                }
                Ordering::Equal
            }
        });
        if let Some(e) = err {
            return Err(EngineError::schema(&self.name, e));
        }
        for row in rows {
            env.send(vec![Message::Tuple(row)]).await?;
        }
        Ok(())
    }

    fn metrics_extra(&self) -> serde_json::Value {
        serde_json::json!({ "buffered_rows": self.buffered_rows })
    }
}

/// Helper kept for callers that want to build a `ScalarValue` sort key
/// vector outside of `Sort` itself (e.g. tests comparing expected order).
pub fn sort_key(row: &[String], header: &[String], exprs: &[SortExpr]) -> Result<Vec<ScalarValue>, EngineError> {
    exprs
        .iter()
        .map(|expr| {
            let idx = expr
                .column
                .resolve(header)
                .ok_or_else(|| EngineError::schema("sort_key", format!("column {:?} not in header", expr.column)))?;
            expr.col_type.cast(&row[idx])
        })
        .collect()
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
    async fn sorts_descending_by_price() {
        let mut plan = QueryPlan::new(GraphConfig::default());
        let src = plan.add_operator(
            "src",
            FeedOnce {
                rows: vec![
                    vec!["id".into(), "price".into()],
                    vec!["1".into(), "300".into()],
                    vec!["2".into(), "900".into()],
                    vec!["3".into(), "500".into()],
                ],
            },
        );
        let sort = plan.add_operator(
            "sort",
            Sort::new("sort", vec![SortExpr::new(ColumnRef::Name("price".into()), ColType::Int, Order::Desc)]),
        );
        let sink = plan.add_operator("sink", Capture { rows: Vec::new() });
        plan.connect(src, sort).unwrap();
        plan.connect(sort, sink).unwrap();
        plan.execute().await.unwrap();
        let rows = plan.tuples(sink).await.unwrap();
        assert_eq!(rows[1][1], "900");
        assert_eq!(rows[2][1], "500");
        assert_eq!(rows[3][1], "300");
    }
}
