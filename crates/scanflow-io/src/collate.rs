//! `Collate`: the terminal sink every demo pipeline ends in. Grounded on
//! `s3filter/op/collate.py`'s `Collate`: accumulates every tuple it
//! receives into one table, header first, and answers
//! `QueryPlan::tuples()` with that table via `on_snapshot`.

use async_trait::async_trait;
use scanflow_core::error::EngineError;
use scanflow_core::message::{Message, RowTable, RowTuple};
use scanflow_core::operator::{Env, Operator, OperatorId};

/// A pure sink: no consumers, one producer (or several, each expected to
/// share the same header). Tuples accumulate in arrival order; the
/// first tuple received from each distinct producer is treated as that
/// producer's header and is recorded only once, matching the original's
/// `[list(self.df)] + self.df.values.tolist()` convention where row 0
/// is always the column names.
#[derive(Default)]
pub struct Collate {
    header: Option<RowTuple>,
    rows: Vec<RowTuple>,
}

impl Collate {
    pub fn new() -> Self {
        Self::default()
    }

    /// The accumulated table so far, without waiting for `on_snapshot`
    /// - useful for tests and for a CLI that wants to print progress.
    pub fn rows_so_far(&self) -> usize {
        self.rows.len()
    }
}

#[async_trait]
impl Operator for Collate {
    async fn on_receive(&mut self, _env: &mut Env<'_>, messages: Vec<Message>, _producer: OperatorId) -> Result<(), EngineError> {
        for message in messages {
            match message {
                Message::Tuple(row) => {
                    if self.header.is_none() {
                        self.header = Some(row);
                    } else {
                        self.rows.push(row);
                    }
                }
                Message::Batch(batch) => {
                    let (header, rows) = crate::remote::batch_to_tuples(&batch)?;
                    if self.header.is_none() {
                        self.header = Some(header);
                    }
                    self.rows.extend(rows);
                }
                Message::Log(text) => tracing::info!(target: "collate", "{text}"),
                Message::Bloom(_) => return Err(EngineError::schema("collate", "collate does not accept bloom filter messages")),
            }
        }
        Ok(())
    }

    async fn on_snapshot(&mut self, _env: &mut Env<'_>) -> Result<RowTable, EngineError> {
        let mut table = Vec::with_capacity(self.rows.len() + 1);
        if let Some(header) = &self.header {
            table.push(header.clone());
        }
        table.extend(self.rows.iter().cloned());
        Ok(table)
    }

    fn metrics_extra(&self) -> serde_json::Value {
        serde_json::json!({ "rows_collated": self.rows.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanflow_core::config::GraphConfig;
    use scanflow_core::plan::QueryPlan;

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

    #[tokio::test]
    async fn accumulates_header_once_and_every_row() {
        let mut plan = QueryPlan::new(GraphConfig::default());
        let src = plan.add_operator(
            "src",
            FeedOnce {
                rows: vec![vec!["a".into(), "b".into()], vec!["1".into(), "2".into()], vec!["3".into(), "4".into()]],
            },
        );
        let sink = plan.add_operator("sink", Collate::new());
        plan.connect(src, sink).unwrap();
        plan.execute().await.unwrap();

        let rows = plan.tuples(sink).await.unwrap();
        assert_eq!(rows, vec![vec!["a".to_string(), "b".to_string()], vec!["1".to_string(), "2".to_string()], vec!["3".to_string(), "4".to_string()]]);
    }

    #[tokio::test]
    async fn snapshotting_an_empty_sink_returns_empty_table() {
        let mut plan = QueryPlan::new(GraphConfig::default());
        let sink = plan.add_operator("sink", Collate::new());
        plan.execute().await.unwrap();
        let rows = plan.tuples(sink).await.unwrap();
        assert!(rows.is_empty());
    }
}
