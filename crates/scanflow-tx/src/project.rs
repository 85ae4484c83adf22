//! Scalar projection, grounded on the original's `Project` operator
//! (not retrieved in `original_source/`, but referenced throughout
//! `top.py`/`sql_table_scan.py` as the operator that narrows a scan's
//! columns down to what downstream actually needs) and on `rde_tx`'s
//! `SqlTransform` for the batch-transform idiom.

use async_trait::async_trait;
use scanflow_core::error::EngineError;
use scanflow_core::message::{IndexedTuple, Message, RowTuple};
use scanflow_core::operator::{Env, Operator, OperatorId};
use std::sync::Arc;
use tracing::debug;

/// A single scalar expression: evaluated against one data row (via its
/// header), producing one output value under `output_name`.
#[derive(Clone)]
pub struct ProjectExpr {
    pub output_name: String,
    eval: Arc<dyn Fn(&IndexedTuple) -> Result<String, EngineError> + Send + Sync>,
}

impl ProjectExpr {
    pub fn new(
        output_name: impl Into<String>,
        eval: impl Fn(&IndexedTuple) -> Result<String, EngineError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            output_name: output_name.into(),
            eval: Arc::new(eval),
        }
    }

    /// Shorthand for the common case: pass an input column through
    /// unchanged under a (possibly renamed) output name.
    pub fn column(input_name: impl Into<String>, output_name: impl Into<String>) -> Self {
        let input_name = input_name.into();
        Self::new(output_name, move |row| {
            row.get(&input_name)
                .map(str::to_string)
                .ok_or_else(|| EngineError::schema("project", format!("no column '{input_name}' in input row")))
        })
    }
}

type BatchTransform = Arc<dyn Fn(&datafusion::arrow::record_batch::RecordBatch) -> Result<datafusion::arrow::record_batch::RecordBatch, EngineError> + Send + Sync>;

/// Applies a fixed list of scalar expressions to every row (tuple mode)
/// or a user-supplied transform to every batch (batch mode). Side-effect
/// free: the same input always produces the same output.
pub struct Project {
    name: String,
    exprs: Vec<ProjectExpr>,
    batch_transform: Option<BatchTransform>,
    input_header: Option<RowTuple>,
}

impl Project {
    pub fn new(name: impl Into<String>, exprs: Vec<ProjectExpr>) -> Self {
        Self {
            name: name.into(),
            exprs,
            batch_transform: None,
            input_header: None,
        }
    }

    pub fn with_batch_transform(mut self, transform: BatchTransform) -> Self {
        self.batch_transform = Some(transform);
        self
    }

    fn output_header(&self) -> RowTuple {
        self.exprs.iter().map(|e| e.output_name.clone()).collect()
    }

    fn project_row(&self, header: &[String], row: &[String]) -> Result<RowTuple, EngineError> {
        let indexed = IndexedTuple::new(header, row);
        self.exprs.iter().map(|e| (e.eval)(&indexed)).collect()
    }
}

#[async_trait]
impl Operator for Project {
    async fn on_receive(&mut self, env: &mut Env<'_>, messages: Vec<Message>, _producer: OperatorId) -> Result<(), EngineError> {
        for message in messages {
            match message {
                Message::Tuple(row) => {
                    if self.input_header.is_none() {
                        debug!(operator = %self.name, header = ?row, "project: captured input header");
                        self.input_header = Some(row);
                        env.send(vec![Message::Tuple(self.output_header())]).await?;
                    } else {
                        let header = self.input_header.as_ref().expect("checked above");
                        let projected = self.project_row(header, &row)?;
                        env.send(vec![Message::Tuple(projected)]).await?;
                    }
                }
                Message::Batch(batch) => {
                    let transform = self
                        .batch_transform
                        .as_ref()
                        .ok_or_else(|| EngineError::schema(&self.name, "received a batch with no batch_transform configured"))?;
                    let projected = transform(&batch)?;
                    env.send(vec![Message::Batch(projected)]).await?;
                }
                other => env.send(vec![other]).await?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanflow_core::config::GraphConfig;
    use scanflow_core::plan::QueryPlan;

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
    async fn projects_rows_and_renames_header() {
        let mut plan = QueryPlan::new(GraphConfig::default());
        let src = plan.add_operator(
            "src",
            FeedOnce {
                rows: vec![
                    vec!["l_orderkey".into(), "l_extendedprice".into()],
                    vec!["1".into(), "1500.0".into()],
                ],
            },
        );
        let project = plan.add_operator(
            "project",
            Project::new(
                "project",
                vec![ProjectExpr::column("l_orderkey", "order_id"), ProjectExpr::column("l_extendedprice", "price")],
            ),
        );
        let sink = plan.add_operator("sink", Capture { rows: Vec::new() });
        plan.connect(src, project).unwrap();
        plan.connect(project, sink).unwrap();
        plan.execute().await.unwrap();
        let rows = plan.tuples(sink).await.unwrap();
        assert_eq!(rows[0], vec!["order_id".to_string(), "price".to_string()]);
        assert_eq!(rows[1], vec!["1".to_string(), "1500.0".to_string()]);
    }
}
