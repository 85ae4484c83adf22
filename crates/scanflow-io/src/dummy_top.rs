//! `DummyTop`: delegates the entire sampled top-K computation to an
//! out-of-process compute-offload worker instead of running it
//! in-process like `TopKTableScan`. Grounded on `s3filter/op/top.py`'s
//! `DummyTop`, which invokes a Lambda function and streams back its
//! response; this crate models the worker as a pluggable
//! `ComputeOffloadClient` rather than a hardwired `boto3` client.

use crate::remote::{ComputeOffloadClient, ComputeOffloadRequest};
use async_trait::async_trait;
use scanflow_core::error::EngineError;
use scanflow_core::message::{Message, RowTuple};
use scanflow_core::operator::{Env, Operator, OperatorId};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct DummyTopConfig {
    pub path: String,
    pub table_first_part: String,
    pub table_parts: usize,
    pub k: usize,
    pub sort_order: String,
    pub sort_field: String,
    pub sample_size: usize,
    pub queried_columns: Vec<String>,
}

/// A source operator whose entire execution is one round-trip to a
/// compute-offload worker: it ships the query's shape as JSON and
/// streams back whatever rows the worker decided were the top-K.
pub struct DummyTop {
    name: String,
    client: Arc<dyn ComputeOffloadClient>,
    config: DummyTopConfig,
    rows_returned: u64,
}

impl DummyTop {
    pub fn new(name: impl Into<String>, client: Arc<dyn ComputeOffloadClient>, config: DummyTopConfig) -> Self {
        Self {
            name: name.into(),
            client,
            config,
            rows_returned: 0,
        }
    }
}

#[async_trait]
impl Operator for DummyTop {
    async fn run(&mut self, env: &mut Env<'_>) -> Result<(), EngineError> {
        let request = ComputeOffloadRequest {
            path: self.config.path.clone(),
            table_first_part: self.config.table_first_part.clone(),
            table_parts: self.config.table_parts,
            k: self.config.k,
            sort_order: self.config.sort_order.clone(),
            sort_field: self.config.sort_field.clone(),
            sample_size: self.config.sample_size,
            queried_columns: self.config.queried_columns.clone(),
        };

        info!(operator = %self.name, path = %self.config.path, k = self.config.k, "dummy_top: invoking compute-offload worker");
        let response = self.client.invoke(request).await?;

        if response.status_code != 200 {
            return Err(EngineError::Remote(format!(
                "compute-offload worker for '{}' returned status {}",
                self.name, response.status_code
            )));
        }

        if response.body.data.is_empty() {
            warn!(operator = %self.name, "compute-offload worker returned no rows");
        } else {
            let header: RowTuple = self.config.queried_columns.clone();
            env.send(vec![Message::Tuple(header.clone())]).await?;
            for record in response.body.data {
                let row: RowTuple = header.iter().map(|col| record.get(col).map(json_value_to_string).unwrap_or_default()).collect();
                self.rows_returned += 1;
                env.send(vec![Message::Tuple(row)]).await?;
            }
        }

        info!(operator = %self.name, rows = self.rows_returned, metrics = %response.body.metrics, "dummy_top: completed");
        env.complete().await
    }

    async fn on_receive(&mut self, _env: &mut Env<'_>, _messages: Vec<Message>, _producer: OperatorId) -> Result<(), EngineError> {
        Err(EngineError::schema(&self.name, "DummyTop is a source and has no producers"))
    }

    fn metrics_extra(&self) -> serde_json::Value {
        serde_json::json!({ "rows_returned": self.rows_returned })
    }
}

fn json_value_to_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ComputeOffloadResponse;
    use scanflow_core::config::GraphConfig;
    use scanflow_core::plan::QueryPlan;

    struct FakeOffloadClient;

    #[async_trait]
    impl ComputeOffloadClient for FakeOffloadClient {
        async fn invoke(&self, request: ComputeOffloadRequest) -> Result<ComputeOffloadResponse, EngineError> {
            assert_eq!(request.k, 3);
            let mut rows = Vec::new();
            for i in 0..3 {
                let mut row = serde_json::Map::new();
                row.insert("price".to_string(), serde_json::json!(1000 - i));
                rows.push(row);
            }
            Ok(ComputeOffloadResponse {
                status_code: 200,
                body: crate::remote::ComputeOffloadBody {
                    data: rows,
                    metrics: serde_json::json!({ "lambda_duration_ms": 42 }),
                },
            })
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
    async fn streams_rows_returned_by_the_offload_worker() {
        let client = Arc::new(FakeOffloadClient);
        let config = DummyTopConfig {
            path: "orders".into(),
            table_first_part: "orders.0".into(),
            table_parts: 4,
            k: 3,
            sort_order: "DESC".into(),
            sort_field: "price".into(),
            sample_size: 30,
            queried_columns: vec!["price".into()],
        };

        let mut plan = QueryPlan::new(GraphConfig::default());
        let dummy = plan.add_operator("dummy", DummyTop::new("dummy", client, config));
        let sink = plan.add_operator("sink", Capture { rows: Vec::new() });
        plan.connect(dummy, sink).unwrap();
        plan.execute().await.unwrap();

        let rows = plan.tuples(sink).await.unwrap();
        assert_eq!(rows[0], vec!["price".to_string()]);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[1][0], "1000");
    }
}
