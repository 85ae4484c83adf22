//! Builds a `SlicedBloomFilter` from one field of every row it
//! receives, broadcasting the finished filter once its producer
//! completes. Grounded on `s3filter/op/bloom_create.py`'s `BloomCreate`.
//!
//! The original negotiates its false-positive rate at completion time
//! by reaching into `self.consumers` for the connected
//! `SQLTableScanBloomUse`'s SQL string length. Operators here never
//! hold references to their peers, so the equivalent budget
//! (`max_downstream_template_len`, the longest base SQL template any
//! connected bloom-use scan will substitute the filter's predicate
//! into) is supplied explicitly by the caller assembling the graph, who
//! already knows both operators' configuration.

use async_trait::async_trait;
use scanflow_core::bloom::SlicedBloomFilter;
use scanflow_core::error::EngineError;
use scanflow_core::message::{IndexedTuple, Message, RowTuple};
use scanflow_core::operator::{Env, Operator, OperatorId, OperatorKind};
use std::sync::Arc;
use tracing::warn;

pub struct BloomCreate {
    name: String,
    bloom_field_name: String,
    fp_rate: f64,
    max_downstream_template_len: usize,
    header: Option<RowTuple>,
    values: Vec<i64>,
    tuple_count: usize,
    bloom_capacity: usize,
    bloom_fp_rate: f64,
    bloom_num_slices: usize,
    bloom_num_bits_per_slice: usize,
    bloom_num_bits_set: usize,
}

impl BloomCreate {
    pub const DEFAULT_FP_RATE: f64 = 0.3;

    pub fn new(name: impl Into<String>, bloom_field_name: impl Into<String>, max_downstream_template_len: usize) -> Self {
        Self::with_fp_rate(name, bloom_field_name, max_downstream_template_len, Self::DEFAULT_FP_RATE)
    }

    pub fn with_fp_rate(name: impl Into<String>, bloom_field_name: impl Into<String>, max_downstream_template_len: usize, fp_rate: f64) -> Self {
        Self {
            name: name.into(),
            bloom_field_name: bloom_field_name.into(),
            fp_rate,
            max_downstream_template_len,
            header: None,
            values: Vec::new(),
            tuple_count: 0,
            bloom_capacity: 0,
            bloom_fp_rate: 0.0,
            bloom_num_slices: 0,
            bloom_num_bits_per_slice: 0,
            bloom_num_bits_set: 0,
        }
    }
}

#[async_trait]
impl Operator for BloomCreate {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Generic
    }

    fn required_consumer_kind(&self) -> Option<OperatorKind> {
        Some(OperatorKind::BloomUseScan)
    }

    async fn on_receive(&mut self, _env: &mut Env<'_>, messages: Vec<Message>, _producer: OperatorId) -> Result<(), EngineError> {
        for message in messages {
            let row = match message {
                Message::Tuple(row) => row,
                other => return Err(EngineError::schema(&self.name, format!("unexpected message {other:?}"))),
            };
            if self.header.is_none() {
                if !row.iter().any(|f| f == &self.bloom_field_name) {
                    return Err(EngineError::schema(
                        &self.name,
                        format!("header {row:?} does not contain bloom field '{}'", self.bloom_field_name),
                    ));
                }
                self.header = Some(row);
            } else {
                let header = self.header.clone().expect("checked above");
                let indexed = IndexedTuple::new(&header, &row);
                let raw = indexed
                    .get(&self.bloom_field_name)
                    .ok_or_else(|| EngineError::schema(&self.name, format!("row missing field '{}'", self.bloom_field_name)))?;
                let value = raw
                    .parse::<i64>()
                    .map_err(|e| EngineError::schema(&self.name, format!("bloom field '{raw}' is not an int: {e}")))?;
                self.values.push(value);
            }
        }
        Ok(())
    }

    async fn on_drain(&mut self, env: &mut Env<'_>) -> Result<(), EngineError> {
        self.tuple_count = self.values.len();
        if self.values.is_empty() {
            return Ok(());
        }

        let column_expr = format!("CAST({} AS INT)", self.bloom_field_name);
        let best_possible = SlicedBloomFilter::best_achievable_fp_rate(self.values.len(), self.max_downstream_template_len, &column_expr);

        let fp_rate = if best_possible > self.fp_rate {
            warn!(
                operator = %self.name,
                configured = self.fp_rate,
                best_possible,
                "bloom filter fp rate too low for the downstream SQL expression budget, widening"
            );
            best_possible
        } else {
            self.fp_rate
        };

        let mut filter = SlicedBloomFilter::new(self.values.len(), fp_rate);
        for v in std::mem::take(&mut self.values) {
            filter.add(v);
        }

        // snapshot the filter's stats before handing it off - `metrics_extra` is
        // read only after the graph quiesces, long after `filter` has moved.
        self.bloom_capacity = filter.capacity();
        self.bloom_fp_rate = filter.fp_rate();
        self.bloom_num_slices = filter.num_slices();
        self.bloom_num_bits_per_slice = filter.bits_per_slice();
        self.bloom_num_bits_set = filter.len();

        env.send(vec![Message::Bloom(Arc::new(filter))]).await?;
        Ok(())
    }

    fn metrics_extra(&self) -> serde_json::Value {
        serde_json::json!({
            "tuple_count": self.tuple_count,
            "bloom_filter_capacity": self.bloom_capacity,
            "bloom_filter_fp_rate": self.bloom_fp_rate,
            "bloom_filter_num_slices": self.bloom_num_slices,
            "bloom_filter_num_bits_per_slice": self.bloom_num_bits_per_slice,
            "bloom_filter_num_bits_set": self.bloom_num_bits_set,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
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

    /// `QueryPlan` doesn't expose a generic downcast, so the sink hands
    /// its captured filter out through a shared cell instead of relying
    /// on the test reaching back into the operator after `execute()`.
    struct CaptureBloom {
        slot: Arc<std::sync::Mutex<Option<Arc<SlicedBloomFilter>>>>,
    }

    #[async_trait]
    impl Operator for CaptureBloom {
        fn kind(&self) -> OperatorKind {
            OperatorKind::BloomUseScan
        }

        async fn on_receive(&mut self, _env: &mut Env<'_>, messages: Vec<Message>, _producer: OperatorId) -> Result<(), EngineError> {
            for m in messages {
                if let Message::Bloom(f) = m {
                    *self.slot.lock().unwrap() = Some(f);
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn builds_and_broadcasts_filter_containing_every_value() {
        let mut plan = QueryPlan::new(GraphConfig::default());
        let src = plan.add_operator(
            "src",
            FeedOnce {
                rows: vec![
                    vec!["l_orderkey".into()],
                    vec!["1".into()],
                    vec!["2".into()],
                    vec!["3".into()],
                ],
            },
        );
        let bloom = plan.add_operator("bloom", BloomCreate::new("bloom", "l_orderkey", 8192));
        let slot: Arc<std::sync::Mutex<Option<Arc<SlicedBloomFilter>>>> = Arc::new(std::sync::Mutex::new(None));
        let sink = plan.add_operator("sink", CaptureBloom { slot: slot.clone() });
        plan.connect(src, bloom).unwrap();
        plan.connect(bloom, sink).unwrap();
        plan.execute().await.unwrap();

        let captured = slot.lock().unwrap().clone().expect("bloom filter was broadcast");
        assert!(captured.contains(1));
        assert!(captured.contains(2));
        assert!(captured.contains(3));
    }
}
