use crate::bloom::SlicedBloomFilter;
use crate::operator::OperatorId;
use datafusion::arrow::record_batch::RecordBatch;
use std::sync::Arc;

/// A row tuple, either the header (field names) or a data row (raw
/// string field values exactly as the remote scan backend returned
/// them). Whether a given `RowTuple` is a header is determined by
/// position in the stream, not by its own shape: by convention the
/// first tuple an operator receives from a given producer is that
/// producer's header.
pub type RowTuple = Vec<String>;

/// Header row followed by data rows, used for the snapshot handed back
/// by `Collate` to an external caller.
pub type RowTable = Vec<RowTuple>;

/// A borrowing view over a data tuple paired with the header it belongs
/// to, so operators can look fields up by name instead of by position.
pub struct IndexedTuple<'a> {
    header: &'a [String],
    values: &'a [String],
}

impl<'a> IndexedTuple<'a> {
    pub fn new(header: &'a [String], values: &'a [String]) -> Self {
        Self { header, values }
    }

    pub fn field_index(&self, field: &str) -> Option<usize> {
        self.header.iter().position(|f| f == field)
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.field_index(field).and_then(|i| self.values.get(i)).map(String::as_str)
    }
}

/// The data-plane payload moving along an edge.
#[derive(Debug, Clone)]
pub enum Message {
    /// A single row (header or data), the cooperative/low-latency path.
    Tuple(RowTuple),
    /// A columnar batch, the throughput path used by scan and SQL
    /// transform operators.
    Batch(RecordBatch),
    /// A built bloom filter, sent once from `BloomCreate` to every
    /// connected `SQLTableScanBloomUse`.
    Bloom(Arc<SlicedBloomFilter>),
    /// Free-form diagnostic text, printed by sinks, never interpreted.
    Log(String),
}

/// Control-plane signal, distinct from `Message` because it's handled
/// by the graph driver/operator lifecycle rather than by
/// `Operator::on_receive`.
#[derive(Debug, Clone)]
pub enum Control {
    Start,
    ProducerCompleted(OperatorId),
    ConsumerCompleted(OperatorId),
    OperatorCompleted {
        op: OperatorId,
        error: Option<String>,
    },
}

/// What actually travels through a task-parallel operator's mailbox.
#[derive(Debug, Clone)]
pub enum Envelope {
    Control(Control),
    Data { from: OperatorId, messages: Vec<Message> },
}
