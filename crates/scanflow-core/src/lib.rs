//! Graph runtime, message/operator primitives, the sliced bloom filter
//! and shared config/error types for the scanflow pushdown query engine.
//!
//! This crate has no notion of SQL dialects, remote object stores or
//! concrete operators beyond the generic `Operator` trait - those live in
//! `scanflow-tx` (in-memory transforms) and `scanflow-io` (operators that
//! talk to a `RemoteScanClient`).

pub mod bloom;
pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod operator;
pub mod plan;
pub mod scalar;

pub use bloom::SlicedBloomFilter;
pub use config::{BufferPolicy, GraphConfig, Transport};
pub use error::{EngineError, PlanError};
pub use message::{Control, Envelope, IndexedTuple, Message, RowTable, RowTuple};
pub use metrics::{Metrics, MetricsSnapshot};
pub use operator::{Dispatch, Env, Job, Operator, OperatorCore, OperatorId, OperatorKind, Side};
pub use plan::QueryPlan;
pub use scalar::{ColType, ScalarValue};
