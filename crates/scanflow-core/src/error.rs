use crate::operator::OperatorId;

/// The engine's error taxonomy.
///
/// `OverflowError` is deliberately non-fatal: callers that hit it (today
/// only `BloomCreate`, when a configured false-positive rate can't fit the
/// remote expression-length budget) are expected to log a warning and
/// widen the rate rather than propagate the error up the graph.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("schema error in operator '{op}': {reason}")]
    Schema { op: String, reason: String },

    #[error("remote scan error: {0}")]
    Remote(String),

    #[error("overflow: {0}")]
    Overflow(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn schema(op: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::Schema {
            op: op.into(),
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        EngineError::Internal(reason.into())
    }

    /// True for errors an operator may recover from by widening a
    /// configured parameter instead of failing the whole plan.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineError::Overflow(_))
    }
}

/// Raised when a graph-assembly invariant is violated (duplicate edges,
/// binding the same producer to both join sides, connecting a non
/// bloom-use consumer to `BloomCreate`, ...). Kept distinct from
/// `EngineError` because these are caught at plan-build time, never at
/// run time, and always indicate a caller bug rather than a data
/// condition.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("operator '{0}' already has a producer bound to slot '{1}'")]
    DuplicateBinding(String, &'static str),

    #[error("operator {0:?} cannot be added as both left and right producer of a join")]
    AmbiguousJoinSide(OperatorId),

    #[error("duplicate edge: operator {0:?} is already connected to {1:?}")]
    DuplicateEdge(OperatorId, OperatorId),

    #[error("{consumer:?} rejected connection from {producer:?}: {reason}")]
    RejectedConnection {
        producer: OperatorId,
        consumer: OperatorId,
        reason: String,
    },

    #[error("operator {0:?} was already completed")]
    AlreadyCompleted(OperatorId),

    #[error("unknown operator {0:?}")]
    UnknownOperator(OperatorId),
}
