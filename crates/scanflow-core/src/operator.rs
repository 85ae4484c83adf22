//! Operator base: the generalized fan-in/fan-out graph node, its
//! completion bookkeeping, and the `Env` handle operators use to send
//! messages and signal completion.
//!
//! Grounded on `operator_base.py`'s `Operator` base class: `connect`,
//! buffered `send`, and the producer/consumer completion default
//! policy, reworked so the graph (not the operator) owns the
//! bookkeeping - Rust has no implementation inheritance, and this
//! graph already requires arbitrary fan-in/fan-out rather than a
//! strictly linear source -> transform -> sink pipeline.

use crate::config::{BufferPolicy, GraphConfig};
use crate::error::{EngineError, PlanError};
use crate::message::{Control, Envelope, Message, RowTable};
use crate::metrics::{Metrics, MetricsSnapshot};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Stable handle for an operator within a `QueryPlan`. Operators never
/// hold a reference (owning or otherwise) to another operator; they
/// only ever hold an `OperatorId` and ask the graph to resolve it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperatorId(pub u32);

/// Coarse role used only for connect-time validation (e.g. `BloomCreate`
/// refusing a consumer that isn't a bloom-use scan, or a join refusing
/// to bind the same producer to both sides).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorKind {
    Generic,
    BloomUseScan,
}

/// Which side of a two-producer operator (today, only `NestedLoopJoin`)
/// a producer is connected to. `None` is used for every ordinary,
/// side-agnostic edge; `connect_left`/`connect_right` on `QueryPlan` are
/// the only callers that pass `Some(_)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// Graph-owned bookkeeping for one operator: its edges, completion
/// state, outbound buffers and metrics. Concrete operators never see
/// this directly; they act through `Env`.
#[derive(Debug)]
pub struct OperatorCore {
    pub id: OperatorId,
    pub name: String,
    pub producers: Vec<OperatorId>,
    pub consumers: Vec<OperatorId>,
    producer_done: HashSet<OperatorId>,
    consumer_done: HashSet<OperatorId>,
    completed: bool,
    buffer_policy: BufferPolicy,
    outbound: HashMap<OperatorId, Vec<Message>>,
    pub metrics: Metrics,
}

impl OperatorCore {
    pub fn new(id: OperatorId, name: impl Into<String>, buffer_policy: BufferPolicy) -> Self {
        Self {
            id,
            name: name.into(),
            producers: Vec::new(),
            consumers: Vec::new(),
            producer_done: HashSet::new(),
            consumer_done: HashSet::new(),
            completed: false,
            buffer_policy,
            outbound: HashMap::new(),
            metrics: Metrics::default(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn all_producers_done(&self) -> bool {
        !self.producers.is_empty() && self.producers.iter().all(|p| self.producer_done.contains(p))
    }

    pub fn all_consumers_done(&self) -> bool {
        !self.consumers.is_empty() && self.consumers.iter().all(|c| self.consumer_done.contains(c))
    }

    pub fn mark_producer_done(&mut self, producer: OperatorId) {
        self.producer_done.insert(producer);
    }

    pub fn mark_consumer_done(&mut self, consumer: OperatorId) {
        self.consumer_done.insert(consumer);
    }

    pub fn snapshot(&self, extra: serde_json::Value) -> MetricsSnapshot {
        MetricsSnapshot {
            name: self.name.clone(),
            elapsed_secs: self.metrics.elapsed().as_secs_f64(),
            rows_in: self.metrics.rows_in,
            rows_out: self.metrics.rows_out,
            batches_in: self.metrics.batches_in,
            batches_out: self.metrics.batches_out,
            extra,
        }
    }

    /// Buffers a message for every connected consumer, returning the
    /// set of consumers whose buffer just crossed the flush threshold.
    /// Mirrors `send`/`do_send`'s per-consumer `__buffers` dict: a
    /// buffer policy of `Immediate` flushes every message, `Count(n)`
    /// flushes once `n` messages have accumulated, `Unbounded` never
    /// flushes early.
    fn buffer(&mut self, message: Message) -> Vec<OperatorId> {
        let mut ready = Vec::new();
        for consumer in self.consumers.clone() {
            let buf = self.outbound.entry(consumer).or_default();
            buf.push(message.clone());
            if self.buffer_policy.should_flush(buf.len()) {
                ready.push(consumer);
            }
        }
        ready
    }

    fn take_buffer(&mut self, consumer: OperatorId) -> Vec<Message> {
        self.outbound.remove(&consumer).unwrap_or_default()
    }

    fn drain_all_buffers(&mut self) -> Vec<(OperatorId, Vec<Message>)> {
        self.outbound.drain().filter(|(_, v)| !v.is_empty()).collect()
    }
}

/// Operator-specific logic. The graph driver owns connection,
/// completion bookkeeping and delivery; an `Operator` implementation
/// only reacts to data and to the two completion hooks.
#[async_trait]
pub trait Operator: Send {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Generic
    }

    /// Non-`None` for producers (today only `BloomCreate`) that refuse a
    /// connection to any consumer whose `kind()` doesn't match. Checked by
    /// `QueryPlan::connect` at graph-assembly time.
    fn required_consumer_kind(&self) -> Option<OperatorKind> {
        None
    }

    /// Called by `QueryPlan::connect*` when `producer` is registered as a
    /// new producer of this operator. The default accepts any number of
    /// side-agnostic producers; `NestedLoopJoin` overrides this to record
    /// which producer is bound to which side and reject a second, distinct
    /// producer on an already-bound side.
    fn bind_producer(&mut self, _producer: OperatorId, _side: Option<Side>) -> Result<(), PlanError> {
        Ok(())
    }

    /// Extra, operator-specific counters folded into the metrics
    /// snapshot (e.g. `BloomCreate`'s `bloom_filter_num_bits_set`).
    fn metrics_extra(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Entry point for operators with no producers (sources): scan
    /// operators issue their remote query here. Reactive operators
    /// (everything with at least one producer) use the default no-op.
    async fn run(&mut self, _env: &mut Env<'_>) -> Result<(), EngineError> {
        Ok(())
    }

    async fn on_receive(&mut self, env: &mut Env<'_>, messages: Vec<Message>, producer: OperatorId) -> Result<(), EngineError>;

    /// Called exactly once, after every producer has signaled
    /// completion and before the driver auto-completes this operator.
    /// Operators that need to flush accumulated state (`Sort`, `Top`,
    /// `NestedLoopJoin`, `BloomCreate`, `Collate`) override this.
    async fn on_drain(&mut self, _env: &mut Env<'_>) -> Result<(), EngineError> {
        Ok(())
    }

    /// Called exactly once, after every consumer has signaled
    /// completion. Lets a producer stop early once nothing downstream
    /// wants more (no operator needs this today, but the hook mirrors
    /// the original's symmetric `on_consumer_completed` default policy).
    async fn on_saturated(&mut self, _env: &mut Env<'_>) -> Result<(), EngineError> {
        Ok(())
    }

    /// Answers `QueryPlan::tuples()`. Only `Collate` overrides this; every
    /// other operator returns an empty table, matching the original's
    /// `Eval("self.local_tuples()")` being meaningful only at a sink.
    async fn on_snapshot(&mut self, _env: &mut Env<'_>) -> Result<RowTable, EngineError> {
        Ok(Vec::new())
    }
}

/// Delivers buffered sends and completion signals to other operators.
/// `Env` is transport-agnostic; only the dispatcher differs between
/// `Transport::Cooperative` and `Transport::TaskParallel`.
pub enum Dispatch {
    Cooperative(Arc<Mutex<std::collections::VecDeque<Job>>>),
    TaskParallel {
        mailboxes: Arc<HashMap<OperatorId, mpsc::Sender<Envelope>>>,
        completion_tx: mpsc::UnboundedSender<Control>,
    },
}

/// Unit of work in the cooperative transport's trampoline. Standing in
/// for the original's literal recursive `switch_context` call: instead
/// of nesting call frames, the driver pops one `Job` at a time and the
/// timer invariant is enforced at that boundary (stop the previous
/// job's operator, start this job's) rather than at a call boundary.
#[derive(Debug, Clone)]
pub enum Job {
    Start(OperatorId),
    Deliver { to: OperatorId, from: OperatorId, messages: Vec<Message> },
    ProducerCompleted { to: OperatorId, producer: OperatorId },
    ConsumerCompleted { to: OperatorId, consumer: OperatorId },
}

pub struct Env<'a> {
    id: OperatorId,
    core: &'a mut OperatorCore,
    dispatch: &'a Dispatch,
    pub config: &'a GraphConfig,
}

impl<'a> Env<'a> {
    pub fn new(id: OperatorId, core: &'a mut OperatorCore, dispatch: &'a Dispatch, config: &'a GraphConfig) -> Self {
        Self { id, core, dispatch, config }
    }

    pub fn id(&self) -> OperatorId {
        self.id
    }

    pub fn core(&self) -> &OperatorCore {
        self.core
    }

    pub fn core_mut(&mut self) -> &mut OperatorCore {
        self.core
    }

    pub fn is_completed(&self) -> bool {
        self.core.is_completed()
    }

    /// Buffers `messages` for every connected consumer and flushes any
    /// buffer that just crossed its threshold.
    pub async fn send(&mut self, messages: Vec<Message>) -> Result<(), EngineError> {
        for m in messages {
            self.core.metrics.rows_out += matches!(m, Message::Tuple(_)) as u64;
            self.core.metrics.batches_out += matches!(m, Message::Batch(_)) as u64;
            let ready = self.core.buffer(m);
            for consumer in ready {
                self.flush_to(consumer).await?;
            }
        }
        Ok(())
    }

    /// Forces out every consumer's buffer regardless of threshold.
    /// Called by `complete()` so nothing is left stranded.
    pub async fn flush(&mut self) -> Result<(), EngineError> {
        let consumers = self.core.consumers.clone();
        for consumer in consumers {
            self.flush_to(consumer).await?;
        }
        Ok(())
    }

    async fn flush_to(&mut self, consumer: OperatorId) -> Result<(), EngineError> {
        let batch = self.core.take_buffer(consumer);
        if batch.is_empty() {
            return Ok(());
        }
        self.deliver(consumer, batch).await
    }

    async fn deliver(&self, to: OperatorId, messages: Vec<Message>) -> Result<(), EngineError> {
        match self.dispatch {
            Dispatch::Cooperative(queue) => {
                queue
                    .lock()
                    .map_err(|_| EngineError::internal("cooperative queue poisoned"))?
                    .push_back(Job::Deliver { to, from: self.id, messages });
                Ok(())
            }
            Dispatch::TaskParallel { mailboxes, .. } => {
                let tx = mailboxes
                    .get(&to)
                    .ok_or_else(|| EngineError::internal(format!("no mailbox for {to:?}")))?;
                tx.send(Envelope::Data { from: self.id, messages })
                    .await
                    .map_err(|_| EngineError::internal(format!("mailbox for {to:?} closed")))
            }
        }
    }

    /// Full `complete()` sequence: flush outstanding buffers, signal
    /// `ConsumerCompleted` to every producer and `ProducerCompleted` to
    /// every consumer, then report back to the plan driver. Calling this
    /// twice is a caller bug (mirrors the original raising "Cannot
    /// complete an already completed operator").
    pub async fn complete(&mut self) -> Result<(), EngineError> {
        if self.core.completed {
            return Err(EngineError::internal(format!(
                "operator '{}' completed twice",
                self.core.name
            )));
        }
        self.flush().await?;
        self.core.completed = true;

        let producers = self.core.producers.clone();
        let consumers = self.core.consumers.clone();
        for p in producers {
            self.signal(p, Control::ConsumerCompleted(self.id)).await?;
        }
        for c in consumers {
            self.signal(c, Control::ProducerCompleted(self.id)).await?;
        }
        self.signal_completion(None).await
    }

    pub async fn fail(&mut self, error: EngineError) -> Result<(), EngineError> {
        self.signal_completion(Some(error.to_string())).await
    }

    async fn signal(&self, to: OperatorId, control: Control) -> Result<(), EngineError> {
        match self.dispatch {
            Dispatch::Cooperative(queue) => {
                let job = match control {
                    Control::ProducerCompleted(p) => Job::ProducerCompleted { to, producer: p },
                    Control::ConsumerCompleted(c) => Job::ConsumerCompleted { to, consumer: c },
                    other => return Err(EngineError::internal(format!("unexpected control signal {other:?} routed to an operator"))),
                };
                queue
                    .lock()
                    .map_err(|_| EngineError::internal("cooperative queue poisoned"))?
                    .push_back(job);
                Ok(())
            }
            Dispatch::TaskParallel { mailboxes, .. } => {
                let tx = mailboxes
                    .get(&to)
                    .ok_or_else(|| EngineError::internal(format!("no mailbox for {to:?}")))?;
                tx.send(Envelope::Control(control))
                    .await
                    .map_err(|_| EngineError::internal(format!("mailbox for {to:?} closed")))
            }
        }
    }

    async fn signal_completion(&self, error: Option<String>) -> Result<(), EngineError> {
        match self.dispatch {
            Dispatch::Cooperative(_) => Ok(()), // the cooperative driver observes completion synchronously via core.is_completed()
            Dispatch::TaskParallel { completion_tx, .. } => completion_tx
                .send(Control::OperatorCompleted { op: self.id, error })
                .map_err(|_| EngineError::internal("completion channel closed")),
        }
    }
}
