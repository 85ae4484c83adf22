//! `QueryPlan`: owns every operator in a graph by `OperatorId`, builds
//! edges at assembly time, and drives execution under one of the two
//! transports in `Transport`.
//!
//! Grounded on `operator_base.py`'s `run()`/`start()` split (synchronous
//! inline call vs. a queued/worker dispatch) for the two-transport split,
//! and on a per-edge-channel + `tokio::spawn` pattern for the
//! task-parallel transport.

use crate::config::GraphConfig;
use crate::error::{EngineError, PlanError};
use crate::message::{Control, Envelope, Message, RowTable};
use crate::metrics::MetricsSnapshot;
use crate::operator::{Dispatch, Env, Job, Operator, OperatorCore, OperatorId, Side};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// A graph of operators, owned exclusively by this plan. Operators never
/// hold references (owning or otherwise) to peers; they address each
/// other only through the `OperatorId`s `QueryPlan` hands back.
pub struct QueryPlan {
    config: Arc<GraphConfig>,
    next_id: u32,
    operators: HashMap<OperatorId, (Box<dyn Operator>, OperatorCore)>,
    /// Assembly order, kept only so `describe()` prints operators in the
    /// order they were added rather than in arbitrary hash order.
    order: Vec<OperatorId>,
}

impl QueryPlan {
    pub fn new(config: GraphConfig) -> Self {
        Self {
            config: Arc::new(config),
            next_id: 0,
            operators: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Registers a new operator under the plan's active buffer policy.
    /// Returns the stable `OperatorId` callers use for every subsequent
    /// `connect`/`connect_left`/`connect_right` call.
    pub fn add_operator(&mut self, name: impl Into<String>, op: impl Operator + 'static) -> OperatorId {
        let id = OperatorId(self.next_id);
        self.next_id += 1;
        let core = OperatorCore::new(id, name, self.config.buffer_policy);
        self.operators.insert(id, (Box::new(op), core));
        self.order.push(id);
        id
    }

    fn connect_inner(&mut self, producer: OperatorId, consumer: OperatorId, side: Option<Side>) -> Result<(), PlanError> {
        let producer_name = self
            .operators
            .get(&producer)
            .ok_or(PlanError::UnknownOperator(producer))?
            .1
            .name
            .clone();
        let required_kind = self
            .operators
            .get(&producer)
            .ok_or(PlanError::UnknownOperator(producer))?
            .0
            .required_consumer_kind();

        {
            let (consumer_op, consumer_core) = self
                .operators
                .get_mut(&consumer)
                .ok_or(PlanError::UnknownOperator(consumer))?;
            if consumer_core.producers.contains(&producer) {
                return Err(PlanError::DuplicateEdge(producer, consumer));
            }
            if let Some(required) = required_kind {
                if consumer_op.kind() != required {
                    return Err(PlanError::RejectedConnection {
                        producer,
                        consumer,
                        reason: format!(
                            "'{}' requires a consumer of kind {:?}, got {:?}",
                            producer_name,
                            required,
                            consumer_op.kind()
                        ),
                    });
                }
            }
            consumer_op.bind_producer(producer, side)?;
            consumer_core.producers.push(producer);
        }

        let (_, producer_core) = self.operators.get_mut(&producer).ok_or(PlanError::UnknownOperator(producer))?;
        if producer_core.consumers.contains(&consumer) {
            return Err(PlanError::DuplicateEdge(producer, consumer));
        }
        producer_core.consumers.push(consumer);
        Ok(())
    }

    /// Registers a side-agnostic directed edge `producer -> consumer`.
    pub fn connect(&mut self, producer: OperatorId, consumer: OperatorId) -> Result<(), PlanError> {
        self.connect_inner(producer, consumer, None)
    }

    /// Registers `producer` as the left producer of a two-producer
    /// operator (today only `NestedLoopJoin`).
    pub fn connect_left(&mut self, producer: OperatorId, consumer: OperatorId) -> Result<(), PlanError> {
        self.connect_inner(producer, consumer, Some(Side::Left))
    }

    /// Registers `producer` as the right producer of a two-producer
    /// operator (today only `NestedLoopJoin`).
    pub fn connect_right(&mut self, producer: OperatorId, consumer: OperatorId) -> Result<(), PlanError> {
        self.connect_inner(producer, consumer, Some(Side::Right))
    }

    /// Runs the graph to quiescence under the configured transport.
    pub async fn execute(&mut self) -> Result<(), EngineError> {
        match self.config.transport {
            crate::config::Transport::Cooperative => self.run_cooperative().await,
            crate::config::Transport::TaskParallel => self.run_task_parallel().await,
        }
    }

    fn source_ids(&self) -> Vec<OperatorId> {
        self.order
            .iter()
            .copied()
            .filter(|id| self.operators[id].1.producers.is_empty())
            .collect()
    }

    async fn run_cooperative(&mut self) -> Result<(), EngineError> {
        let queue: Arc<Mutex<VecDeque<Job>>> = Arc::new(Mutex::new(VecDeque::new()));
        let dispatch = Dispatch::Cooperative(queue.clone());

        {
            let mut q = queue.lock().map_err(|_| EngineError::internal("cooperative queue poisoned"))?;
            for id in self.source_ids() {
                q.push_back(Job::Start(id));
            }
        }

        loop {
            let job = {
                let mut q = queue.lock().map_err(|_| EngineError::internal("cooperative queue poisoned"))?;
                q.pop_front()
            };
            let job = match job {
                Some(j) => j,
                None => break,
            };

            match job {
                Job::Start(id) => {
                    let (op, core) = self
                        .operators
                        .get_mut(&id)
                        .ok_or_else(|| EngineError::internal(format!("unknown operator {id:?}")))?;
                    let mut env = Env::new(id, core, &dispatch, &self.config);
                    env.core_mut().metrics.start();
                    let res = op.run(&mut env).await;
                    env.core_mut().metrics.stop();
                    res?;
                }
                Job::Deliver { to, from, messages } => {
                    let (op, core) = self
                        .operators
                        .get_mut(&to)
                        .ok_or_else(|| EngineError::internal(format!("unknown operator {to:?}")))?;
                    if core.is_completed() {
                        // Once completed, an operator emits no further data and accepts none either.
                        continue;
                    }
                    count_inbound(core, &messages);
                    let mut env = Env::new(to, core, &dispatch, &self.config);
                    env.core_mut().metrics.start();
                    let res = op.on_receive(&mut env, messages, from).await;
                    env.core_mut().metrics.stop();
                    res?;
                }
                Job::ProducerCompleted { to, producer } => {
                    let (op, core) = self
                        .operators
                        .get_mut(&to)
                        .ok_or_else(|| EngineError::internal(format!("unknown operator {to:?}")))?;
                    core.mark_producer_done(producer);
                    if core.all_producers_done() && !core.is_completed() {
                        let mut env = Env::new(to, core, &dispatch, &self.config);
                        env.core_mut().metrics.start();
                        let res = drain_then_complete(op.as_mut(), &mut env).await;
                        env.core_mut().metrics.stop();
                        res?;
                    }
                }
                Job::ConsumerCompleted { to, consumer } => {
                    let (op, core) = self
                        .operators
                        .get_mut(&to)
                        .ok_or_else(|| EngineError::internal(format!("unknown operator {to:?}")))?;
                    core.mark_consumer_done(consumer);
                    if core.all_consumers_done() && !core.is_completed() {
                        let mut env = Env::new(to, core, &dispatch, &self.config);
                        env.core_mut().metrics.start();
                        let res = saturate_then_complete(op.as_mut(), &mut env).await;
                        env.core_mut().metrics.stop();
                        res?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_task_parallel(&mut self) -> Result<(), EngineError> {
        let ids = self.order.clone();
        let source_ids = self.source_ids();

        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for &id in &ids {
            let (tx, rx) = mpsc::channel::<Envelope>(self.config.mailbox_capacity);
            senders.insert(id, tx);
            receivers.insert(id, rx);
        }
        let mailboxes = Arc::new(senders);
        let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<Control>();

        let mut handles = Vec::new();
        for &id in &ids {
            let (op, core) = self.operators.remove(&id).expect("operator present for its own id");
            let rx = receivers.remove(&id).expect("mailbox receiver present for its own id");
            let dispatch = Dispatch::TaskParallel {
                mailboxes: mailboxes.clone(),
                completion_tx: completion_tx.clone(),
            };
            let config = self.config.clone();
            handles.push(tokio::spawn(operator_worker(id, op, core, rx, dispatch, config)));
        }
        drop(completion_tx);

        for src in source_ids {
            mailboxes
                .get(&src)
                .expect("mailbox present for every operator id")
                .send(Envelope::Control(Control::Start))
                .await
                .map_err(|_| EngineError::internal(format!("failed to start source operator {src:?}")))?;
        }

        let total = ids.len();
        let mut done = HashSet::new();
        let mut first_error: Option<String> = None;
        while done.len() < total {
            match completion_rx.recv().await {
                Some(Control::OperatorCompleted { op, error }) => {
                    if let Some(e) = error {
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                    done.insert(op);
                }
                Some(_) => {}
                None => break,
            }
        }
        // Dropping the mailboxes closes every worker's inbound channel, so
        // a worker still waiting on `rx.recv()` (nothing left to deliver)
        // unblocks and exits even if it never itself called `complete()`.
        drop(mailboxes);

        for handle in handles {
            let (id, op, core) = handle
                .await
                .map_err(|e| EngineError::internal(format!("operator task panicked: {e}")))?;
            self.operators.insert(id, (op, core));
        }

        if let Some(e) = first_error {
            return Err(EngineError::Other(anyhow::anyhow!(e)));
        }
        Ok(())
    }

    /// Blocks for the accumulated rows at a `Collate` sink. Meant to be
    /// called after `execute()` returns, once the graph has quiesced and
    /// every operator (including the sink) is back under the plan's
    /// ownership - see DESIGN.md for why this supersedes the original's
    /// mid-run `Eval`/`Evaluated` round trip.
    pub async fn tuples(&mut self, collate: OperatorId) -> Result<RowTable, EngineError> {
        let (op, core) = self
            .operators
            .get_mut(&collate)
            .ok_or_else(|| EngineError::internal(format!("unknown operator {collate:?}")))?;
        let dispatch = Dispatch::Cooperative(Arc::new(Mutex::new(VecDeque::new())));
        let mut env = Env::new(collate, core, &dispatch, &self.config);
        op.on_snapshot(&mut env).await
    }

    pub fn metrics(&self) -> Vec<MetricsSnapshot> {
        self.order
            .iter()
            .map(|id| {
                let (op, core) = &self.operators[id];
                core.snapshot(op.metrics_extra())
            })
            .collect()
    }

    /// Diagnostic adjacency summary. Rendering it is out of scope; this
    /// is the data a caller would feed to `write_graph`-style tooling.
    pub fn describe(&self) -> serde_json::Value {
        let nodes: Vec<serde_json::Value> = self
            .order
            .iter()
            .map(|id| {
                let (_, core) = &self.operators[id];
                serde_json::json!({
                    "id": id.0,
                    "name": core.name,
                    "producers": core.producers.iter().map(|p| p.0).collect::<Vec<_>>(),
                    "consumers": core.consumers.iter().map(|c| c.0).collect::<Vec<_>>(),
                })
            })
            .collect();
        serde_json::json!({ "operators": nodes })
    }
}

fn count_inbound(core: &mut OperatorCore, messages: &[Message]) {
    core.metrics.rows_in += messages.iter().filter(|m| matches!(m, Message::Tuple(_))).count() as u64;
    core.metrics.batches_in += messages.iter().filter(|m| matches!(m, Message::Batch(_))).count() as u64;
}

/// The generic `on_producer_completed` default policy from section 4.1:
/// let the operator flush its accumulated state, then signal completion.
async fn drain_then_complete(op: &mut dyn Operator, env: &mut Env<'_>) -> Result<(), EngineError> {
    op.on_drain(env).await?;
    env.complete().await
}

/// The generic `on_consumer_completed` default policy: once every
/// consumer has signaled it wants no more, this operator has nothing
/// left to do either.
async fn saturate_then_complete(op: &mut dyn Operator, env: &mut Env<'_>) -> Result<(), EngineError> {
    op.on_saturated(env).await?;
    env.complete().await
}

/// One operator's task in the `TaskParallel` transport: owns its
/// `OperatorCore` and inbound mailbox for its whole lifetime, and hands
/// both back to the plan once it completes (successfully or not) so
/// `QueryPlan::tuples()`/`metrics()` can inspect it afterward.
async fn operator_worker(
    id: OperatorId,
    mut op: Box<dyn Operator>,
    mut core: OperatorCore,
    mut rx: mpsc::Receiver<Envelope>,
    dispatch: Dispatch,
    config: Arc<GraphConfig>,
) -> (OperatorId, Box<dyn Operator>, OperatorCore) {
    let completion_tx = match &dispatch {
        Dispatch::TaskParallel { completion_tx, .. } => completion_tx.clone(),
        Dispatch::Cooperative(_) => unreachable!("operator_worker only runs under TaskParallel"),
    };

    while let Some(envelope) = rx.recv().await {
        let mut env = Env::new(id, &mut core, &dispatch, &config);
        env.core_mut().metrics.start();

        let res: Result<(), EngineError> = match envelope {
            Envelope::Control(Control::Start) => op.run(&mut env).await,
            Envelope::Control(Control::ProducerCompleted(p)) => {
                env.core_mut().mark_producer_done(p);
                if env.core().all_producers_done() && !env.is_completed() {
                    drain_then_complete(op.as_mut(), &mut env).await
                } else {
                    Ok(())
                }
            }
            Envelope::Control(Control::ConsumerCompleted(c)) => {
                env.core_mut().mark_consumer_done(c);
                if env.core().all_consumers_done() && !env.is_completed() {
                    saturate_then_complete(op.as_mut(), &mut env).await
                } else {
                    Ok(())
                }
            }
            Envelope::Control(Control::OperatorCompleted { .. }) => Ok(()),
            Envelope::Data { from, messages } => {
                count_inbound(env.core_mut(), &messages);
                op.on_receive(&mut env, messages, from).await
            }
        };

        env.core_mut().metrics.stop();
        let is_completed = env.is_completed();

        if let Err(e) = res {
            let _ = completion_tx.send(Control::OperatorCompleted {
                op: id,
                error: Some(e.to_string()),
            });
            break;
        }
        if is_completed {
            break;
        }
    }

    (id, op, core)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use async_trait::async_trait;

    struct EchoSource {
        rows: Vec<Vec<String>>,
    }

    #[async_trait]
    impl Operator for EchoSource {
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

    struct Sink {
        rows: Vec<Vec<String>>,
    }

    #[async_trait]
    impl Operator for Sink {
        async fn on_receive(&mut self, _env: &mut Env<'_>, messages: Vec<Message>, _producer: OperatorId) -> Result<(), EngineError> {
            for m in messages {
                if let Message::Tuple(t) = m {
                    self.rows.push(t);
                }
            }
            Ok(())
        }

        async fn on_snapshot(&mut self, _env: &mut Env<'_>) -> Result<RowTable, EngineError> {
            Ok(self.rows.clone())
        }
    }

    #[tokio::test]
    async fn cooperative_delivers_every_row_and_completes() {
        let mut plan = QueryPlan::new(GraphConfig::default());
        let src = plan.add_operator(
            "src",
            EchoSource {
                rows: vec![vec!["a".into()], vec!["b".into()]],
            },
        );
        let sink = plan.add_operator("sink", Sink { rows: Vec::new() });
        plan.connect(src, sink).unwrap();
        plan.execute().await.unwrap();
        let rows = plan.tuples(sink).await.unwrap();
        assert_eq!(rows, vec![vec!["a".to_string()], vec!["b".to_string()]]);
    }

    #[tokio::test]
    async fn task_parallel_delivers_every_row_and_completes() {
        let mut config = GraphConfig::default();
        config.transport = crate::config::Transport::TaskParallel;
        let mut plan = QueryPlan::new(config);
        let src = plan.add_operator(
            "src",
            EchoSource {
                rows: vec![vec!["a".into()], vec!["b".into()], vec!["c".into()]],
            },
        );
        let sink = plan.add_operator("sink", Sink { rows: Vec::new() });
        plan.connect(src, sink).unwrap();
        plan.execute().await.unwrap();
        let rows = plan.tuples(sink).await.unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn duplicate_edge_is_rejected() {
        let mut plan = QueryPlan::new(GraphConfig::default());
        let src = plan.add_operator("src", EchoSource { rows: vec![] });
        let sink = plan.add_operator("sink", Sink { rows: Vec::new() });
        plan.connect(src, sink).unwrap();
        assert!(matches!(plan.connect(src, sink), Err(PlanError::DuplicateEdge(_, _))));
    }
}
