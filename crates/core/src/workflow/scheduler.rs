use super::graph::WorkflowDag;
use super::registry::{
    ExecutionContext, ExecutorError, ExecutorRegistry, NodeBehavior, NodeExecutor,
    ProgressReporter, ProgressUpdate,
};
use super::resolver::{runnable_now, DependencyTracker};
use super::state::{ExecutionStateStore, NodePatch};
use crate::config::{EngineConfig, FailurePolicy};
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventBus, EventLog, EventType};
use crate::types::{EdgeId, Node, NodeId, NodeStatus, RunId, RunStatus};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// External request against a live run
#[derive(Debug, Clone, PartialEq)]
pub enum ControlAction {
    Pause,
    Resume,
    Stop,
    Approve { node_id: NodeId, data: Value },
    Reject { node_id: NodeId, reason: String },
}

/// Everything the run loop reacts to
pub(crate) enum RunCommand {
    Control {
        action: ControlAction,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    /// A queued execution obtained its concurrency permit
    NodeStarted {
        node_id: NodeId,
        status: NodeStatus,
    },
    NodeCompleted {
        node_id: NodeId,
        output: Value,
    },
    NodeFailed {
        node_id: NodeId,
        reason: String,
    },
    Progress {
        node_id: NodeId,
        update: ProgressUpdate,
    },
}

/// Sequenced writer for a run's event log and live bus
pub(crate) struct EventFeed {
    run_id: RunId,
    sequence: u64,
    log: Arc<dyn EventLog>,
    bus: Arc<EventBus>,
}

impl EventFeed {
    pub(crate) fn new(run_id: RunId, log: Arc<dyn EventLog>, bus: Arc<EventBus>) -> Self {
        Self {
            run_id,
            sequence: 0,
            log,
            bus,
        }
    }

    async fn emit(&mut self, event_type: EventType) {
        let event = Event::new(self.run_id, self.sequence, event_type);
        self.sequence += 1;

        if let Err(e) = self.log.append(event.clone()).await {
            tracing::warn!("Failed to append event for run {}: {}", self.run_id, e);
        }
        self.bus.publish(event);
    }
}

/// Drives one run of a graph to quiescence.
///
/// The scheduler owns every write to the run's state: control commands,
/// executor completions and progress reports all arrive through one command
/// channel and are applied one at a time.
pub(crate) struct RunScheduler {
    run_id: RunId,
    dag: Arc<WorkflowDag>,
    registry: Arc<ExecutorRegistry>,
    config: EngineConfig,
    store: ExecutionStateStore,
    tracker: DependencyTracker,
    feed: EventFeed,
    commands: mpsc::UnboundedSender<RunCommand>,
    status: watch::Sender<RunStatus>,
    cancel: CancellationToken,
    permits: Option<Arc<Semaphore>>,
    in_flight: HashMap<NodeId, JoinHandle<()>>,
    open_gates: HashSet<NodeId>,
    failed_nodes: usize,
    first_failure: Option<EngineError>,
    started_at: DateTime<Utc>,
    finished: bool,
}

impl RunScheduler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        run_id: RunId,
        dag: Arc<WorkflowDag>,
        registry: Arc<ExecutorRegistry>,
        config: EngineConfig,
        store: ExecutionStateStore,
        feed: EventFeed,
        commands: mpsc::UnboundedSender<RunCommand>,
        status: watch::Sender<RunStatus>,
    ) -> Self {
        let tracker = DependencyTracker::new(&dag);
        let permits = config
            .max_concurrent_nodes
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));

        Self {
            run_id,
            dag,
            registry,
            config,
            store,
            tracker,
            feed,
            commands,
            status,
            cancel: CancellationToken::new(),
            permits,
            in_flight: HashMap::new(),
            open_gates: HashSet::new(),
            failed_nodes: 0,
            first_failure: None,
            started_at: Utc::now(),
            finished: false,
        }
    }

    /// Mark the run started and dispatch every entry node
    pub(crate) async fn begin(&mut self) {
        self.started_at = Utc::now();
        self.store.begin(self.started_at).await;
        self.set_status(RunStatus::Running);

        tracing::info!(
            "Starting run {}: {} nodes, {} edges",
            self.run_id,
            self.dag.nodes().len(),
            self.dag.edges().len()
        );
        self.feed
            .emit(EventType::RunStarted {
                node_count: self.dag.nodes().len(),
                edge_count: self.dag.edges().len(),
            })
            .await;

        for node_id in self.dag.entry_nodes() {
            self.schedule_node(&node_id).await;
        }
        self.settle().await;
    }

    /// Process commands until the run is finalized
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<RunCommand>) {
        while !self.finished {
            let Some(command) = commands.recv().await else {
                break;
            };
            self.handle(command).await;
        }
        tracing::debug!("Run {} loop exited", self.run_id);
    }

    async fn handle(&mut self, command: RunCommand) {
        match command {
            RunCommand::Control { action, reply } => {
                let result = self.control(action).await;
                // Caller may have gone away
                let _ = reply.send(result);
            }
            RunCommand::NodeStarted { node_id, status } => {
                self.on_started(&node_id, status).await;
            }
            RunCommand::NodeCompleted { node_id, output } => {
                self.on_completed(&node_id, output).await;
            }
            RunCommand::NodeFailed { node_id, reason } => {
                self.on_failed(&node_id, reason).await;
            }
            RunCommand::Progress { node_id, update } => {
                self.on_progress(&node_id, update).await;
            }
        }
    }

    async fn control(&mut self, action: ControlAction) -> EngineResult<()> {
        let status = self.store.run_status().await;

        match action {
            ControlAction::Pause => {
                if status != RunStatus::Running {
                    return Err(EngineError::run_not_live(status, "pause"));
                }
                self.store.set_run_status(RunStatus::Paused).await;
                self.set_status(RunStatus::Paused);
                tracing::info!("Run {} paused", self.run_id);
                self.feed.emit(EventType::RunPaused).await;
                Ok(())
            }
            ControlAction::Resume => {
                if status != RunStatus::Paused {
                    return Err(EngineError::run_not_live(status, "resume"));
                }
                self.store.set_run_status(RunStatus::Running).await;
                self.set_status(RunStatus::Running);
                tracing::info!("Run {} resumed", self.run_id);
                self.feed.emit(EventType::RunResumed).await;
                self.settle().await;
                Ok(())
            }
            ControlAction::Stop => {
                if !status.is_live() {
                    return Err(EngineError::run_not_live(status, "stop"));
                }
                tracing::info!("Stopping run {}", self.run_id);
                self.abort_in_flight("run stopped").await;
                self.finalize(RunStatus::Idle, EventType::RunStopped).await;
                Ok(())
            }
            ControlAction::Approve { node_id, data } => {
                self.require_gate(&node_id, "approve").await?;
                self.approve(&node_id, data).await
            }
            ControlAction::Reject { node_id, reason } => {
                self.require_gate(&node_id, "reject").await?;
                self.reject(&node_id, reason).await
            }
        }
    }

    async fn require_gate(&self, node_id: &NodeId, action: &str) -> EngineResult<()> {
        if !self.dag.contains(node_id) {
            return Err(EngineError::NodeNotFound(node_id.clone()));
        }
        match self.store.get(node_id).await {
            Some(record) if record.status == NodeStatus::Waiting && record.awaiting_approval => {
                Ok(())
            }
            record => {
                let status = record.map(|r| r.status).unwrap_or(NodeStatus::Idle);
                Err(EngineError::node_not_gated(node_id, status, action))
            }
        }
    }

    /// Start `node_id` if every upstream succeeded, otherwise park it as
    /// waiting. Calls on a node that already left idle/waiting do nothing.
    async fn schedule_node(&mut self, node_id: &NodeId) {
        let record = self.store.get(node_id).await;
        let schedulable = match &record {
            None => true,
            Some(r) => {
                r.status == NodeStatus::Idle
                    || (r.status == NodeStatus::Waiting && !r.awaiting_approval)
            }
        };
        if !schedulable || self.in_flight.contains_key(node_id) {
            tracing::debug!("Node {} already scheduled, skipping", node_id);
            return;
        }

        if self.tracker.is_ready(node_id) {
            self.dispatch(node_id).await;
        } else {
            self.park_waiting(node_id).await;
        }
    }

    /// Record the upstream ids still blocking `node_id`
    async fn park_waiting(&mut self, node_id: &NodeId) {
        let blocking = self.tracker.blocking(node_id).to_vec();
        tracing::debug!("Node {} waiting on {:?}", node_id, blocking);
        let input = self.gather_input(node_id).await;
        let patch = NodePatch {
            status: Some(NodeStatus::Waiting),
            dependencies: Some(blocking),
            input,
            ..Default::default()
        };
        self.transition(node_id, patch).await;
    }

    async fn dispatch(&mut self, node_id: &NodeId) {
        let Some(node) = self.dag.node(node_id).cloned() else {
            return;
        };
        let input = self
            .gather_input(node_id)
            .await
            .unwrap_or_else(|| Value::Object(Map::new()));

        let behavior = match self.registry.resolve(&node.kind) {
            Ok(behavior) => behavior.clone(),
            Err(e) => {
                self.on_failed(node_id, e.to_string()).await;
                return;
            }
        };

        let (executor, active) = match behavior {
            NodeBehavior::ManualGate => {
                let patch = NodePatch {
                    status: Some(NodeStatus::Waiting),
                    started_at: Some(Utc::now()),
                    input: Some(input),
                    dependencies: Some(Vec::new()),
                    awaiting_approval: Some(true),
                    ..Default::default()
                };
                if self.transition(node_id, patch).await {
                    tracing::info!("Node {} awaiting approval", node_id);
                    self.open_gates.insert(node_id.clone());
                    self.feed
                        .emit(EventType::ApprovalRequested {
                            node_id: node_id.clone(),
                        })
                        .await;
                }
                self.mark_downstream_waiting(node_id).await;
                return;
            }
            NodeBehavior::Synchronous(executor) => (executor, NodeStatus::Running),
            NodeBehavior::Asynchronous(executor) => (executor, NodeStatus::Processing),
        };

        // Under a concurrency bound the node stays waiting, with nothing left
        // to wait on, until its execution holds a permit
        let (patch, queued_as) = if self.permits.is_some() {
            let queued = NodePatch {
                status: Some(NodeStatus::Waiting),
                input: Some(input.clone()),
                dependencies: Some(Vec::new()),
                ..Default::default()
            };
            (queued, Some(active))
        } else {
            (start_patch(active, Some(input.clone())), None)
        };
        if self.transition(node_id, patch).await {
            self.spawn_execution(node, executor, input, queued_as);
        }

        self.mark_downstream_waiting(node_id).await;
    }

    /// Untouched dependents of a node that just started show up as waiting
    async fn mark_downstream_waiting(&mut self, node_id: &NodeId) {
        for dependent in self.dag.dependents(node_id) {
            if self.store.get(&dependent).await.is_none() && !self.tracker.is_ready(&dependent) {
                self.park_waiting(&dependent).await;
            }
        }
    }

    fn spawn_execution(
        &mut self,
        node: Node,
        executor: Arc<dyn NodeExecutor>,
        input: Value,
        queued_as: Option<NodeStatus>,
    ) {
        let node_id = node.id.clone();
        let token = self.cancel.child_token();
        let commands = self.commands.clone();

        let reporter = {
            let commands = commands.clone();
            let node_id = node_id.clone();
            ProgressReporter::new(move |update| {
                let _ = commands.send(RunCommand::Progress {
                    node_id: node_id.clone(),
                    update,
                });
            })
        };
        let execution = Execution {
            executor,
            node,
            input,
            ctx: ExecutionContext::new(self.run_id, node_id.clone(), token.clone(), reporter),
            permits: self.permits.clone(),
            timeout_secs: self.config.node_timeout_secs,
            on_started: queued_as.map(|status| {
                (
                    commands.clone(),
                    RunCommand::NodeStarted {
                        node_id: node_id.clone(),
                        status,
                    },
                )
            }),
        };

        tracing::debug!("Spawning executor for node {}", node_id);
        let task_node_id = node_id.clone();
        let handle = tokio::spawn(async move {
            // Inner task so a panicking executor surfaces as a JoinError
            let work = tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => None,
                    result = execution.run() => Some(result),
                }
            });

            let command = match work.await {
                Ok(Some(Ok(output))) => RunCommand::NodeCompleted {
                    node_id: task_node_id,
                    output,
                },
                Ok(Some(Err(e))) => RunCommand::NodeFailed {
                    node_id: task_node_id,
                    reason: e.0,
                },
                Ok(None) => {
                    tracing::debug!("Execution of node {} cancelled", task_node_id);
                    return;
                }
                Err(e) if e.is_panic() => RunCommand::NodeFailed {
                    reason: format!("executor panicked: {}", panic_message(e.into_panic())),
                    node_id: task_node_id,
                },
                Err(_) => return,
            };
            // The run may already be finalized
            let _ = commands.send(command);
        });
        self.in_flight.insert(node_id, handle);
    }

    /// A queued execution now holds its permit
    async fn on_started(&mut self, node_id: &NodeId, status: NodeStatus) {
        if self.transition(node_id, start_patch(status, None)).await {
            tracing::debug!("Node {} acquired a concurrency permit", node_id);
        }
    }

    async fn on_completed(&mut self, node_id: &NodeId, output: Value) {
        self.in_flight.remove(node_id);

        let patch = NodePatch {
            status: Some(NodeStatus::Succeeded),
            ended_at: Some(Utc::now()),
            output: Some(output.clone()),
            ..Default::default()
        };
        if !self.transition(node_id, patch).await {
            return;
        }
        tracing::info!("Node {} succeeded", node_id);

        self.propagate(node_id, output).await;
        self.settle().await;
    }

    /// Write `output` onto every outgoing edge, then schedule the dependents
    async fn propagate(&mut self, node_id: &NodeId, output: Value) {
        for edge in self.dag.outgoing_edges(node_id) {
            self.store.set_edge_data(&edge.id, output.clone()).await;
            self.feed
                .emit(EventType::EdgeDataUpdated {
                    edge_id: edge.id.clone(),
                    source_node_id: edge.source_node_id.clone(),
                    target_node_id: edge.target_node_id.clone(),
                    value: output.clone(),
                })
                .await;
        }

        let dependents = self.dag.dependents(node_id);
        self.tracker.resolve(node_id, &dependents);
        for dependent in &dependents {
            self.schedule_node(dependent).await;
        }
        self.check_readiness().await;
    }

    /// Debug builds cross-check the tracker against a full readiness scan
    async fn check_readiness(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        let snapshot = self.store.snapshot().await;
        let readiness = runnable_now(&self.dag, &snapshot);
        for node_id in &readiness.ready {
            debug_assert!(
                self.tracker.is_ready(node_id),
                "node {} has every upstream succeeded but is still tracked as blocked",
                node_id
            );
        }
        for node_id in readiness.waiting.iter().chain(&readiness.blocked) {
            debug_assert!(
                !self.tracker.is_ready(node_id),
                "node {} is tracked as ready with unfinished upstreams",
                node_id
            );
        }
    }

    async fn on_failed(&mut self, node_id: &NodeId, reason: String) {
        self.in_flight.remove(node_id);

        let patch = NodePatch {
            status: Some(NodeStatus::Failed),
            ended_at: Some(Utc::now()),
            error: Some(reason.clone()),
            ..Default::default()
        };
        if !self.transition(node_id, patch).await {
            return;
        }
        let failure = EngineError::ExecutorFailure {
            node_id: node_id.clone(),
            reason,
        };
        tracing::warn!("{}", failure);
        self.first_failure.get_or_insert(failure);

        self.fail_descendants(node_id).await;
        self.settle().await;
    }

    async fn fail_descendants(&mut self, node_id: &NodeId) {
        if self.config.failure_policy == FailurePolicy::LeavePending {
            return;
        }

        let reason = format!("blocked by upstream failure: {}", node_id);
        for descendant in self.dag.descendants(node_id) {
            let status = self
                .store
                .get(&descendant)
                .await
                .map(|r| r.status)
                .unwrap_or(NodeStatus::Idle);
            if status.is_terminal() || status.is_active() {
                continue;
            }
            let patch = NodePatch {
                status: Some(NodeStatus::Failed),
                ended_at: Some(Utc::now()),
                error: Some(reason.clone()),
                ..Default::default()
            };
            self.open_gates.remove(&descendant);
            self.transition(&descendant, patch).await;
        }
    }

    async fn on_progress(&mut self, node_id: &NodeId, update: ProgressUpdate) {
        let patch = NodePatch {
            progress_percent: Some(update.percent),
            progress_message: update.message.clone(),
            estimated_completion_at: update.estimated_completion_at,
            ..Default::default()
        };
        if let Err(e) = self.store.upsert(node_id, patch).await {
            tracing::debug!("Dropped progress report: {}", e);
            return;
        }
        self.feed
            .emit(EventType::NodeProgress {
                node_id: node_id.clone(),
                percent: update.percent,
                message: update.message,
                estimated_completion_at: update.estimated_completion_at,
            })
            .await;
    }

    async fn approve(&mut self, node_id: &NodeId, data: Value) -> EngineResult<()> {
        let input = self.store.get(node_id).await.and_then(|r| r.input);
        let output = merge_approval(input, data.clone());

        let patch = NodePatch {
            status: Some(NodeStatus::Succeeded),
            ended_at: Some(Utc::now()),
            output: Some(output.clone()),
            ..Default::default()
        };
        self.store.upsert(node_id, patch).await?;
        self.open_gates.remove(node_id);
        tracing::info!("Node {} approved", node_id);

        self.feed
            .emit(EventType::ApprovalGranted {
                node_id: node_id.clone(),
                data,
            })
            .await;
        self.emit_status_change(node_id, NodeStatus::Waiting, NodeStatus::Succeeded, None)
            .await;

        self.propagate(node_id, output).await;
        self.settle().await;
        Ok(())
    }

    /// A rejection fails the node and the whole run
    async fn reject(&mut self, node_id: &NodeId, reason: String) -> EngineResult<()> {
        let patch = NodePatch {
            status: Some(NodeStatus::Failed),
            ended_at: Some(Utc::now()),
            error: Some(reason.clone()),
            ..Default::default()
        };
        self.store.upsert(node_id, patch).await?;
        self.open_gates.remove(node_id);
        self.failed_nodes += 1;
        tracing::warn!("Node {} rejected: {}", node_id, reason);

        self.feed
            .emit(EventType::ApprovalRejected {
                node_id: node_id.clone(),
                reason: reason.clone(),
            })
            .await;
        self.emit_status_change(
            node_id,
            NodeStatus::Waiting,
            NodeStatus::Failed,
            Some(reason.clone()),
        )
        .await;

        self.fail_descendants(node_id).await;
        self.abort_in_flight(&format!("run aborted: node {} rejected", node_id))
            .await;

        let error = EngineError::ManualRejection {
            node_id: node_id.clone(),
            reason,
        };
        let duration_ms = self.elapsed_ms();
        self.finalize(
            RunStatus::Failed,
            EventType::RunFailed {
                error: error.to_string(),
                duration_ms,
            },
        )
        .await;
        Ok(())
    }

    /// Cancel every running execution and fail its node with `reason`
    async fn abort_in_flight(&mut self, reason: &str) {
        self.cancel.cancel();
        let in_flight: Vec<_> = self.in_flight.drain().collect();
        for (node_id, handle) in in_flight {
            handle.abort();
            let patch = NodePatch {
                status: Some(NodeStatus::Failed),
                ended_at: Some(Utc::now()),
                error: Some(reason.to_string()),
                ..Default::default()
            };
            self.transition(&node_id, patch).await;
        }
    }

    /// Finalize the run once nothing can make progress anymore
    async fn settle(&mut self) {
        if self.finished || !self.in_flight.is_empty() || !self.open_gates.is_empty() {
            return;
        }
        if self.store.run_status().await != RunStatus::Running {
            return;
        }

        let duration_ms = self.elapsed_ms();
        if self.failed_nodes == 0 {
            tracing::info!("Run {} succeeded in {}ms", self.run_id, duration_ms);
            self.finalize(RunStatus::Succeeded, EventType::RunCompleted { duration_ms })
                .await;
        } else {
            let error = match &self.first_failure {
                Some(first) => format!("{} node(s) failed, first: {}", self.failed_nodes, first),
                None => format!("{} node(s) failed", self.failed_nodes),
            };
            tracing::warn!("Run {} failed: {}", self.run_id, error);
            self.finalize(RunStatus::Failed, EventType::RunFailed { error, duration_ms })
                .await;
        }
    }

    async fn finalize(&mut self, status: RunStatus, event: EventType) {
        self.cancel.cancel();
        self.store.finish(status, Utc::now()).await;
        self.feed.emit(event).await;
        self.set_status(status);
        self.finished = true;
    }

    /// Apply a patch and emit the status change it causes.
    /// Returns false when the store refused the patch.
    async fn transition(&mut self, node_id: &NodeId, patch: NodePatch) -> bool {
        let next = patch.status;
        let error = patch.error.clone();

        let previous = match self.store.upsert(node_id, patch).await {
            Ok(previous) => previous,
            Err(e) => {
                tracing::warn!("Run {}: {}", self.run_id, e);
                return false;
            }
        };

        if let Some(next) = next {
            if next == NodeStatus::Failed {
                self.failed_nodes += 1;
            }
            if next != previous {
                self.emit_status_change(node_id, previous, next, error).await;
            }
        }
        true
    }

    async fn emit_status_change(
        &mut self,
        node_id: &NodeId,
        from: NodeStatus,
        to: NodeStatus,
        error: Option<String>,
    ) {
        tracing::debug!("Node {}: {} -> {}", node_id, from, to);
        self.feed
            .emit(EventType::NodeStatusChanged {
                node_id: node_id.clone(),
                from,
                to,
                error,
            })
            .await;
    }

    /// Values received so far on the node's incoming edges.
    ///
    /// One distinct upstream hands its output through as-is; several are
    /// keyed by upstream node id. `None` when nothing has arrived yet.
    async fn gather_input(&self, node_id: &NodeId) -> Option<Value> {
        let incoming = self.dag.incoming_edges(node_id);
        let edge_ids: Vec<EdgeId> = incoming.iter().map(|e| e.id.clone()).collect();
        let values = self.store.edge_values(&edge_ids).await;
        let mut by_source: Vec<(NodeId, Value)> = Vec::new();

        for edge in incoming {
            if by_source.iter().any(|(id, _)| *id == edge.source_node_id) {
                continue;
            }
            if let Some(value) = values.get(&edge.id) {
                by_source.push((edge.source_node_id.clone(), value.clone()));
            }
        }

        if by_source.is_empty() {
            return None;
        }
        if self.dag.dependencies(node_id).len() == 1 {
            return by_source.pop().map(|(_, value)| value);
        }
        Some(Value::Object(
            by_source
                .into_iter()
                .map(|(id, value)| (id.0, value))
                .collect(),
        ))
    }

    fn set_status(&self, status: RunStatus) {
        self.status.send_replace(status);
    }

    fn elapsed_ms(&self) -> u64 {
        (Utc::now() - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// Status patch for a node whose executor is starting now
fn start_patch(status: NodeStatus, input: Option<Value>) -> NodePatch {
    NodePatch {
        status: Some(status),
        started_at: Some(Utc::now()),
        input,
        progress_percent: (status == NodeStatus::Processing).then_some(0),
        ..Default::default()
    }
}

/// One executor invocation, run on its own task
struct Execution {
    executor: Arc<dyn NodeExecutor>,
    node: Node,
    input: Value,
    ctx: ExecutionContext,
    permits: Option<Arc<Semaphore>>,
    timeout_secs: Option<u64>,
    /// Sent once the permit is held, before the executor runs
    on_started: Option<(mpsc::UnboundedSender<RunCommand>, RunCommand)>,
}

impl Execution {
    async fn run(self) -> Result<Value, ExecutorError> {
        let _permit = match self.permits {
            Some(semaphore) => Some(
                semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| ExecutorError::from("executor pool closed"))?,
            ),
            None => None,
        };
        if let Some((commands, started)) = self.on_started {
            let _ = commands.send(started);
        }

        let work = self.executor.execute(&self.node, self.input, &self.ctx);
        match self.timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), work)
                .await
                .unwrap_or_else(|_| Err(ExecutorError(format!("timed out after {} seconds", secs)))),
            None => work.await,
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Output of an approved gate: its input with the caller's fields on top
pub(crate) fn merge_approval(input: Option<Value>, data: Value) -> Value {
    let mut merged = match input {
        Some(Value::Object(map)) => map,
        None | Some(Value::Null) => Map::new(),
        Some(other) => {
            let mut map = Map::new();
            map.insert("input".to_string(), other);
            map
        }
    };

    match data {
        Value::Object(fields) => merged.extend(fields),
        Value::Null => {}
        other => {
            merged.insert("value".to_string(), other);
        }
    }
    Value::Object(merged)
}
