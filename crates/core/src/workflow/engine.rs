use super::graph::WorkflowDag;
use super::registry::ExecutorRegistry;
use super::scheduler::{ControlAction, EventFeed, RunCommand, RunScheduler};
use super::state::ExecutionStateStore;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventBus, EventLog, InMemoryEventLog};
use crate::types::{NodeId, RunId, RunStatus, WorkflowGraph, WorkflowRunState};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};

/// Handle kept for each submitted run
#[derive(Clone)]
struct RunHandle {
    commands: mpsc::UnboundedSender<RunCommand>,
    store: ExecutionStateStore,
    status: watch::Receiver<RunStatus>,
}

/// Submitted runs, in submission order
#[derive(Default)]
struct RunTable {
    handles: HashMap<RunId, RunHandle>,
    order: VecDeque<RunId>,
}

impl RunTable {
    fn insert(&mut self, run_id: RunId, handle: RunHandle) {
        self.handles.insert(run_id, handle);
        self.order.push_back(run_id);
    }

    /// Remove the oldest finalized runs until at most `limit` remain.
    /// Live runs are never evicted.
    fn evict_finished(&mut self, limit: usize) -> Vec<RunId> {
        let mut excess = self.handles.len().saturating_sub(limit);
        let mut evicted = Vec::new();
        for run_id in &self.order {
            if excess == 0 {
                break;
            }
            let finished = self
                .handles
                .get(run_id)
                .map_or(false, |h| !h.status.borrow().is_live());
            if finished {
                evicted.push(*run_id);
                excess -= 1;
            }
        }
        for run_id in &evicted {
            self.handles.remove(run_id);
        }
        self.order.retain(|id| !evicted.contains(id));
        evicted
    }
}

/// Entry point for submitting graphs and controlling their runs
pub struct WorkflowEngine {
    registry: Arc<ExecutorRegistry>,
    config: EngineConfig,
    event_log: Arc<dyn EventLog>,
    event_bus: Arc<EventBus>,
    runs: RwLock<RunTable>,
}

impl WorkflowEngine {
    pub fn new(registry: ExecutorRegistry, config: EngineConfig) -> Self {
        Self::with_event_log(registry, config, Arc::new(InMemoryEventLog::new()))
    }

    pub fn with_event_log(
        registry: ExecutorRegistry,
        config: EngineConfig,
        event_log: Arc<dyn EventLog>,
    ) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer));
        Self {
            registry: Arc::new(registry),
            config,
            event_log,
            event_bus,
            runs: RwLock::new(RunTable::default()),
        }
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// Validate a graph and start executing it.
    ///
    /// Fails with `MalformedGraph`, `NoEntryPoint` or `UnknownNodeKind`
    /// before any node runs.
    pub async fn start(&self, graph: WorkflowGraph) -> EngineResult<RunId> {
        let dag = WorkflowDag::from_graph(&graph)?;
        for node in dag.nodes() {
            self.registry.resolve(&node.kind)?;
        }

        let run_id = RunId::new();
        let store = ExecutionStateStore::new(run_id);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(RunStatus::Idle);
        let feed = EventFeed::new(run_id, self.event_log.clone(), self.event_bus.clone());

        let mut scheduler = RunScheduler::new(
            run_id,
            Arc::new(dag),
            self.registry.clone(),
            self.config.clone(),
            store.clone(),
            feed,
            commands_tx.clone(),
            status_tx,
        );
        scheduler.begin().await;
        tokio::spawn(scheduler.run(commands_rx));

        let evicted = {
            let mut runs = self.runs.write().await;
            // Evict first; the new run is never a candidate
            let evicted = match self.config.max_retained_runs {
                Some(limit) => runs.evict_finished(limit.saturating_sub(1)),
                None => Vec::new(),
            };
            runs.insert(
                run_id,
                RunHandle {
                    commands: commands_tx,
                    store,
                    status: status_rx,
                },
            );
            evicted
        };
        for old in evicted {
            tracing::debug!("Evicting finished run {}", old);
            if let Err(e) = self.event_log.remove_run(old).await {
                tracing::warn!("Failed to drop events of run {}: {}", old, e);
            }
        }

        Ok(run_id)
    }

    pub async fn pause(&self, run_id: RunId) -> EngineResult<()> {
        self.control(run_id, ControlAction::Pause).await
    }

    pub async fn resume(&self, run_id: RunId) -> EngineResult<()> {
        self.control(run_id, ControlAction::Resume).await
    }

    /// Stop the run and cancel every execution still in flight
    pub async fn stop(&self, run_id: RunId) -> EngineResult<()> {
        self.control(run_id, ControlAction::Stop).await
    }

    /// Complete a waiting gate node; `data` overrides its input on key collision
    pub async fn approve(
        &self,
        run_id: RunId,
        node_id: NodeId,
        data: serde_json::Value,
    ) -> EngineResult<()> {
        self.control(run_id, ControlAction::Approve { node_id, data })
            .await
    }

    /// Fail a waiting gate node; this fails the whole run
    pub async fn reject(
        &self,
        run_id: RunId,
        node_id: NodeId,
        reason: impl Into<String>,
    ) -> EngineResult<()> {
        self.control(
            run_id,
            ControlAction::Reject {
                node_id,
                reason: reason.into(),
            },
        )
        .await
    }

    pub async fn snapshot(&self, run_id: RunId) -> EngineResult<WorkflowRunState> {
        Ok(self.handle(run_id).await?.store.snapshot().await)
    }

    /// Every retained run with its current status, oldest first
    pub async fn runs(&self) -> Vec<(RunId, RunStatus)> {
        let runs = self.runs.read().await;
        runs.order
            .iter()
            .filter_map(|id| runs.handles.get(id).map(|h| (*id, *h.status.borrow())))
            .collect()
    }

    /// Events of one run, oldest first
    pub async fn events(&self, run_id: RunId) -> EngineResult<Vec<Event>> {
        self.handle(run_id).await?;
        let mut events = self
            .event_log
            .get_run_events(run_id)
            .await
            .map_err(|e| EngineError::EventLog(e.to_string()))?;
        events.sort_by_key(|e| e.sequence);
        Ok(events)
    }

    /// Live feed of every run's events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_bus.subscribe()
    }

    /// Resolve once the run is finalized, with its final status
    pub async fn wait(&self, run_id: RunId) -> EngineResult<RunStatus> {
        let handle = self.handle(run_id).await?;
        let mut status = handle.status.clone();
        let result = status.wait_for(|s| !s.is_live()).await.map(|s| *s);
        match result {
            Ok(final_status) => Ok(final_status),
            Err(_) => Ok(handle.store.run_status().await),
        }
    }

    async fn handle(&self, run_id: RunId) -> EngineResult<RunHandle> {
        self.runs
            .read()
            .await
            .handles
            .get(&run_id)
            .cloned()
            .ok_or(EngineError::RunNotFound(run_id))
    }

    async fn control(&self, run_id: RunId, action: ControlAction) -> EngineResult<()> {
        let handle = self.handle(run_id).await?;
        tracing::debug!("Run {}: {:?}", run_id, action);

        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = handle.commands.send(RunCommand::Control {
            action: action.clone(),
            reply: reply_tx,
        });

        let outcome = match sent {
            Ok(()) => reply_rx.await.ok(),
            Err(_) => None,
        };
        match outcome {
            Some(result) => result,
            // The run loop has exited: the run is finalized
            None => {
                let status = handle.store.run_status().await;
                Err(finalized_run_error(status, &action))
            }
        }
    }
}

fn finalized_run_error(status: RunStatus, action: &ControlAction) -> EngineError {
    let verb = match action {
        ControlAction::Pause => "pause",
        ControlAction::Resume => "resume",
        ControlAction::Stop => "stop",
        ControlAction::Approve { .. } => "approve a node of",
        ControlAction::Reject { .. } => "reject a node of",
    };
    EngineError::run_not_live(status, verb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailurePolicy;
    use crate::events::EventType;
    use crate::types::{Edge, Node, NodeStatus};
    use crate::workflow::registry::{
        ExecutionContext, ExecutorError, FnExecutor, NodeExecutor,
    };
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Sleeps in steps, reporting progress after each one
    struct SlowExecutor {
        steps: u32,
        step: Duration,
        output: Value,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl SlowExecutor {
        fn new(total: Duration, output: Value) -> Self {
            Self {
                steps: 4,
                step: total / 4,
                output,
                active: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait::async_trait]
    impl NodeExecutor for SlowExecutor {
        async fn execute(
            &self,
            _node: &Node,
            _input: Value,
            ctx: &ExecutionContext,
        ) -> Result<Value, ExecutorError> {
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_active, Ordering::SeqCst);

            for i in 1..self.steps {
                tokio::time::sleep(self.step).await;
                ctx.report_progress((i * 100 / self.steps) as u8, Some(format!("step {}", i)), None);
            }
            tokio::time::sleep(self.step).await;

            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(self.output.clone())
        }
    }

    fn constant(output: Value) -> Arc<dyn NodeExecutor> {
        Arc::new(FnExecutor::new(move |_, _| Ok(output.clone())))
    }

    fn echo() -> Arc<dyn NodeExecutor> {
        Arc::new(FnExecutor::new(|_, input| Ok(input)))
    }

    fn base_registry() -> ExecutorRegistry {
        let mut registry = ExecutorRegistry::new();
        registry.register_sync("source", constant(json!({"v": 1})));
        registry.register_sync("echo", echo());
        registry.register_sync(
            "broken",
            Arc::new(FnExecutor::new(|_, _| Err(ExecutorError::from("boom")))),
        );
        registry.register_manual_gate("manualStep");
        registry
    }

    fn graph(nodes: &[(&str, &str)], edges: &[(&str, &str)]) -> WorkflowGraph {
        WorkflowGraph {
            nodes: nodes.iter().map(|(id, kind)| Node::new(*id, *kind)).collect(),
            edges: edges
                .iter()
                .enumerate()
                .map(|(i, (s, t))| Edge::new(format!("e{}", i + 1), *s, *t))
                .collect(),
        }
    }

    fn id(node: &str) -> NodeId {
        NodeId::new(node)
    }

    async fn wait_until(
        engine: &WorkflowEngine,
        run_id: RunId,
        condition: impl Fn(&WorkflowRunState) -> bool,
    ) {
        for _ in 0..1000 {
            let snapshot = engine.snapshot(run_id).await.unwrap();
            if condition(&snapshot) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run {} never reached the expected state", run_id);
    }

    async fn wait_for_status(engine: &WorkflowEngine, run_id: RunId, node: &str, status: NodeStatus) {
        wait_until(engine, run_id, |s| s.node_status(&id(node)) == status).await;
    }

    async fn wait_for_gate(engine: &WorkflowEngine, run_id: RunId, node: &str) {
        wait_until(engine, run_id, |s| {
            s.record(&id(node)).map_or(false, |r| r.awaiting_approval)
        })
        .await;
    }

    fn status_changes(events: &[Event], node: &str) -> Vec<(NodeStatus, NodeStatus)> {
        events
            .iter()
            .filter_map(|e| match &e.event_type {
                EventType::NodeStatusChanged { node_id, from, to, .. } if node_id.0 == node => {
                    Some((*from, *to))
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_sync_chain_succeeds() {
        let engine = WorkflowEngine::new(base_registry(), EngineConfig::default());
        let run_id = engine
            .start(graph(
                &[("a", "source"), ("b", "echo"), ("c", "echo")],
                &[("a", "b"), ("b", "c")],
            ))
            .await
            .unwrap();

        assert_eq!(engine.wait(run_id).await.unwrap(), RunStatus::Succeeded);

        let snapshot = engine.snapshot(run_id).await.unwrap();
        assert_eq!(snapshot.run_status, RunStatus::Succeeded);
        assert_eq!(snapshot.record(&id("c")).unwrap().output, Some(json!({"v": 1})));
        assert_eq!(snapshot.edge_data.len(), 2);
        assert!(snapshot.active_node_ids.is_empty());
        assert!(snapshot.ended_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_fails_gate_and_run() {
        let engine = WorkflowEngine::new(base_registry(), EngineConfig::default());
        let run_id = engine
            .start(graph(&[("a", "source"), ("m", "manualStep")], &[("a", "m")]))
            .await
            .unwrap();

        wait_for_gate(&engine, run_id, "m").await;
        let gate = engine.snapshot(run_id).await.unwrap();
        let record = gate.record(&id("m")).unwrap();
        assert_eq!(record.status, NodeStatus::Waiting);
        assert!(record.awaiting_approval);

        engine.reject(run_id, id("m"), "no").await.unwrap();

        let snapshot = engine.snapshot(run_id).await.unwrap();
        let record = snapshot.record(&id("m")).unwrap();
        assert_eq!(record.status, NodeStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("no"));
        assert_eq!(snapshot.run_status, RunStatus::Failed);
        assert_eq!(engine.wait(run_id).await.unwrap(), RunStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_upstream_releases_waiting_node() {
        let mut registry = base_registry();
        registry.register_async(
            "agent",
            Arc::new(SlowExecutor::new(Duration::from_secs(8), json!({"answer": 42}))),
        );
        let engine = WorkflowEngine::new(registry, EngineConfig::default());
        let run_id = engine
            .start(graph(&[("a", "agent"), ("b", "echo")], &[("a", "b")]))
            .await
            .unwrap();

        let snapshot = engine.snapshot(run_id).await.unwrap();
        assert_eq!(snapshot.node_status(&id("a")), NodeStatus::Processing);
        let waiting = snapshot.record(&id("b")).unwrap();
        assert_eq!(waiting.status, NodeStatus::Waiting);
        assert_eq!(waiting.dependencies, vec![id("a")]);

        assert_eq!(engine.wait(run_id).await.unwrap(), RunStatus::Succeeded);

        let snapshot = engine.snapshot(run_id).await.unwrap();
        assert_eq!(snapshot.record(&id("b")).unwrap().output, Some(json!({"answer": 42})));
        assert_eq!(snapshot.record(&id("a")).unwrap().progress_percent, Some(100));

        let events = engine.events(run_id).await.unwrap();
        assert_eq!(
            status_changes(&events, "b"),
            vec![
                (NodeStatus::Idle, NodeStatus::Waiting),
                (NodeStatus::Waiting, NodeStatus::Running),
                (NodeStatus::Running, NodeStatus::Succeeded),
            ]
        );
        let progress = events
            .iter()
            .filter(|e| matches!(e.event_type, EventType::NodeProgress { .. }))
            .count();
        assert_eq!(progress, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_in_flight_execution() {
        let mut registry = base_registry();
        registry.register_async(
            "agent",
            Arc::new(SlowExecutor::new(Duration::from_secs(10), json!({}))),
        );
        let engine = WorkflowEngine::new(registry, EngineConfig::default());
        let run_id = engine
            .start(graph(&[("a", "agent"), ("b", "echo")], &[("a", "b")]))
            .await
            .unwrap();

        engine.stop(run_id).await.unwrap();

        let snapshot = engine.snapshot(run_id).await.unwrap();
        assert_eq!(snapshot.run_status, RunStatus::Idle);
        assert!(snapshot.active_node_ids.is_empty());

        // Long after the executor would have finished, nothing was written
        tokio::time::sleep(Duration::from_secs(30)).await;
        let later = engine.snapshot(run_id).await.unwrap();
        let record = later.record(&id("a")).unwrap();
        assert_eq!(record.status, NodeStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("run stopped"));
        assert!(later.edge_data.is_empty());
        assert_eq!(later.node_status(&id("b")), NodeStatus::Waiting);

        let again = engine.stop(run_id).await;
        assert!(matches!(again, Err(EngineError::InvalidStateTransition(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_approve_rejects_non_waiting_node_without_mutation() {
        let engine = WorkflowEngine::new(base_registry(), EngineConfig::default());
        let run_id = engine
            .start(graph(&[("a", "source"), ("m", "manualStep")], &[("a", "m")]))
            .await
            .unwrap();
        wait_for_gate(&engine, run_id, "m").await;

        let before = engine.snapshot(run_id).await.unwrap();
        let result = engine.approve(run_id, id("a"), json!({"ok": true})).await;
        assert!(matches!(result, Err(EngineError::InvalidStateTransition(_))));
        assert_eq!(engine.snapshot(run_id).await.unwrap(), before);

        let missing = engine.approve(run_id, id("ghost"), json!({})).await;
        assert_eq!(missing, Err(EngineError::NodeNotFound(id("ghost"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_approval_merges_input_and_fans_out() {
        let engine = WorkflowEngine::new(base_registry(), EngineConfig::default());
        let run_id = engine
            .start(graph(
                &[("a", "source"), ("m", "manualStep"), ("c", "echo")],
                &[("a", "m"), ("m", "c")],
            ))
            .await
            .unwrap();
        wait_for_gate(&engine, run_id, "m").await;

        engine
            .approve(run_id, id("m"), json!({"ok": true, "v": 2}))
            .await
            .unwrap();
        assert_eq!(engine.wait(run_id).await.unwrap(), RunStatus::Succeeded);

        let snapshot = engine.snapshot(run_id).await.unwrap();
        assert_eq!(
            snapshot.record(&id("m")).unwrap().output,
            Some(json!({"v": 2, "ok": true}))
        );
        assert_eq!(
            snapshot.record(&id("c")).unwrap().output,
            Some(json!({"v": 2, "ok": true}))
        );

        let second = engine.approve(run_id, id("m"), json!({})).await;
        assert!(matches!(second, Err(EngineError::InvalidStateTransition(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_runs_once_with_keyed_input() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut registry = base_registry();
        registry.register_sync("left", constant(json!({"l": 1})));
        registry.register_sync("right", constant(json!({"r": 2})));
        registry.register_sync(
            "join",
            Arc::new(FnExecutor::new(move |_, input| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(input)
            })),
        );

        let engine = WorkflowEngine::new(registry, EngineConfig::default());
        let run_id = engine
            .start(graph(
                &[("root", "source"), ("x", "left"), ("y", "right"), ("j", "join")],
                &[("root", "x"), ("root", "y"), ("x", "j"), ("y", "j")],
            ))
            .await
            .unwrap();

        assert_eq!(engine.wait(run_id).await.unwrap(), RunStatus::Succeeded);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let snapshot = engine.snapshot(run_id).await.unwrap();
        assert_eq!(
            snapshot.record(&id("j")).unwrap().input,
            Some(json!({"x": {"l": 1}, "y": {"r": 2}}))
        );

        let events = engine.events(run_id).await.unwrap();
        let transfers = events
            .iter()
            .filter(|e| matches!(e.event_type, EventType::EdgeDataUpdated { .. }))
            .count();
        assert_eq!(transfers, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_marks_descendants_failed() {
        let engine = WorkflowEngine::new(base_registry(), EngineConfig::default());
        let run_id = engine
            .start(graph(
                &[("a", "broken"), ("b", "echo"), ("c", "echo"), ("z", "source")],
                &[("a", "b"), ("b", "c")],
            ))
            .await
            .unwrap();

        assert_eq!(engine.wait(run_id).await.unwrap(), RunStatus::Failed);

        let snapshot = engine.snapshot(run_id).await.unwrap();
        assert_eq!(snapshot.record(&id("a")).unwrap().error.as_deref(), Some("boom"));
        for node in ["b", "c"] {
            let record = snapshot.record(&id(node)).unwrap();
            assert_eq!(record.status, NodeStatus::Failed);
            assert_eq!(
                record.error.as_deref(),
                Some("blocked by upstream failure: a")
            );
        }
        assert_eq!(snapshot.node_status(&id("z")), NodeStatus::Succeeded);
        assert!(snapshot.edge_data.is_empty());

        let run_error = engine
            .events(run_id)
            .await
            .unwrap()
            .into_iter()
            .find_map(|e| match e.event_type {
                EventType::RunFailed { error, .. } => Some(error),
                _ => None,
            })
            .unwrap();
        assert_eq!(run_error, "3 node(s) failed, first: Node a failed: boom");
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_executor_fails_node() {
        let mut registry = base_registry();
        registry.register_sync(
            "explode",
            Arc::new(FnExecutor::new(|_, _| panic!("kaboom"))),
        );
        let engine = WorkflowEngine::new(registry, EngineConfig::default());
        let run_id = engine
            .start(graph(&[("a", "explode"), ("b", "echo")], &[("a", "b")]))
            .await
            .unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), engine.wait(run_id))
            .await
            .expect("run should settle after a panic")
            .unwrap();
        assert_eq!(status, RunStatus::Failed);

        let snapshot = engine.snapshot(run_id).await.unwrap();
        let record = snapshot.record(&id("a")).unwrap();
        assert_eq!(record.status, NodeStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("executor panicked: kaboom"));
        assert!(snapshot.active_node_ids.is_empty());
        assert_eq!(
            snapshot.record(&id("b")).unwrap().error.as_deref(),
            Some("blocked by upstream failure: a")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_aborts_processing_sibling() {
        let mut registry = base_registry();
        registry.register_async(
            "agent",
            Arc::new(SlowExecutor::new(Duration::from_secs(10), json!({"late": true}))),
        );
        let engine = WorkflowEngine::new(registry, EngineConfig::default());
        let run_id = engine
            .start(graph(
                &[("m", "manualStep"), ("s", "agent"), ("t", "echo")],
                &[("s", "t")],
            ))
            .await
            .unwrap();

        wait_for_gate(&engine, run_id, "m").await;
        assert_eq!(
            engine.snapshot(run_id).await.unwrap().node_status(&id("s")),
            NodeStatus::Processing
        );

        engine.reject(run_id, id("m"), "no").await.unwrap();

        let snapshot = engine.snapshot(run_id).await.unwrap();
        assert_eq!(snapshot.run_status, RunStatus::Failed);
        let sibling = snapshot.record(&id("s")).unwrap();
        assert_eq!(sibling.status, NodeStatus::Failed);
        assert_eq!(sibling.error.as_deref(), Some("run aborted: node m rejected"));
        assert!(snapshot.active_node_ids.is_empty());

        // The cancelled executor never delivers its output
        tokio::time::sleep(Duration::from_secs(30)).await;
        let later = engine.snapshot(run_id).await.unwrap();
        assert!(later.edge_data.is_empty());
        assert_eq!(later.node_status(&id("s")), NodeStatus::Failed);
        assert_eq!(later.node_status(&id("t")), NodeStatus::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_pending_policy_keeps_descendants_waiting() {
        let config = EngineConfig {
            failure_policy: FailurePolicy::LeavePending,
            ..Default::default()
        };
        let engine = WorkflowEngine::new(base_registry(), config);
        let run_id = engine
            .start(graph(&[("a", "broken"), ("b", "echo")], &[("a", "b")]))
            .await
            .unwrap();

        assert_eq!(engine.wait(run_id).await.unwrap(), RunStatus::Failed);
        let snapshot = engine.snapshot(run_id).await.unwrap();
        assert_eq!(snapshot.node_status(&id("b")), NodeStatus::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume() {
        let mut registry = base_registry();
        registry.register_async(
            "agent",
            Arc::new(SlowExecutor::new(Duration::from_secs(4), json!({}))),
        );
        let engine = WorkflowEngine::new(registry, EngineConfig::default());
        let run_id = engine
            .start(graph(&[("a", "agent")], &[]))
            .await
            .unwrap();

        engine.pause(run_id).await.unwrap();
        assert!(matches!(
            engine.pause(run_id).await,
            Err(EngineError::InvalidStateTransition(_))
        ));
        assert_eq!(
            engine.snapshot(run_id).await.unwrap().run_status,
            RunStatus::Paused
        );

        // In-flight work still completes while paused
        wait_for_status(&engine, run_id, "a", NodeStatus::Succeeded).await;
        assert_eq!(
            engine.snapshot(run_id).await.unwrap().run_status,
            RunStatus::Paused
        );

        engine.resume(run_id).await.unwrap();
        assert_eq!(engine.wait(run_id).await.unwrap(), RunStatus::Succeeded);
        assert!(matches!(
            engine.resume(run_id).await,
            Err(EngineError::InvalidStateTransition(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_timeout_fails_node() {
        let mut registry = base_registry();
        registry.register_async(
            "agent",
            Arc::new(SlowExecutor::new(Duration::from_secs(20), json!({}))),
        );
        let config = EngineConfig {
            node_timeout_secs: Some(2),
            ..Default::default()
        };
        let engine = WorkflowEngine::new(registry, config);
        let run_id = engine.start(graph(&[("a", "agent")], &[])).await.unwrap();

        assert_eq!(engine.wait(run_id).await.unwrap(), RunStatus::Failed);
        let snapshot = engine.snapshot(run_id).await.unwrap();
        assert_eq!(
            snapshot.record(&id("a")).unwrap().error.as_deref(),
            Some("timed out after 2 seconds")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_bounds_fan_out() {
        let slow = SlowExecutor::new(Duration::from_secs(1), json!({}));
        let peak = slow.peak.clone();
        let mut registry = base_registry();
        registry.register_async("agent", Arc::new(slow));

        let config = EngineConfig {
            max_concurrent_nodes: Some(1),
            ..Default::default()
        };
        let engine = WorkflowEngine::new(registry, config);
        let run_id = engine
            .start(graph(
                &[("root", "source"), ("x", "agent"), ("y", "agent"), ("z", "agent")],
                &[("root", "x"), ("root", "y"), ("root", "z")],
            ))
            .await
            .unwrap();

        let agents = ["x", "y", "z"];
        let mut saw_queued = false;
        loop {
            let snapshot = engine.snapshot(run_id).await.unwrap();
            if !snapshot.run_status.is_live() {
                break;
            }
            assert!(
                snapshot.active_node_ids.len() <= 1,
                "more than one active node: {:?}",
                snapshot.active_node_ids
            );
            saw_queued |= agents.iter().any(|n| {
                snapshot
                    .record(&id(n))
                    .map_or(false, |r| r.status == NodeStatus::Waiting && r.dependencies.is_empty())
            });
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert!(saw_queued);
        assert_eq!(engine.wait(run_id).await.unwrap(), RunStatus::Succeeded);
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        let events = engine.events(run_id).await.unwrap();
        for agent in agents {
            assert_eq!(
                status_changes(&events, agent),
                vec![
                    (NodeStatus::Idle, NodeStatus::Waiting),
                    (NodeStatus::Waiting, NodeStatus::Processing),
                    (NodeStatus::Processing, NodeStatus::Succeeded),
                ]
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_evicts_oldest_finished_runs() {
        let log = Arc::new(InMemoryEventLog::new());
        let config = EngineConfig {
            max_retained_runs: Some(1),
            ..Default::default()
        };
        let engine = WorkflowEngine::with_event_log(base_registry(), config, log.clone());

        let gated = engine
            .start(graph(&[("m", "manualStep")], &[]))
            .await
            .unwrap();
        let first = engine.start(graph(&[("a", "source")], &[])).await.unwrap();
        engine.wait(first).await.unwrap();
        let second = engine.start(graph(&[("a", "source")], &[])).await.unwrap();

        // The live gated run survives even though it is the oldest
        let retained: Vec<RunId> = engine.runs().await.into_iter().map(|(id, _)| id).collect();
        assert_eq!(retained, vec![gated, second]);
        assert_eq!(
            engine.snapshot(first).await,
            Err(EngineError::RunNotFound(first))
        );
        assert!(log.get_run_events(first).await.unwrap().is_empty());
        assert!(!log.get_run_events(gated).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_rejects_bad_graphs() {
        let engine = WorkflowEngine::new(base_registry(), EngineConfig::default());

        let cyclic = graph(&[("a", "echo"), ("b", "echo")], &[("a", "b"), ("b", "a")]);
        assert_eq!(engine.start(cyclic).await, Err(EngineError::NoEntryPoint));

        let dangling = graph(&[("a", "source")], &[("a", "nowhere")]);
        assert!(matches!(
            engine.start(dangling).await,
            Err(EngineError::MalformedGraph(_))
        ));

        let unknown = graph(&[("a", "mystery")], &[]);
        assert_eq!(
            engine.start(unknown).await,
            Err(EngineError::UnknownNodeKind("mystery".to_string()))
        );

        assert!(engine.runs().await.is_empty());
        let missing = RunId::new();
        assert_eq!(
            engine.snapshot(missing).await,
            Err(EngineError::RunNotFound(missing))
        );
        assert_eq!(
            engine.pause(missing).await,
            Err(EngineError::RunNotFound(missing))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_see_run_lifecycle() {
        let engine = WorkflowEngine::new(base_registry(), EngineConfig::default());
        let mut feed = engine.subscribe();
        let run_id = engine
            .start(graph(&[("a", "source"), ("b", "echo")], &[("a", "b")]))
            .await
            .unwrap();
        engine.wait(run_id).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = feed.try_recv() {
            assert_eq!(event.run_id, run_id);
            kinds.push(event.event_type);
        }
        assert!(matches!(kinds.first(), Some(EventType::RunStarted { node_count: 2, .. })));
        assert!(matches!(kinds.last(), Some(EventType::RunCompleted { .. })));
        assert!(kinds
            .iter()
            .any(|k| matches!(k, EventType::EdgeDataUpdated { edge_id, .. } if edge_id.0 == "e1")));
    }
}
