use crate::error::{EngineError, EngineResult};
use crate::types::{Node, NodeId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How the scheduler drives a node kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorCategory {
    /// `idle -> running -> terminal`, expected to resolve quickly
    Synchronous,
    /// `idle -> processing -> terminal`, reports progress while it works
    Asynchronous,
    /// `idle -> waiting`, resolved only by approve/reject
    ManualGate,
}

/// Failure reported by an executor
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ExecutorError(pub String);

impl From<String> for ExecutorError {
    fn from(reason: String) -> Self {
        Self(reason)
    }
}

impl From<&str> for ExecutorError {
    fn from(reason: &str) -> Self {
        Self(reason.to_string())
    }
}

/// One progress report from an asynchronous executor
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub percent: u8,
    pub message: Option<String>,
    pub estimated_completion_at: Option<DateTime<Utc>>,
}

/// Sink for progress reports; delivery goes through the run's scheduler
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn Fn(ProgressUpdate) + Send + Sync>,
}

impl ProgressReporter {
    pub fn new(sink: impl Fn(ProgressUpdate) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// Reporter that drops everything
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn report(&self, update: ProgressUpdate) {
        (self.sink)(ProgressUpdate {
            percent: update.percent.min(100),
            ..update
        })
    }
}

/// Everything an executor gets besides the node and its input
#[derive(Clone)]
pub struct ExecutionContext {
    pub run_id: RunId,
    pub node_id: NodeId,
    /// Tripped when the run is stopped or aborted
    pub cancel: CancellationToken,
    progress: ProgressReporter,
}

impl ExecutionContext {
    pub fn new(
        run_id: RunId,
        node_id: NodeId,
        cancel: CancellationToken,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            run_id,
            node_id,
            cancel,
            progress,
        }
    }

    pub fn report_progress(
        &self,
        percent: u8,
        message: Option<String>,
        estimated_completion_at: Option<DateTime<Utc>>,
    ) {
        self.progress.report(ProgressUpdate {
            percent,
            message,
            estimated_completion_at,
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Performs the actual work of a node.
///
/// The engine treats implementations as opaque: it hands over the node and
/// its input and expects an output value or a failure reason back.
#[async_trait::async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(
        &self,
        node: &Node,
        input: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ExecutorError>;
}

/// Executor backed by a plain closure
pub struct FnExecutor<F> {
    func: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(&Node, serde_json::Value) -> Result<serde_json::Value, ExecutorError> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait::async_trait]
impl<F> NodeExecutor for FnExecutor<F>
where
    F: Fn(&Node, serde_json::Value) -> Result<serde_json::Value, ExecutorError> + Send + Sync,
{
    async fn execute(
        &self,
        node: &Node,
        input: serde_json::Value,
        _ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ExecutorError> {
        (self.func)(node, input)
    }
}

/// Behavior bound to a node kind
#[derive(Clone)]
pub enum NodeBehavior {
    Synchronous(Arc<dyn NodeExecutor>),
    Asynchronous(Arc<dyn NodeExecutor>),
    ManualGate,
}

impl NodeBehavior {
    pub fn category(&self) -> ExecutorCategory {
        match self {
            Self::Synchronous(_) => ExecutorCategory::Synchronous,
            Self::Asynchronous(_) => ExecutorCategory::Asynchronous,
            Self::ManualGate => ExecutorCategory::ManualGate,
        }
    }
}

/// Maps node kinds to behavior categories and executors
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    behaviors: HashMap<String, NodeBehavior>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_sync(&mut self, kind: impl Into<String>, executor: Arc<dyn NodeExecutor>) {
        self.register(kind, NodeBehavior::Synchronous(executor));
    }

    pub fn register_async(&mut self, kind: impl Into<String>, executor: Arc<dyn NodeExecutor>) {
        self.register(kind, NodeBehavior::Asynchronous(executor));
    }

    pub fn register_manual_gate(&mut self, kind: impl Into<String>) {
        self.register(kind, NodeBehavior::ManualGate);
    }

    /// Bind a kind, replacing any earlier binding
    pub fn register(&mut self, kind: impl Into<String>, behavior: NodeBehavior) {
        let kind = kind.into();
        tracing::debug!("Registered node kind {} as {:?}", kind, behavior.category());
        self.behaviors.insert(kind, behavior);
    }

    pub fn resolve(&self, kind: &str) -> EngineResult<&NodeBehavior> {
        self.behaviors
            .get(kind)
            .ok_or_else(|| EngineError::UnknownNodeKind(kind.to_string()))
    }

    /// Registered kinds with their categories, sorted by kind
    pub fn kinds(&self) -> Vec<(String, ExecutorCategory)> {
        let mut kinds: Vec<_> = self
            .behaviors
            .iter()
            .map(|(kind, behavior)| (kind.clone(), behavior.category()))
            .collect();
        kinds.sort_by(|a, b| a.0.cmp(&b.0));
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_resolve_by_kind() {
        let mut registry = ExecutorRegistry::new();
        registry.register_sync(
            "transform",
            Arc::new(FnExecutor::new(|_, input| Ok(input))),
        );
        registry.register_manual_gate("manualStep");

        assert_eq!(
            registry.resolve("transform").unwrap().category(),
            ExecutorCategory::Synchronous
        );
        assert_eq!(
            registry.resolve("manualStep").unwrap().category(),
            ExecutorCategory::ManualGate
        );
        assert_eq!(
            registry.resolve("llm").err(),
            Some(EngineError::UnknownNodeKind("llm".to_string()))
        );
        assert_eq!(
            registry.kinds(),
            vec![
                ("manualStep".to_string(), ExecutorCategory::ManualGate),
                ("transform".to_string(), ExecutorCategory::Synchronous),
            ]
        );
    }

    #[tokio::test]
    async fn test_fn_executor_and_progress_clamp() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let ctx = ExecutionContext::new(
            RunId::new(),
            NodeId::new("n"),
            CancellationToken::new(),
            ProgressReporter::new(move |u| sink.lock().unwrap().push(u.percent)),
        );

        ctx.report_progress(250, None, None);
        assert_eq!(*seen.lock().unwrap(), vec![100]);

        let executor = FnExecutor::new(|node, _| Ok(serde_json::json!({ "from": node.id.0 })));
        let output = executor
            .execute(&Node::new("n", "transform"), serde_json::json!({}), &ctx)
            .await
            .unwrap();
        assert_eq!(output["from"], "n");
    }
}
