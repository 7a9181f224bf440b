use crate::config::SimulationConfig;
use async_trait::async_trait;
use chrono::Utc;
use flowrun_core::workflow::{
    ExecutionContext, ExecutorCategory, ExecutorError, ExecutorRegistry, NodeExecutor,
};
use flowrun_core::Node;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Catalogue entry for a built-in node kind
#[derive(Debug, Clone, Serialize)]
pub struct NodeKindInfo {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub label: &'static str,
    pub description: &'static str,
    pub category: ExecutorCategory,
    pub inputs: &'static [&'static str],
    pub outputs: &'static [&'static str],
}

pub const NODE_KINDS: &[NodeKindInfo] = &[
    NodeKindInfo {
        kind: "agent",
        label: "Agent",
        description: "Autonomous agent that can perform tasks",
        category: ExecutorCategory::Asynchronous,
        inputs: &["input"],
        outputs: &["output"],
    },
    NodeKindInfo {
        kind: "llm",
        label: "LLM",
        description: "Large Language Model processor",
        category: ExecutorCategory::Asynchronous,
        inputs: &["prompt"],
        outputs: &["completion"],
    },
    NodeKindInfo {
        kind: "dataSource",
        label: "Data Source",
        description: "External data source connector",
        category: ExecutorCategory::Synchronous,
        inputs: &[],
        outputs: &["data"],
    },
    NodeKindInfo {
        kind: "transform",
        label: "Transform",
        description: "Data transformation processor",
        category: ExecutorCategory::Synchronous,
        inputs: &["input"],
        outputs: &["output"],
    },
    NodeKindInfo {
        kind: "fileUpload",
        label: "File Upload",
        description: "File upload and processing",
        category: ExecutorCategory::Synchronous,
        inputs: &[],
        outputs: &["files"],
    },
    NodeKindInfo {
        kind: "conditional",
        label: "Conditional",
        description: "Evaluates a condition against its input",
        category: ExecutorCategory::Synchronous,
        inputs: &["input"],
        outputs: &["output"],
    },
    NodeKindInfo {
        kind: "manualStep",
        label: "Manual Step",
        description: "Human-in-the-loop approval step",
        category: ExecutorCategory::ManualGate,
        inputs: &["input"],
        outputs: &["output"],
    },
];

/// Registry with a simulated executor bound to every built-in kind
pub fn build_registry(timing: &SimulationConfig) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    for info in NODE_KINDS {
        let executor = Arc::new(SimulatedExecutor::new(info.kind, timing.clone()));
        match info.category {
            ExecutorCategory::Synchronous => registry.register_sync(info.kind, executor),
            ExecutorCategory::Asynchronous => registry.register_async(info.kind, executor),
            ExecutorCategory::ManualGate => registry.register_manual_gate(info.kind),
        }
    }
    registry
}

/// Stand-in executor that sleeps for a random latency and fabricates output.
///
/// Long-running kinds split their work into `progress_steps` slices and
/// report progress after each one. Any node whose config carries a `fail`
/// string fails with that reason.
pub struct SimulatedExecutor {
    kind: &'static str,
    timing: SimulationConfig,
}

impl SimulatedExecutor {
    pub fn new(kind: &'static str, timing: SimulationConfig) -> Self {
        Self { kind, timing }
    }

    fn latency(&self) -> Duration {
        let (min, max) = (self.timing.min_latency_ms, self.timing.max_latency_ms);
        let ms = if min >= max {
            min
        } else {
            rand::thread_rng().gen_range(min..=max)
        };
        Duration::from_millis(ms)
    }

    async fn run_in_steps(&self, ctx: &ExecutionContext) -> Result<(), ExecutorError> {
        let steps = self.timing.progress_steps.max(1);
        let step = self.latency();

        for i in 1..=steps {
            if ctx.is_cancelled() {
                return Err(ExecutorError::from("cancelled"));
            }
            tokio::time::sleep(step).await;

            let remaining = step * (steps - i);
            let eta = chrono::Duration::from_std(remaining)
                .ok()
                .map(|d| Utc::now() + d);
            ctx.report_progress(
                (i * 100 / steps) as u8,
                Some(format!("step {}/{}", i, steps)),
                eta,
            );
        }
        Ok(())
    }
}

#[async_trait]
impl NodeExecutor for SimulatedExecutor {
    async fn execute(
        &self,
        node: &Node,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<Value, ExecutorError> {
        match self.kind {
            "agent" | "llm" => self.run_in_steps(ctx).await?,
            _ => tokio::time::sleep(self.latency()).await,
        }

        if let Some(reason) = node.config.get("fail").and_then(Value::as_str) {
            return Err(ExecutorError::from(reason));
        }
        Ok(simulate_output(self.kind, node, input))
    }
}

fn simulate_output(kind: &str, node: &Node, input: Value) -> Value {
    let config = &node.config;
    match kind {
        "dataSource" => json!({
            "source": config.get("source").cloned().unwrap_or_else(|| json!(node.id.0)),
            "records": config
                .get("records")
                .cloned()
                .unwrap_or_else(|| json!([{"id": 1}, {"id": 2}, {"id": 3}])),
        }),
        "transform" => json!({
            "operation": config.get("operation").cloned().unwrap_or_else(|| json!("identity")),
            "data": input,
        }),
        "fileUpload" => json!({
            "files": config.get("files").cloned().unwrap_or_else(|| json!([])),
        }),
        "conditional" => json!({
            "branch": evaluate_condition(config.get("condition"), &input),
            "data": input,
        }),
        "agent" => json!({
            "agent": node.id.0,
            "result": format!("Agent {} completed its task", node.id),
            "input": input,
        }),
        "llm" => json!({
            "model": config.get("model").cloned().unwrap_or_else(|| json!("simulated")),
            "completion": format!("Simulated completion for {}", node.id),
        }),
        _ => input,
    }
}

/// A boolean condition is taken as-is; a string names an input field whose
/// truthiness decides; anything else is true.
fn evaluate_condition(condition: Option<&Value>, input: &Value) -> bool {
    match condition {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(field)) => match input.get(field) {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(Value::Number(n)) => n.as_f64().map_or(false, |v| v != 0.0),
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(_) => true,
        },
        _ => true,
    }
}
