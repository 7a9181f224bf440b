use serde::{Deserialize, Serialize};

/// What happens to the descendants of a failed node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Mark every non-terminal descendant failed ("blocked by upstream failure")
    #[default]
    FailDownstream,
    /// Leave descendants idle or waiting; the run settles without them
    LeavePending,
}

/// Execution engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the live event broadcast channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Upper bound on node executions in flight per run; unbounded when unset
    #[serde(default)]
    pub max_concurrent_nodes: Option<usize>,

    /// Executions running longer than this fail with a timeout reason
    #[serde(default)]
    pub node_timeout_secs: Option<u64>,

    /// Finalized runs kept for inspection; the oldest are evicted past this.
    /// Unbounded when unset.
    #[serde(default)]
    pub max_retained_runs: Option<usize>,
}

fn default_event_buffer() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_buffer: default_event_buffer(),
            failure_policy: FailurePolicy::default(),
            max_concurrent_nodes: None,
            node_timeout_secs: None,
            max_retained_runs: None,
        }
    }
}
