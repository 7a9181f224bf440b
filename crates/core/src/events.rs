use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

/// An event in a run's observation feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    /// Position within the run's feed, starting at 0
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, sequence: u64, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            sequence,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events emitted while a run executes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle events
    RunStarted {
        node_count: usize,
        edge_count: usize,
    },
    RunPaused,
    RunResumed,
    RunStopped,
    RunCompleted {
        duration_ms: u64,
    },
    RunFailed {
        error: String,
        duration_ms: u64,
    },

    // Node lifecycle events, one per status transition
    NodeStatusChanged {
        node_id: NodeId,
        from: NodeStatus,
        to: NodeStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    NodeProgress {
        node_id: NodeId,
        percent: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        estimated_completion_at: Option<DateTime<Utc>>,
    },

    // Data transfer along an edge
    EdgeDataUpdated {
        edge_id: EdgeId,
        source_node_id: NodeId,
        target_node_id: NodeId,
        value: serde_json::Value,
    },

    // Approval events
    ApprovalRequested {
        node_id: NodeId,
    },
    ApprovalGranted {
        node_id: NodeId,
        data: serde_json::Value,
    },
    ApprovalRejected {
        node_id: NodeId,
        reason: String,
    },
}

/// Event log writer trait
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Get all events for a run
    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>>;

    /// Drop every event of a run
    async fn remove_run(&self, run_id: RunId) -> anyhow::Result<()>;
}

/// Event log kept in process memory, grouped by run
#[derive(Default)]
pub struct InMemoryEventLog {
    events: RwLock<HashMap<RunId, Vec<Event>>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, event: Event) -> anyhow::Result<()> {
        self.events
            .write()
            .await
            .entry(event.run_id)
            .or_default()
            .push(event);
        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>> {
        Ok(self
            .events
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn remove_run(&self, run_id: RunId) -> anyhow::Result<()> {
        self.events.write().await.remove(&run_id);
        Ok(())
    }
}

/// Live fan-out of events to subscribers.
/// All subscribers receive all events; lagging subscribers lose the oldest ones.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
