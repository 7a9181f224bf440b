pub mod engine;
pub mod graph;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod state;

pub use engine::WorkflowEngine;
pub use graph::WorkflowDag;
pub use registry::{
    ExecutionContext, ExecutorCategory, ExecutorError, ExecutorRegistry, FnExecutor,
    NodeBehavior, NodeExecutor, ProgressReporter, ProgressUpdate,
};
pub use resolver::{runnable_now, scheduling_order, DependencyTracker, Readiness};
pub use scheduler::ControlAction;
pub use state::{ExecutionStateStore, NodePatch};
