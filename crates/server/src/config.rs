use crate::simulation;
use anyhow::{Context, Result};
use flowrun_core::workflow::WorkflowEngine;
use flowrun_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Timing of the built-in simulated executors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_min_latency_ms")]
    pub min_latency_ms: u64,

    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,

    /// Progress reports emitted by each long-running node
    #[serde(default = "default_progress_steps")]
    pub progress_steps: u32,
}

fn default_min_latency_ms() -> u64 {
    100
}

fn default_max_latency_ms() -> u64 {
    500
}

fn default_progress_steps() -> u32 {
    5
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            min_latency_ms: default_min_latency_ms(),
            max_latency_ms: default_max_latency_ms(),
            progress_steps: default_progress_steps(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        // Load config file if it exists, otherwise use defaults
        let config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::default()
        };

        if config.simulation.min_latency_ms > config.simulation.max_latency_ms {
            anyhow::bail!(
                "simulation.min_latency_ms ({}) exceeds simulation.max_latency_ms ({})",
                config.simulation.min_latency_ms,
                config.simulation.max_latency_ms
            );
        }

        Ok(config)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Self {
        let registry = simulation::build_registry(&config.simulation);
        let engine = Arc::new(WorkflowEngine::new(registry, config.engine.clone()));
        Self { engine }
    }
}
