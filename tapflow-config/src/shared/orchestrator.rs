use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::load::Config;
use crate::shared::{PipelineDefinition, RetryConfig, StateStoreConfig, ValidationError};

const fn default_max_parallel_runs() -> u16 {
    4
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("runs")
}

/// Top level configuration of the orchestrator process.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OrchestratorConfig {
    /// Upper bound on pipeline runs active at the same time.
    #[serde(default = "default_max_parallel_runs")]
    pub max_parallel_runs: u16,
    /// Root of the per run directories (`<work_dir>/<pipeline_id>/<run_id>/`).
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub state_store: StateStoreConfig,
    #[serde(default)]
    pub lock: LockConfig,
    /// Applied to checkpoint commits only.
    #[serde(default)]
    pub checkpoint_retry: RetryConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Prometheus exporter, disabled when absent.
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    /// Directory for rolling log files. Logs go to stdout when absent.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub pipelines: Vec<PipelineDefinition>,
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_parallel_runs == 0 {
            return Err(ValidationError::MaxParallelRunsZero);
        }

        self.state_store.validate()?;
        self.checkpoint_retry.validate()?;

        let mut seen = HashSet::new();
        for pipeline in &self.pipelines {
            pipeline.validate()?;

            if !seen.insert(pipeline.id.as_str()) {
                return Err(ValidationError::DuplicatePipelineId(pipeline.id.clone()));
            }
        }

        Ok(())
    }

    pub fn pipeline(&self, id: &str) -> Option<&PipelineDefinition> {
        self.pipelines.iter().find(|pipeline| pipeline.id == id)
    }
}

impl Config for OrchestratorConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}

/// Target lock acquisition behavior.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LockConfig {
    /// How long a run waits for its target lock before it is requeued.
    pub acquire_timeout_ms: u64,
    /// Pause before a requeued run tries again.
    pub requeue_delay_ms: u64,
    /// Requeues allowed before the run fails. Unlimited when absent.
    #[serde(default)]
    pub max_requeues: Option<u32>,
}

impl LockConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 30_000,
            requeue_delay_ms: 1_000,
            max_requeues: None,
        }
    }
}

/// Child process handling.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SupervisorConfig {
    /// Time between the polite stop request and the forced kill.
    pub terminate_grace_ms: u64,
    /// Number of trailing stderr lines kept per process for failure reports.
    pub stderr_tail_lines: usize,
}

impl SupervisorConfig {
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            terminate_grace_ms: 10_000,
            stderr_tail_lines: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MetricsConfig {
    /// Socket address the Prometheus exporter listens on, for example `0.0.0.0:9000`.
    pub listen_address: String,
}
