use std::time::Duration;

mod control;
pub mod metrics;
pub mod runtime;
mod sink;
pub mod task;

pub use metrics::TaskMetrics;
pub use runtime::Runtime;
pub use sink::TaskSink;
pub use task::{Phase, TaskRunner};

/// Tunables of the task supervisor.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How often live tasks persist positions and metrics.
    pub save_interval: Duration,
    /// Pause between stopping an instance and starting its replacement.
    pub restart_grace: Duration,
    /// Snapshot page size for tasks that do not set one.
    pub batch_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            save_interval: Duration::from_secs(5),
            restart_grace: Duration::from_secs(1),
            batch_size: 1000,
        }
    }
}
