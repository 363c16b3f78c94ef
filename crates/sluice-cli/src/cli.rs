use clap::{Args, Parser, Subcommand};

/// Drive the sluice engine against simulated executors.
///
/// Engine settings come from `SLUICE_*` variables (a `.env` file is loaded
/// first); the flags below only shape the simulated workload.
#[derive(Parser, Debug)]
#[command(name = "sluice", about = "Resource-aware task execution demo")]
pub struct CliArgs {
    /// Load engine settings from this JSON file instead of the environment
    #[arg(long, env = "SLUICE_CONFIG")]
    pub config: Option<String>,

    #[command(flatten)]
    pub workload: Workload,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct Workload {
    /// Number of work items
    #[arg(long, default_value = "50", global = true)]
    pub items: usize,

    /// Simulated latency of one item in milliseconds
    #[arg(long, default_value = "20", global = true)]
    pub latency_ms: u64,

    /// Every n-th call fails (0 disables failures)
    #[arg(long, default_value = "0", global = true)]
    pub fail_every: u32,

    /// Simulated memory use as a percentage of the configured limit
    #[arg(long, default_value = "30", global = true)]
    pub memory_percent: f64,

    /// Memory released per reclaim, as a percentage of the limit
    #[arg(long, default_value = "5", global = true)]
    pub reclaim_percent: f64,
}

#[derive(Subcommand, Debug, Clone, Copy)]
pub enum Command {
    /// Enqueue everything and drain the task queue until empty
    Drain,
    /// Process the items chunk by chunk
    Stream,
    /// Producer/consumer with retries and a circuit breaker
    Advanced,
    /// Batches sized from observed latency
    Adaptive,
    /// Print the effective engine configuration
    Config,
}
