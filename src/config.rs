use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use tokio::task::JoinHandle;

use crate::coordinator::RoundConfig;
use crate::drift::{DriftGuard, DEFAULT_DRIFT_THRESHOLD};
use crate::strategy::{StrategyKind, Strategy, Validator};
use crate::telemetry::{JsonLinesSink, Telemetry, TracingSink};

/// Round orchestration flags shared by `server` and `demo`.
#[derive(Debug, Clone, Args)]
pub struct RoundArgs {
    #[arg(long, env = "FL_ROUNDS", default_value_t = 5)]
    pub rounds: u32,
    #[arg(long, env = "FL_MIN_CLIENTS", default_value_t = 3)]
    pub min_clients: usize,
    #[arg(long, env = "FL_FRACTION_FIT", default_value_t = 1.0)]
    pub fraction_fit: f64,
    #[arg(long, env = "FL_ROUND_TIMEOUT_SECS", default_value_t = 600)]
    pub round_timeout_secs: u64,
    #[arg(long, env = "FL_CLIENT_WAIT_SECS", default_value_t = 60)]
    pub client_wait_secs: u64,
    #[arg(long, env = "FL_STRATEGY", value_enum, default_value_t = StrategyKind::DriftGuarded)]
    pub strategy: StrategyKind,
    /// Relative map50 drop that triggers a rollback
    #[arg(long, env = "FL_DRIFT_THRESHOLD", default_value_t = DEFAULT_DRIFT_THRESHOLD)]
    pub drift_threshold: f64,
    /// Where accepted global weights are written after each round
    #[arg(long, env = "FL_CHECKPOINT")]
    pub checkpoint: Option<PathBuf>,
    /// Start from a saved checkpoint instead of fresh weights
    #[arg(long, env = "FL_RESUME")]
    pub resume: Option<PathBuf>,
    /// Append every metric as a JSON line to this file
    #[arg(long, env = "FL_METRICS_FILE")]
    pub metrics_file: Option<PathBuf>,
    #[arg(long, env = "FL_SEED", default_value_t = 0)]
    pub seed: u64,
}

impl RoundArgs {
    pub fn round_config(&self) -> RoundConfig {
        RoundConfig {
            fraction_fit: self.fraction_fit.clamp(0.0, 1.0),
            round_timeout: Duration::from_secs(self.round_timeout_secs),
            client_wait: Duration::from_secs(self.client_wait_secs),
            checkpoint: self.checkpoint.clone(),
        }
    }

    pub fn strategy(&self, validator: Arc<dyn Validator>) -> Strategy {
        match self.strategy {
            StrategyKind::Fedavg => Strategy::FedAvg { validator: Some(validator) },
            StrategyKind::DriftGuarded => {
                Strategy::DriftGuarded { guard: DriftGuard::new(self.drift_threshold), validator }
            }
        }
    }
}

/// Local training flags shared by `client` and `demo`.
#[derive(Debug, Clone, Args)]
pub struct TrainArgs {
    #[arg(long, env = "FL_BATCH_SIZE", default_value_t = 4)]
    pub batch_size: usize,
    #[arg(long, env = "FL_LEARNING_RATE", default_value_t = 0.1)]
    pub learning_rate: f64,
}

/// Tracing sink plus an optional JSON lines file; the handle drains the file writer.
pub async fn telemetry(metrics_file: Option<PathBuf>) -> anyhow::Result<(Telemetry, Option<JoinHandle<()>>)> {
    let telemetry = Telemetry::new().with_sink(Arc::new(TracingSink));
    match metrics_file {
        Some(path) => {
            let (sink, handle) = JsonLinesSink::spawn(path).await?;
            Ok((telemetry.with_sink(Arc::new(sink)), Some(handle)))
        }
        None => Ok((telemetry, None)),
    }
}
