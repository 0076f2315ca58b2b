use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::coordinator::FitClient;
use crate::error::{FlError, Result};
use crate::model::{LinearTrainer, TrainOutcome};
use crate::params::{ModelSpec, ParameterSet, TensorData};
use crate::telemetry::{SystemProbe, Telemetry};
use crate::types::{ClientResult, FitConfig, FitMetrics};

/// One local epoch over private data.
pub trait LocalTrainer: Send + Sync + 'static {
    fn train_epoch(&self, params: &ParameterSet) -> Result<TrainOutcome>;

    /// Architecture the local replica expects, if known up front.
    fn model_spec(&self) -> Option<ModelSpec> {
        None
    }
}

impl LocalTrainer for LinearTrainer {
    fn train_epoch(&self, params: &ParameterSet) -> Result<TrainOutcome> {
        LinearTrainer::train_epoch(self, params)
    }

    fn model_spec(&self) -> Option<ModelSpec> {
        let ds = self.dataset();
        let probe = ParameterSet::new(vec![
            TensorData::zeros(vec![ds.classes, ds.dim]),
            TensorData::zeros(vec![ds.classes]),
        ]);
        Some(ModelSpec::of(&probe))
    }
}

/// Holds the local model replica and trains it on request.
pub struct ClientAgent<T> {
    id: String,
    trainer: Arc<T>,
    replica: RwLock<Option<ParameterSet>>,
    telemetry: Telemetry,
    probe: Mutex<SystemProbe>,
}

impl<T: LocalTrainer> ClientAgent<T> {
    pub fn new(id: impl Into<String>, trainer: T, telemetry: Telemetry) -> Self {
        Self {
            id: id.into(),
            trainer: Arc::new(trainer),
            replica: RwLock::new(None),
            telemetry,
            probe: Mutex::new(SystemProbe::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current local weights, if the agent has been given any.
    pub fn parameters(&self) -> Option<ParameterSet> {
        self.replica.read().clone()
    }

    /// Loads `parameters` into a private replica, trains one epoch and returns the update.
    pub async fn fit(&self, parameters: &ParameterSet, config: FitConfig) -> Result<ClientResult> {
        if let Some(spec) = self.trainer.model_spec() {
            spec.check(parameters)?;
        }
        let local = parameters.clone();
        let trainer = self.trainer.clone();
        let start = Instant::now();

        let outcome = tokio::task::spawn_blocking(move || trainer.train_epoch(&local))
            .await
            .map_err(|e| FlError::Training(format!("training task panicked: {e}")))?;
        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                warn!(client = %self.id, round = config.round_number, "local training failed: {e}");
                return Err(e);
            }
        };
        let seconds = start.elapsed().as_secs_f64();

        *self.replica.write() = Some(outcome.parameters.clone());
        self.report(config.round_number, seconds);
        info!(
            client = %self.id,
            round = config.round_number,
            samples = outcome.sample_count,
            loss = outcome.mean_loss,
            "finished local epoch"
        );

        Ok(ClientResult {
            parameters: outcome.parameters,
            sample_count: outcome.sample_count,
            round_number: config.round_number,
            metrics: FitMetrics { train_loss: outcome.mean_loss, train_seconds: seconds },
        })
    }

    fn report(&self, round: u32, seconds: f64) {
        let usage = self.probe.lock().sample();
        self.telemetry.report("Training Time", "local_training_seconds", seconds, round);
        self.telemetry.report("System", "Network_MB", SystemProbe::network_sent_mb(), round);
        self.telemetry.report("System", "CPU_Usage_%", usage.cpu_percent, round);
        self.telemetry.report("System", "RAM_Usage_%", usage.ram_percent, round);
    }
}

impl<T: LocalTrainer> FitClient for ClientAgent<T> {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fit(&self, parameters: Arc<ParameterSet>, config: FitConfig) -> Result<ClientResult> {
        ClientAgent::fit(self, &parameters, config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{init_parameters, LocalDataset};
    use crate::telemetry::MemorySink;
    use candle_core::Device;

    struct Failing;

    impl LocalTrainer for Failing {
        fn train_epoch(&self, _: &ParameterSet) -> Result<TrainOutcome> {
            Err(FlError::Dataset("corrupted labels".into()))
        }
    }

    fn linear_agent(telemetry: Telemetry) -> ClientAgent<LinearTrainer> {
        let ds = LocalDataset::synthetic(5, 16, 3, 2, 0.1);
        ClientAgent::new("client_1", LinearTrainer::new(ds, 4, 0.1, Device::Cpu), telemetry)
    }

    #[tokio::test]
    async fn fit_returns_update_for_requested_round() {
        let memory = Arc::new(MemorySink::new());
        let agent = linear_agent(Telemetry::new().with_sink(memory.clone()));
        let global = init_parameters(3, 2, 0);

        let result = agent.fit(&global, FitConfig { round_number: 4 }).await.unwrap();
        assert_eq!(result.round_number, 4);
        assert_eq!(result.sample_count, 16);
        assert_eq!(result.parameters.shapes(), global.shapes());
        assert_eq!(agent.parameters(), Some(result.parameters.clone()));
        assert_eq!(memory.values("Training Time", "local_training_seconds").len(), 1);
        assert_eq!(memory.values("System", "RAM_Usage_%")[0].0, 4);
    }

    #[tokio::test]
    async fn fit_does_not_touch_callers_parameters() {
        let agent = linear_agent(Telemetry::new());
        let global = init_parameters(3, 2, 1);
        let copy = global.clone();
        let result = agent.fit(&global, FitConfig { round_number: 1 }).await.unwrap();
        assert_eq!(global, copy);
        assert_ne!(result.parameters, global);
    }

    #[tokio::test]
    async fn fit_rejects_foreign_architecture() {
        let agent = linear_agent(Telemetry::new());
        let err = agent.fit(&init_parameters(5, 2, 0), FitConfig { round_number: 1 }).await.unwrap_err();
        assert!(matches!(err, FlError::ShapeMismatch { .. }));
        assert!(agent.parameters().is_none());
    }

    #[tokio::test]
    async fn training_failure_reports_error_not_parameters() {
        let agent = ClientAgent::new("broken", Failing, Telemetry::new());
        let err = agent.fit(&init_parameters(2, 2, 0), FitConfig { round_number: 2 }).await.unwrap_err();
        assert!(matches!(err, FlError::Dataset(_)));
        assert!(agent.parameters().is_none());
    }
}
