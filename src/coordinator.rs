//! Round orchestration: client sampling, concurrent dispatch, aggregation and drift handling.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::drift::DriftState;
use crate::error::{FlError, Result};
use crate::params::{save_checkpoint, ModelSpec, ParameterSet};
use crate::strategy::{RoundOutcome, Strategy};
use crate::telemetry::{SystemProbe, Telemetry};
use crate::types::{Accuracy, ClientResult, FitConfig, Phase};

/// Anything the coordinator can ask to train a round: a remote process or an in-process agent.
pub trait FitClient: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn fit(&self, parameters: Arc<ParameterSet>, config: FitConfig) -> impl Future<Output = Result<ClientResult>> + Send;
}

/// Connected clients, shared with whatever accepts registrations.
pub struct ClientRegistry<C> {
    clients: RwLock<Vec<Arc<C>>>,
    joined: Notify,
}

impl<C> Default for ClientRegistry<C> {
    fn default() -> Self {
        Self { clients: RwLock::new(Vec::new()), joined: Notify::new() }
    }
}

impl<C: FitClient> ClientRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a client, replacing any earlier registration with the same id.
    pub fn register(&self, client: C) {
        {
            let mut clients = self.clients.write();
            clients.retain(|c| c.id() != client.id());
            clients.push(Arc::new(client));
        }
        self.joined.notify_waiters();
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut clients = self.clients.write();
        let before = clients.len();
        clients.retain(|c| c.id() != id);
        clients.len() != before
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<C>> {
        self.clients.read().clone()
    }

    /// Waits until at least `min` clients are connected or `timeout` passes; returns the count.
    pub async fn wait_for(&self, min: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let joined = self.joined.notified();
            let n = self.len();
            if n >= min {
                return n;
            }
            if tokio::time::timeout_at(deadline, joined).await.is_err() {
                return self.len();
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoundConfig {
    /// Share of connected clients sampled each round, never below the quorum.
    pub fraction_fit: f64,
    pub round_timeout: Duration,
    /// How long an empty round waits for registrations.
    pub client_wait: Duration,
    pub checkpoint: Option<PathBuf>,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            fraction_fit: 1.0,
            round_timeout: Duration::from_secs(600),
            client_wait: Duration::from_secs(60),
            checkpoint: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round_number: u32,
    pub participating_client_count: usize,
    pub failure_count: usize,
    pub duration_seconds: f64,
    #[serde(skip)]
    pub aggregated_parameters: Option<Arc<ParameterSet>>,
    pub validation_accuracy: Option<Accuracy>,
    pub outcome: RoundOutcome,
}

/// Everything carried from one round to the next.
#[derive(Debug, Clone)]
pub struct CoordinatorState {
    pub global: Arc<ParameterSet>,
    pub drift: DriftState,
    pub history: Vec<RoundRecord>,
}

impl CoordinatorState {
    pub fn new(initial: ParameterSet) -> Self {
        Self { global: Arc::new(initial), drift: DriftState::new(), history: Vec::new() }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub history: Vec<RoundRecord>,
    pub parameters: Arc<ParameterSet>,
    /// Accuracy of the last accepted model, when one was validated.
    pub accuracy: Option<f64>,
    pub total_seconds: f64,
}

/// Read-only view of the run, published after every round.
#[derive(Debug, Clone)]
pub struct Progress {
    pub phase: Phase,
    pub round: u32,
    /// Accuracy of the global model currently held, so a reverted candidate never shows up here.
    pub last_accuracy: Option<Accuracy>,
    pub history: Vec<RoundRecord>,
    pub global: Option<Arc<ParameterSet>>,
}

impl Default for Progress {
    fn default() -> Self {
        Self { phase: Phase::Waiting, round: 0, last_accuracy: None, history: Vec::new(), global: None }
    }
}

pub struct Coordinator<C> {
    registry: Arc<ClientRegistry<C>>,
    strategy: Strategy,
    telemetry: Telemetry,
    config: RoundConfig,
    progress: Arc<RwLock<Progress>>,
    probe: Mutex<SystemProbe>,
}

impl<C: FitClient> Coordinator<C> {
    pub fn new(registry: Arc<ClientRegistry<C>>, strategy: Strategy, telemetry: Telemetry, config: RoundConfig) -> Self {
        Self {
            registry,
            strategy,
            telemetry,
            config,
            progress: Arc::new(RwLock::new(Progress::default())),
            probe: Mutex::new(SystemProbe::new()),
        }
    }

    pub fn progress(&self) -> Arc<RwLock<Progress>> {
        self.progress.clone()
    }

    /// Runs `num_rounds` rounds in sequence. Only a shape mismatch ends the run early.
    pub async fn run(&self, num_rounds: u32, min_clients: usize, initial: ParameterSet) -> Result<RunSummary> {
        let started = Instant::now();
        let spec = ModelSpec::of(&initial);
        let mut state = CoordinatorState::new(initial);
        {
            let mut p = self.progress.write();
            p.phase = Phase::Training;
            p.global = Some(state.global.clone());
        }
        info!(rounds = num_rounds, min_clients, strategy = ?self.strategy, "starting federated run");

        for round in 1..=num_rounds {
            state = match self.run_round(round, min_clients, &spec, state).await {
                Ok(next) => next,
                Err(e) => {
                    error!(round, "aborting run: {e}");
                    self.progress.write().phase = Phase::Failed;
                    return Err(e);
                }
            };
        }

        let total_seconds = started.elapsed().as_secs_f64();
        self.telemetry.report("Summary", "Total FL Time (s)", total_seconds, 0);
        self.progress.write().phase = Phase::Finished;
        info!("total FL runtime: {total_seconds:.2} seconds");

        let accuracy = state.drift.previous_accuracy().or_else(|| {
            state
                .history
                .iter()
                .rev()
                .find(|r| r.outcome == RoundOutcome::Accepted)
                .and_then(|r| r.validation_accuracy.map(|a| a.map50))
        });
        Ok(RunSummary { history: state.history, parameters: state.global, accuracy, total_seconds })
    }

    /// Plays one round against the state left by the previous one and returns the new state.
    pub async fn run_round(
        &self,
        round: u32,
        min_clients: usize,
        spec: &ModelSpec,
        mut state: CoordinatorState,
    ) -> Result<CoordinatorState> {
        self.progress.write().round = round;

        if self.registry.is_empty() {
            info!(round, min_clients, "no clients connected, waiting");
            self.registry.wait_for(min_clients, self.config.client_wait).await;
        }
        let started = Instant::now();
        let sampled = self.sample(round, min_clients);
        let config = FitConfig { round_number: round };
        let (results, failures) = self.collect(&sampled, &state.global, config).await?;

        for r in &results {
            spec.check(&r.parameters)?;
        }

        let participants = results.len();
        let quorum = sampled.len().min(min_clients);
        if participants > 0 && participants < quorum {
            warn!(round, participants, quorum, "fewer results than quorum, aggregating what arrived");
        }

        let (conclusion, drift) = self.strategy.conclude(round, &results, &state.global, state.drift).await?;
        drop(results);
        let duration = started.elapsed().as_secs_f64();

        self.telemetry.report("Round Duration", "duration", duration, round);
        self.telemetry.report("Client Participation", "count", participants as f64, round);

        match conclusion.outcome {
            RoundOutcome::Skipped => info!(round, failures, "no parameters to aggregate, round skipped"),
            outcome => {
                if let Some(candidate) = &conclusion.candidate {
                    self.telemetry.report("Model Size", "MB", candidate.size_bytes() as f64 / 1e6, round);
                }
                let usage = self.probe.lock().sample();
                self.telemetry.report("System", "Server_CPU_Usage_%", usage.cpu_percent, round);
                self.telemetry.report("System", "Server_RAM_Usage_%", usage.ram_percent, round);
                if let Some(acc) = conclusion.accuracy {
                    self.telemetry.report("Validation", "avg_mAP@0.5", acc.map50, round);
                    self.telemetry.report("Validation", "avg_mAP@0.5:0.95", acc.map50_95, round);
                }
                if outcome == RoundOutcome::Reverted {
                    self.telemetry.report("Drift", "Reverted", 1.0, round);
                }
                if outcome == RoundOutcome::Accepted {
                    self.persist(round, &conclusion.parameters).await;
                }
                info!(round, participants, failures, ?outcome, "round complete");
            }
        }

        let record = RoundRecord {
            round_number: round,
            participating_client_count: participants,
            failure_count: failures,
            duration_seconds: duration,
            aggregated_parameters: conclusion.candidate,
            validation_accuracy: conclusion.accuracy,
            outcome: conclusion.outcome,
        };
        state.global = conclusion.parameters;
        state.drift = drift;
        state.history.push(record);

        {
            let mut p = self.progress.write();
            p.history = state.history.clone();
            p.global = Some(state.global.clone());
            if let Some(accepted) = state.history.last().filter(|r| r.outcome == RoundOutcome::Accepted) {
                p.last_accuracy = accepted.validation_accuracy.or(p.last_accuracy);
            }
        }
        Ok(state)
    }

    fn sample(&self, round: u32, min_clients: usize) -> Vec<Arc<C>> {
        let clients = self.registry.snapshot();
        let connected = clients.len();
        let quorum = connected.min(min_clients);
        let wanted = ((self.config.fraction_fit * connected as f64).ceil() as usize).max(quorum).min(connected);
        info!(round, connected, quorum, sampled = wanted, "configuring fit");
        clients.choose_multiple(&mut rand::thread_rng(), wanted).cloned().collect()
    }

    /// Dispatches `fit` to every sampled client and gathers what arrives before the deadline.
    ///
    /// A client rejecting the global model's shape is returned as `Err`; other failures are counted.
    async fn collect(
        &self,
        sampled: &[Arc<C>],
        global: &Arc<ParameterSet>,
        config: FitConfig,
    ) -> Result<(Vec<ClientResult>, usize)> {
        let deadline = Instant::now() + self.config.round_timeout;
        let mut pending: FuturesUnordered<_> = sampled
            .iter()
            .map(|client| {
                let client = client.clone();
                let params = global.clone();
                async move {
                    let outcome = client.fit(params, config).await;
                    (client, outcome)
                }
            })
            .collect();

        let mut results = Vec::with_capacity(sampled.len());
        let mut failures = 0;
        loop {
            let next = tokio::time::timeout_at(deadline, pending.next()).await;
            match next {
                Ok(Some((_, Ok(result)))) if result.round_number == config.round_number => results.push(result),
                Ok(Some((client, Ok(result)))) => {
                    warn!(
                        client = client.id(),
                        round = config.round_number,
                        got = result.round_number,
                        "discarding result for another round"
                    );
                    failures += 1;
                }
                Ok(Some((client, Err(e)))) if e.is_fatal() => {
                    error!(client = client.id(), round = config.round_number, "client disagrees on the model: {e}");
                    return Err(e);
                }
                Ok(Some((client, Err(e)))) => {
                    warn!(client = client.id(), round = config.round_number, "client did not participate: {e}");
                    failures += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(round = config.round_number, late = pending.len(), "round timed out");
                    failures += pending.len();
                    break;
                }
            }
        }
        Ok((results, failures))
    }

    async fn persist(&self, round: u32, params: &Arc<ParameterSet>) {
        let Some(path) = self.config.checkpoint.clone() else {
            return;
        };
        let params = params.clone();
        let saved = tokio::task::spawn_blocking(move || save_checkpoint(&params, &path).map(|_| path))
            .await
            .map_err(|e| FlError::Checkpoint(e.to_string()))
            .and_then(|r| r);
        match saved {
            Ok(path) => info!(round, path = %path.display(), "saved checkpoint"),
            Err(e) => warn!(round, "could not save checkpoint: {e}"),
        }
    }
}
