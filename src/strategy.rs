//! Aggregation policies selected by configuration.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::aggregate::aggregate;
use crate::drift::{DriftGuard, DriftState};
use crate::error::{FlError, Result};
use crate::model::LinearValidator;
use crate::params::ParameterSet;
use crate::types::{Accuracy, ClientResult};

/// Scores a candidate global model on the central validation set.
pub trait Validator: Send + Sync {
    fn validate(&self, params: &ParameterSet) -> Result<Accuracy>;
}

impl Validator for LinearValidator {
    fn validate(&self, params: &ParameterSet) -> Result<Accuracy> {
        self.evaluate(params)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Plain sample-weighted average
    Fedavg,
    /// Weighted average, validated, rolled back on regression
    DriftGuarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundOutcome {
    Accepted,
    Reverted,
    Skipped,
    ValidationFailed,
}

/// How a round ended and which parameters the next round starts from.
#[derive(Debug, Clone)]
pub struct Conclusion {
    pub outcome: RoundOutcome,
    pub parameters: Arc<ParameterSet>,
    /// The freshly aggregated parameters, whether or not they were kept.
    pub candidate: Option<Arc<ParameterSet>>,
    /// Validation result of the candidate.
    pub accuracy: Option<Accuracy>,
    pub drop: Option<f64>,
}

impl Conclusion {
    fn skipped(current: &Arc<ParameterSet>) -> Self {
        Self { outcome: RoundOutcome::Skipped, parameters: current.clone(), candidate: None, accuracy: None, drop: None }
    }
}

#[derive(Clone)]
pub enum Strategy {
    FedAvg { validator: Option<Arc<dyn Validator>> },
    DriftGuarded { guard: DriftGuard, validator: Arc<dyn Validator> },
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::FedAvg { validator } => {
                f.debug_struct("FedAvg").field("validated", &validator.is_some()).finish()
            }
            Strategy::DriftGuarded { guard, .. } => {
                f.debug_struct("DriftGuarded").field("threshold", &guard.threshold()).finish()
            }
        }
    }
}

impl Strategy {
    /// Aggregates the round's results and decides which parameters survive.
    ///
    /// Only shape errors are returned as `Err`; everything else ends as a recorded outcome.
    pub async fn conclude(
        &self,
        round: u32,
        results: &[ClientResult],
        current: &Arc<ParameterSet>,
        drift: DriftState,
    ) -> Result<(Conclusion, DriftState)> {
        let candidate = match aggregate(results) {
            Ok(Some(p)) => Arc::new(p),
            Ok(None) => return Ok((Conclusion::skipped(current), drift)),
            Err(FlError::ZeroTotalWeight) => {
                warn!(round, "all participating clients reported zero samples, skipping aggregation");
                return Ok((Conclusion::skipped(current), drift));
            }
            Err(e) => return Err(e),
        };

        match self {
            Strategy::FedAvg { validator } => {
                let accuracy = match validator {
                    Some(v) => match validate(v.clone(), candidate.clone()).await {
                        Ok(acc) => Some(acc),
                        Err(e) => {
                            warn!(round, "validation failed, keeping aggregate unverified: {e}");
                            None
                        }
                    },
                    None => None,
                };
                let conclusion = Conclusion {
                    outcome: RoundOutcome::Accepted,
                    parameters: candidate.clone(),
                    candidate: Some(candidate),
                    accuracy,
                    drop: None,
                };
                Ok((conclusion, drift))
            }
            Strategy::DriftGuarded { guard, validator } => {
                let accuracy = match validate(validator.clone(), candidate.clone()).await {
                    Ok(acc) => acc,
                    Err(e) => {
                        warn!(round, "validation failed, rejecting candidate: {e}");
                        let parameters = drift.previous_parameters().unwrap_or(current).clone();
                        let conclusion = Conclusion {
                            outcome: RoundOutcome::ValidationFailed,
                            parameters,
                            candidate: Some(candidate),
                            accuracy: None,
                            drop: None,
                        };
                        return Ok((conclusion, drift));
                    }
                };
                info!(round, map50 = accuracy.map50, map50_95 = accuracy.map50_95, "validated aggregate");

                let (decision, drift) = guard.check(round, candidate.clone(), accuracy.map50, drift);
                let outcome = if decision.did_revert { RoundOutcome::Reverted } else { RoundOutcome::Accepted };
                let conclusion = Conclusion {
                    outcome,
                    parameters: decision.parameters,
                    candidate: Some(candidate),
                    accuracy: Some(accuracy),
                    drop: decision.drop,
                };
                Ok((conclusion, drift))
            }
        }
    }
}

async fn validate(validator: Arc<dyn Validator>, params: Arc<ParameterSet>) -> Result<Accuracy> {
    tokio::task::spawn_blocking(move || validator.validate(&params))
        .await
        .map_err(|e| FlError::Validation(format!("validation task panicked: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::TensorData;
    use crate::types::FitMetrics;
    use parking_lot::Mutex;

    /// Returns scripted accuracies in order; `None` simulates an unreadable validation set.
    struct Scripted(Mutex<Vec<Option<f64>>>);

    impl Scripted {
        fn new(script: Vec<Option<f64>>) -> Arc<Self> {
            let mut script = script;
            script.reverse();
            Arc::new(Self(Mutex::new(script)))
        }
    }

    impl Validator for Scripted {
        fn validate(&self, _: &ParameterSet) -> Result<Accuracy> {
            match self.0.lock().pop().flatten() {
                Some(map50) => Ok(Accuracy { map50, map50_95: map50 / 2.0 }),
                None => Err(FlError::Validation("data.yaml unreadable".into())),
            }
        }
    }

    fn set(v: f32) -> ParameterSet {
        ParameterSet::new(vec![TensorData::new(vec![1], vec![v])])
    }

    fn result(v: f32, sample_count: u64) -> ClientResult {
        ClientResult { parameters: set(v), sample_count, round_number: 1, metrics: FitMetrics::default() }
    }

    #[tokio::test]
    async fn empty_round_keeps_current_parameters() {
        let strategy = Strategy::FedAvg { validator: None };
        let current = Arc::new(set(1.0));
        let (c, _) = strategy.conclude(1, &[], &current, DriftState::new()).await.unwrap();
        assert_eq!(c.outcome, RoundOutcome::Skipped);
        assert_eq!(c.parameters, current);
        assert!(c.candidate.is_none());
    }

    #[tokio::test]
    async fn zero_weight_round_is_skipped() {
        let strategy = Strategy::FedAvg { validator: None };
        let current = Arc::new(set(1.0));
        let (c, _) = strategy.conclude(1, &[result(4.0, 0)], &current, DriftState::new()).await.unwrap();
        assert_eq!(c.outcome, RoundOutcome::Skipped);
    }

    #[tokio::test]
    async fn fedavg_accepts_without_validator() {
        let strategy = Strategy::FedAvg { validator: None };
        let current = Arc::new(set(0.0));
        let (c, _) = strategy.conclude(1, &[result(2.0, 1), result(4.0, 1)], &current, DriftState::new()).await.unwrap();
        assert_eq!(c.outcome, RoundOutcome::Accepted);
        assert_eq!(*c.parameters, set(3.0));
        assert!(c.accuracy.is_none());
    }

    #[tokio::test]
    async fn fedavg_never_reverts() {
        let strategy = Strategy::FedAvg { validator: Some(Scripted::new(vec![Some(0.9), Some(0.1)])) };
        let current = Arc::new(set(0.0));
        let (_, drift) = strategy.conclude(1, &[result(1.0, 1)], &current, DriftState::new()).await.unwrap();
        let (c, _) = strategy.conclude(2, &[result(5.0, 1)], &current, drift).await.unwrap();
        assert_eq!(c.outcome, RoundOutcome::Accepted);
        assert_eq!(*c.parameters, set(5.0));
        assert_eq!(c.accuracy.map(|a| a.map50), Some(0.1));
    }

    #[tokio::test]
    async fn drift_guard_reverts_on_regression() {
        let strategy = Strategy::DriftGuarded {
            guard: DriftGuard::default(),
            validator: Scripted::new(vec![Some(0.8), Some(0.7)]),
        };
        let current = Arc::new(set(0.0));
        let (first, drift) = strategy.conclude(1, &[result(1.0, 1)], &current, DriftState::new()).await.unwrap();
        assert_eq!(first.outcome, RoundOutcome::Accepted);

        let (second, drift) = strategy.conclude(2, &[result(9.0, 1)], &first.parameters, drift).await.unwrap();
        assert_eq!(second.outcome, RoundOutcome::Reverted);
        assert_eq!(*second.parameters, set(1.0));
        assert_eq!(second.candidate.as_deref(), Some(&set(9.0)));
        assert_eq!(drift.previous_accuracy(), Some(0.8));
    }

    #[tokio::test]
    async fn validation_failure_rejects_candidate() {
        let strategy = Strategy::DriftGuarded {
            guard: DriftGuard::default(),
            validator: Scripted::new(vec![None, Some(0.5), None]),
        };
        let current = Arc::new(set(0.0));

        let (c, drift) = strategy.conclude(1, &[result(1.0, 1)], &current, DriftState::new()).await.unwrap();
        assert_eq!(c.outcome, RoundOutcome::ValidationFailed);
        assert_eq!(c.parameters, current);

        let (c, drift) = strategy.conclude(2, &[result(2.0, 1)], &c.parameters, drift).await.unwrap();
        assert_eq!(c.outcome, RoundOutcome::Accepted);

        let (c, _) = strategy.conclude(3, &[result(7.0, 1)], &c.parameters, drift).await.unwrap();
        assert_eq!(c.outcome, RoundOutcome::ValidationFailed);
        assert_eq!(*c.parameters, set(2.0));
    }

    #[tokio::test]
    async fn shape_mismatch_is_an_error() {
        let strategy = Strategy::FedAvg { validator: None };
        let odd = ClientResult { parameters: ParameterSet::new(vec![TensorData::zeros(vec![2])]), ..result(1.0, 1) };
        let err = strategy.conclude(1, &[result(1.0, 1), odd], &Arc::new(set(0.0)), DriftState::new()).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
