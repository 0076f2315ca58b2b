//! Rollback to the last accepted model when validation accuracy regresses.
//!
//! The guard only ever compares against the single most recent accepted checkpoint.

use std::sync::Arc;

use tracing::{info, warn};

use crate::params::ParameterSet;

pub const DEFAULT_DRIFT_THRESHOLD: f64 = 0.10;

#[derive(Debug, Clone, PartialEq)]
struct AcceptedModel {
    parameters: Arc<ParameterSet>,
    accuracy: f64,
}

/// What the guard remembers between rounds. Only updated when a round is accepted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriftState {
    previous: Option<AcceptedModel>,
}

impl DriftState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn previous_parameters(&self) -> Option<&Arc<ParameterSet>> {
        self.previous.as_ref().map(|m| &m.parameters)
    }

    pub fn previous_accuracy(&self) -> Option<f64> {
        self.previous.as_ref().map(|m| m.accuracy)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriftDecision {
    pub parameters: Arc<ParameterSet>,
    pub accuracy: f64,
    pub did_revert: bool,
    /// Relative drop against the previous accepted accuracy, when a baseline existed.
    pub drop: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct DriftGuard {
    threshold: f64,
}

impl Default for DriftGuard {
    fn default() -> Self {
        Self { threshold: DEFAULT_DRIFT_THRESHOLD }
    }
}

impl DriftGuard {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn check(
        &self,
        round_number: u32,
        candidate: Arc<ParameterSet>,
        candidate_accuracy: f64,
        state: DriftState,
    ) -> (DriftDecision, DriftState) {
        let baseline = match state.previous.as_ref() {
            Some(prev) if round_number > 1 => prev,
            _ => return accept(candidate, candidate_accuracy, None),
        };

        // A zero baseline has no meaningful relative drop.
        if baseline.accuracy <= 0.0 {
            return accept(candidate, candidate_accuracy, None);
        }

        let drop = (baseline.accuracy - candidate_accuracy) / baseline.accuracy;
        if drop > self.threshold {
            warn!(
                round = round_number,
                drop = %format!("{:.2}%", drop * 100.0),
                "accuracy regressed past threshold, reverting to previous weights"
            );
            let decision = DriftDecision {
                parameters: baseline.parameters.clone(),
                accuracy: baseline.accuracy,
                did_revert: true,
                drop: Some(drop),
            };
            return (decision, state);
        }

        info!(round = round_number, drop, "candidate within drift threshold");
        accept(candidate, candidate_accuracy, Some(drop))
    }
}

fn accept(candidate: Arc<ParameterSet>, accuracy: f64, drop: Option<f64>) -> (DriftDecision, DriftState) {
    let state = DriftState { previous: Some(AcceptedModel { parameters: candidate.clone(), accuracy }) };
    let decision = DriftDecision { parameters: candidate, accuracy, did_revert: false, drop };
    (decision, state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::TensorData;

    fn params(v: f32) -> Arc<ParameterSet> {
        Arc::new(ParameterSet::new(vec![TensorData::new(vec![1], vec![v])]))
    }

    fn seeded(v: f32, accuracy: f64) -> DriftState {
        let (_, state) = DriftGuard::default().check(1, params(v), accuracy, DriftState::new());
        state
    }

    #[test]
    fn first_round_always_accepted() {
        let guard = DriftGuard::default();
        let baseline = seeded(1.0, 0.9);
        let (decision, state) = guard.check(1, params(2.0), 0.0, baseline);
        assert!(!decision.did_revert);
        assert_eq!(decision.parameters, params(2.0));
        assert_eq!(state.previous_accuracy(), Some(0.0));
    }

    #[test]
    fn no_baseline_means_accept() {
        let (decision, state) = DriftGuard::default().check(4, params(3.0), 0.1, DriftState::new());
        assert!(!decision.did_revert);
        assert_eq!(decision.drop, None);
        assert_eq!(state.previous_parameters(), Some(&params(3.0)));
    }

    #[test]
    fn large_drop_reverts() {
        let before = seeded(1.0, 0.80);
        let (decision, state) = DriftGuard::default().check(2, params(9.0), 0.70, before.clone());
        assert!(decision.did_revert);
        assert_eq!(decision.parameters, params(1.0));
        assert!((decision.accuracy - 0.80).abs() < 1e-12);
        assert!((decision.drop.unwrap() - 0.125).abs() < 1e-9);
        assert_eq!(state, before);
    }

    #[test]
    fn small_drop_accepts_and_moves_baseline() {
        let before = seeded(1.0, 0.80);
        let (decision, state) = DriftGuard::default().check(2, params(9.0), 0.75, before);
        assert!(!decision.did_revert);
        assert_eq!(decision.parameters, params(9.0));
        assert_eq!(state.previous_accuracy(), Some(0.75));
        assert_eq!(state.previous_parameters(), Some(&params(9.0)));
    }

    #[test]
    fn drop_equal_to_threshold_is_accepted() {
        let before = seeded(1.0, 0.5);
        let (decision, _) = DriftGuard::new(0.5).check(2, params(2.0), 0.25, before);
        assert!(!decision.did_revert);
    }

    #[test]
    fn improvement_is_accepted() {
        let before = seeded(1.0, 0.4);
        let (decision, state) = DriftGuard::default().check(3, params(2.0), 0.6, before);
        assert!(!decision.did_revert);
        assert!(decision.drop.unwrap() < 0.0);
        assert_eq!(state.previous_accuracy(), Some(0.6));
    }

    #[test]
    fn zero_baseline_accepts_anything() {
        let before = seeded(1.0, 0.0);
        let (decision, _) = DriftGuard::default().check(2, params(2.0), 0.0, before);
        assert!(!decision.did_revert);
    }

    #[test]
    fn consecutive_reverts_keep_same_baseline() {
        let guard = DriftGuard::default();
        let state = seeded(1.0, 0.8);
        let (_, state) = guard.check(2, params(2.0), 0.5, state);
        let (decision, state) = guard.check(3, params(3.0), 0.6, state);
        assert!(decision.did_revert);
        assert_eq!(decision.parameters, params(1.0));
        assert_eq!(state.previous_accuracy(), Some(0.8));
    }
}
