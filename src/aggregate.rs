//! Sample-count weighted federated averaging.

use crate::error::{FlError, Result};
use crate::params::{ModelSpec, ParameterSet, TensorData};
use crate::types::ClientResult;

/// Averages the client updates position by position, weighting each by its `sample_count`.
///
/// Returns `Ok(None)` when there is nothing to aggregate; the caller records that round as skipped.
/// All parameter sets must share the shapes of the first one.
pub fn aggregate(results: &[ClientResult]) -> Result<Option<ParameterSet>> {
    let Some(first) = results.first() else {
        return Ok(None);
    };
    let spec = ModelSpec::of(&first.parameters);
    for r in results {
        spec.check(&r.parameters)?;
    }

    let total: u64 = results.iter().map(|r| r.sample_count).sum();
    if total == 0 {
        return Err(FlError::ZeroTotalWeight);
    }
    let total = total as f64;

    let mut acc: Vec<Vec<f64>> = first.parameters.tensors.iter().map(|t| vec![0f64; t.values.len()]).collect();
    for r in results {
        if r.sample_count == 0 {
            continue;
        }
        let w = r.sample_count as f64;
        for (sum, t) in acc.iter_mut().zip(&r.parameters.tensors) {
            for (s, v) in sum.iter_mut().zip(&t.values) {
                *s += w * f64::from(*v);
            }
        }
    }

    let tensors = acc
        .into_iter()
        .zip(&first.parameters.tensors)
        .map(|(sum, t)| TensorData::new(t.shape.clone(), sum.into_iter().map(|s| (s / total) as f32).collect()))
        .collect();
    Ok(Some(ParameterSet::new(tensors)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FitMetrics;

    fn result(values: Vec<f32>, sample_count: u64) -> ClientResult {
        ClientResult {
            parameters: ParameterSet::new(vec![TensorData::new(vec![values.len()], values)]),
            sample_count,
            round_number: 1,
            metrics: FitMetrics::default(),
        }
    }

    fn values(p: &ParameterSet) -> &[f32] {
        &p.tensors[0].values
    }

    #[test]
    fn empty_input_is_no_aggregate() {
        assert!(aggregate(&[]).unwrap().is_none());
    }

    #[test]
    fn uniform_weights_give_plain_mean() {
        let results = vec![result(vec![1.0, 4.0], 7), result(vec![3.0, 0.0], 7), result(vec![5.0, 2.0], 7)];
        let avg = aggregate(&results).unwrap().unwrap();
        assert!((values(&avg)[0] - 3.0).abs() < 1e-6);
        assert!((values(&avg)[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn weights_follow_sample_counts() {
        let results = vec![result(vec![1.0], 10), result(vec![2.0], 20), result(vec![3.0], 30)];
        let avg = aggregate(&results).unwrap().unwrap();
        assert!((values(&avg)[0] - 7.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn zero_sample_client_has_no_influence() {
        let results = vec![result(vec![2.0], 5), result(vec![1000.0], 0)];
        let avg = aggregate(&results).unwrap().unwrap();
        assert!((values(&avg)[0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn all_zero_weights_fail() {
        let results = vec![result(vec![2.0], 0), result(vec![4.0], 0)];
        assert!(matches!(aggregate(&results), Err(FlError::ZeroTotalWeight)));
    }

    #[test]
    fn mismatched_shapes_fail() {
        let results = vec![result(vec![1.0, 2.0], 1), result(vec![1.0], 1)];
        let err = aggregate(&results).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn repeated_calls_leave_inputs_alone() {
        let results = vec![result(vec![0.25, 8.0], 3), result(vec![-1.0, 2.0], 9)];
        let before = results.clone();
        let a = aggregate(&results).unwrap();
        let b = aggregate(&results).unwrap();
        assert_eq!(a, b);
        assert_eq!(results, before);
    }
}
