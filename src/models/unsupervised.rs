//! UnsupervisedPredictor: reconstructs the prepared vector through the
//! auto-encoder and scores the reconstruction error against an
//! artifact-derived threshold.

use numpy::PyArray2;
use pyo3::prelude::*;

use crate::error::{NdsError, Result};
use crate::types::{FeatureVector, UnsupervisedOutput};

const Z_MAX: f64 = 10.0;

pub struct UnsupervisedPredictor {
    model: Py<PyAny>,
    k: f64,
    err_mean: f64,
    err_std: f64,
}

impl UnsupervisedPredictor {
    pub fn new(model: Py<PyAny>, k: f64, err_mean: f64, err_std: f64) -> Self {
        Self { model, k, err_mean, err_std }
    }

    pub fn predict(&self, prepared: &FeatureVector) -> Result<UnsupervisedOutput> {
        Python::with_gil(|py| {
            let row: Vec<f64> = prepared.as_slice().to_vec();
            let array = PyArray2::from_vec2(py, &[row.clone()]).map_err(|e| NdsError::Model(e.to_string()))?;

            let reconstructed = self
                .model
                .bind(py)
                .call_method1("predict", (array,))
                .map_err(NdsError::from)?;
            let reconstructed: Vec<Vec<f64>> = reconstructed.extract().map_err(NdsError::from)?;
            let reconstructed_row = reconstructed
                .into_iter()
                .next()
                .ok_or_else(|| NdsError::Model("auto-encoder returned no rows".into()))?;

            let reconstruction_error = mean_squared_error(&row, &reconstructed_row);
            let threshold_used = self.err_mean + self.k * self.err_std;
            let is_anomaly = reconstruction_error >= threshold_used;

            let z = if self.err_std > 0.0 {
                (reconstruction_error - self.err_mean) / self.err_std
            } else {
                0.0
            };
            let anomaly_score = (z / Z_MAX).clamp(0.0, 1.0);

            Ok(UnsupervisedOutput {
                reconstruction_error,
                anomaly_score,
                is_anomaly,
                threshold_used,
            })
        })
    }
}

fn mean_squared_error(input: &[f64], reconstructed: &[f64]) -> f64 {
    if input.is_empty() {
        return 0.0;
    }
    let n = input.len().min(reconstructed.len());
    if n == 0 {
        return 0.0;
    }
    input[..n]
        .iter()
        .zip(reconstructed[..n].iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f64>()
        / n as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mse_of_identical_vectors_is_zero() {
        assert_eq!(mean_squared_error(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]), 0.0);
    }

    #[test]
    fn mse_matches_hand_computed_value() {
        let mse = mean_squared_error(&[0.0, 0.0], &[1.0, 3.0]);
        assert_eq!(mse, (1.0 + 9.0) / 2.0);
    }
}
