//! SupervisedPredictor: argmax-decodes the multi-class classifier's output
//! into a label, confidence, and attack gate.

use numpy::PyArray2;
use pyo3::prelude::*;

use crate::error::{NdsError, Result};
use crate::types::{FeatureVector, SupervisedOutput};
use std::collections::HashMap;

const BENIGN_LABELS: &[&str] = &["BENIGN", "NORMAL", "LEGITIMATE"];

pub struct SupervisedPredictor {
    model: Py<PyAny>,
    labels: Vec<String>,
    min_confidence: f64,
}

impl SupervisedPredictor {
    pub fn new(model: Py<PyAny>, labels: Vec<String>, min_confidence: f64) -> Self {
        Self {
            model,
            labels,
            min_confidence,
        }
    }

    /// Stateless with respect to input ordering: safe to call concurrently
    /// from multiple inference workers, each holding the GIL only for the
    /// duration of its own call.
    pub fn predict(&self, prepared: &FeatureVector) -> Result<SupervisedOutput> {
        Python::with_gil(|py| {
            let row: Vec<f64> = prepared.as_slice().to_vec();
            let array = PyArray2::from_vec2(py, &[row]).map_err(|e| NdsError::Model(e.to_string()))?;

            let proba = self
                .model
                .bind(py)
                .call_method1("predict_proba", (array,))
                .map_err(NdsError::from)?;
            let proba: Vec<Vec<f64>> = proba.extract().map_err(NdsError::from)?;
            let row_proba = proba
                .into_iter()
                .next()
                .ok_or_else(|| NdsError::Model("predict_proba returned no rows".into()))?;

            let (best_idx, confidence) = row_proba
                .iter()
                .enumerate()
                .fold((0usize, f64::MIN), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) });

            let predicted_label = self
                .labels
                .get(best_idx)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());

            let class_probabilities: HashMap<String, f64> = self
                .labels
                .iter()
                .cloned()
                .zip(row_proba.iter().copied())
                .collect();

            let is_benign = BENIGN_LABELS.iter().any(|b| b.eq_ignore_ascii_case(&predicted_label));
            let is_attack = !is_benign && confidence >= self.min_confidence;

            Ok(SupervisedOutput {
                class_probabilities,
                predicted_label,
                confidence,
                is_attack,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_labels_are_never_attacks_regardless_of_confidence() {
        assert!(BENIGN_LABELS.iter().any(|b| b.eq_ignore_ascii_case("benign")));
        assert!(BENIGN_LABELS.iter().any(|b| b.eq_ignore_ascii_case("Normal")));
    }
}
