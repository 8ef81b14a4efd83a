//! Model invocation boundary: loads the six pre-trained, scikit-learn-shaped
//! artifacts and exposes the two stateless predictors built from them.
//!
//! All crossings into the Python interpreter hold the GIL for the shortest
//! span that does the actual numeric work; everything else (weight lookups,
//! threshold math, label decoding) happens in plain Rust afterward.

pub mod supervised;
pub mod unsupervised;

use std::path::{Path, PathBuf};

use log::{info, warn};
use pyo3::prelude::*;
use pyo3::types::PyAny;

use crate::error::{NdsError, Result};
use crate::preprocess::{FeatureSelector, Scaler, Validator};

pub use supervised::SupervisedPredictor;
pub use unsupervised::UnsupervisedPredictor;

const ARTIFACT_NAMES: &[&str] = &[
    "supervised_model.joblib",
    "unsupervised_model.joblib",
    "scaler.joblib",
    "label_encoder.joblib",
    "feature_selector.joblib",
    "threshold_stats.joblib",
];

/// The fully loaded artifact set. Loading is all-or-nothing: if any of the
/// six files is missing, `ModelBundle::load` returns an error and the
/// pipeline falls back to degraded mode instead of holding a partial bundle.
pub struct ModelBundle {
    pub supervised: SupervisedPredictor,
    pub unsupervised: UnsupervisedPredictor,
    pub preprocessing: crate::preprocess::PreprocessingChain,
}

/// Checks presence of all six fixed-name artifact files without loading
/// them; used to report `models_status()` without paying interpreter
/// startup cost.
pub fn artifacts_present(dir: &Path) -> bool {
    ARTIFACT_NAMES.iter().all(|name| dir.join(name).exists())
}

pub fn missing_artifacts(dir: &Path) -> Vec<String> {
    ARTIFACT_NAMES
        .iter()
        .filter(|name| !dir.join(name).exists())
        .map(|name| name.to_string())
        .collect()
}

impl ModelBundle {
    pub fn load(model_dir: &Path, anomaly_threshold_k: f64, min_classification_confidence: f64) -> Result<Self> {
        let missing = missing_artifacts(model_dir);
        if !missing.is_empty() {
            return Err(NdsError::Model(format!(
                "missing artifacts in {}: {}",
                model_dir.display(),
                missing.join(", ")
            )));
        }

        let paths = ArtifactPaths::new(model_dir);
        let (supervised, unsupervised, preprocessing) = Python::with_gil(|py| -> Result<_> {
            let joblib = py.import("joblib").map_err(NdsError::from)?;

            let supervised_model = load_artifact(&joblib, &paths.supervised_model)?.unbind();
            let unsupervised_model = load_artifact(&joblib, &paths.unsupervised_model)?.unbind();
            let scaler_artifact = load_artifact(&joblib, &paths.scaler)?;
            let label_encoder = load_artifact(&joblib, &paths.label_encoder)?.unbind();
            let feature_selector_artifact = load_artifact(&joblib, &paths.feature_selector)?;
            let threshold_artifact = load_artifact(&joblib, &paths.threshold_stats)?;

            let labels: Vec<String> = label_encoder
                .bind(py)
                .getattr("classes_")
                .and_then(|v| v.extract())
                .map_err(NdsError::from)?;

            let selected_indices: Vec<usize> = feature_selector_artifact
                .extract()
                .or_else(|_| feature_selector_artifact.call_method0("tolist").and_then(|v| v.extract()))
                .map_err(NdsError::from)?;

            let (mean, std_dev): (Vec<f64>, Vec<f64>) = (
                scaler_artifact.getattr("mean_").and_then(|v| v.extract()).map_err(NdsError::from)?,
                scaler_artifact.getattr("scale_").and_then(|v| v.extract()).map_err(NdsError::from)?,
            );

            let (err_mean, err_std): (f64, f64) = match threshold_artifact.extract::<(f64, f64)>() {
                Ok(pair) => pair,
                Err(_) => {
                    warn!("threshold-statistics artifact missing usable (mean, std); falling back to defaults");
                    (0.01, 0.005)
                }
            };

            let validator = Validator::with_global_clip(crate::features::FEATURE_VECTOR_LEN, -1.0e6, 1.0e6);
            let selector = FeatureSelector::new(selected_indices);
            let scaler = Scaler::new(mean, std_dev);
            let preprocessing = crate::preprocess::PreprocessingChain::new(validator, selector, scaler);

            let supervised = SupervisedPredictor::new(supervised_model, labels, min_classification_confidence);
            let unsupervised = UnsupervisedPredictor::new(unsupervised_model, anomaly_threshold_k, err_mean, err_std);

            Ok((supervised, unsupervised, preprocessing))
        })?;

        info!("loaded model bundle from {}", model_dir.display());

        let bundle = Self {
            supervised,
            unsupervised,
            preprocessing,
        };
        bundle.warm_up();
        Ok(bundle)
    }

    /// One call on a zero vector to amortise first-call interpreter/JIT
    /// warm-up cost outside the hot path.
    fn warm_up(&self) {
        let zero = crate::types::FeatureVector(vec![0.0; self.preprocessing.transform_len()]);
        if let Err(e) = self.supervised.predict(&zero) {
            warn!("supervised predictor warm-up call failed: {}", e);
        }
        if let Err(e) = self.unsupervised.predict(&zero) {
            warn!("unsupervised predictor warm-up call failed: {}", e);
        }
    }
}

fn load_artifact<'py>(joblib: &Bound<'py, PyAny>, path: &PathBuf) -> Result<Bound<'py, PyAny>> {
    joblib
        .call_method1("load", (path.to_string_lossy().into_owned(),))
        .map_err(NdsError::from)
}

struct ArtifactPaths {
    supervised_model: PathBuf,
    unsupervised_model: PathBuf,
    scaler: PathBuf,
    label_encoder: PathBuf,
    feature_selector: PathBuf,
    threshold_stats: PathBuf,
}

impl ArtifactPaths {
    fn new(dir: &Path) -> Self {
        Self {
            supervised_model: dir.join(ARTIFACT_NAMES[0]),
            unsupervised_model: dir.join(ARTIFACT_NAMES[1]),
            scaler: dir.join(ARTIFACT_NAMES[2]),
            label_encoder: dir.join(ARTIFACT_NAMES[3]),
            feature_selector: dir.join(ARTIFACT_NAMES[4]),
            threshold_stats: dir.join(ARTIFACT_NAMES[5]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_artifacts_lists_every_absent_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = missing_artifacts(dir.path());
        assert_eq!(missing.len(), ARTIFACT_NAMES.len());
    }

    #[test]
    fn artifacts_present_is_false_on_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!artifacts_present(dir.path()));
    }
}
