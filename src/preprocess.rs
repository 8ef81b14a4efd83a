//! Preprocessing chain: Validator -> FeatureSelector -> Scaler, applied in
//! this exact order. Reversing (2) and (3) silently produces wrong
//! predictions, so the order lives in one place, not at call sites.

use crate::types::FeatureVector;

/// Replaces NaN/±Inf with 0 and clips each coordinate to a plausible range.
pub struct Validator {
    pub(crate) clip_min: Vec<f64>,
    clip_max: Vec<f64>,
}

impl Validator {
    /// `clip_min`/`clip_max` must have one entry per raw feature coordinate.
    pub fn new(clip_min: Vec<f64>, clip_max: Vec<f64>) -> Self {
        Self { clip_min, clip_max }
    }

    /// A validator with no artifact-provided ranges: falls back to a single
    /// global clip applied uniformly, per the artifact-metadata-or-global
    /// contract.
    pub fn with_global_clip(len: usize, min: f64, max: f64) -> Self {
        Self {
            clip_min: vec![min; len],
            clip_max: vec![max; len],
        }
    }

    pub fn apply(&self, vector: &FeatureVector) -> FeatureVector {
        let values = vector
            .as_slice()
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let v = if v.is_finite() { v } else { 0.0 };
                let lo = self.clip_min.get(i).copied().unwrap_or(f64::NEG_INFINITY);
                let hi = self.clip_max.get(i).copied().unwrap_or(f64::INFINITY);
                v.clamp(lo, hi)
            })
            .collect();
        FeatureVector(values)
    }
}

/// Projects the validated vector onto a fixed subset of indices, defined by
/// the feature-selector artifact.
pub struct FeatureSelector {
    indices: Vec<usize>,
}

impl FeatureSelector {
    pub fn new(indices: Vec<usize>) -> Self {
        Self { indices }
    }

    pub fn apply(&self, vector: &FeatureVector) -> FeatureVector {
        let values = self
            .indices
            .iter()
            .map(|&i| vector.as_slice().get(i).copied().unwrap_or(0.0))
            .collect();
        FeatureVector(values)
    }

    pub fn output_len(&self) -> usize {
        self.indices.len()
    }
}

/// Element-wise standardisation `(x - mu) / sigma` with artifact-provided
/// per-coordinate mu/sigma.
pub struct Scaler {
    mean: Vec<f64>,
    std_dev: Vec<f64>,
}

impl Scaler {
    pub fn new(mean: Vec<f64>, std_dev: Vec<f64>) -> Self {
        Self { mean, std_dev }
    }

    pub fn apply(&self, vector: &FeatureVector) -> FeatureVector {
        let values = vector
            .as_slice()
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let mu = self.mean.get(i).copied().unwrap_or(0.0);
                let sigma = self.std_dev.get(i).copied().unwrap_or(1.0);
                if sigma > 0.0 {
                    (v - mu) / sigma
                } else {
                    0.0
                }
            })
            .collect();
        FeatureVector(values)
    }
}

/// The full chain, owned by the pipeline and built once from the loaded
/// artifacts at startup.
pub struct PreprocessingChain {
    validator: Validator,
    selector: FeatureSelector,
    scaler: Scaler,
}

impl PreprocessingChain {
    pub fn new(validator: Validator, selector: FeatureSelector, scaler: Scaler) -> Self {
        Self { validator, selector, scaler }
    }

    pub fn transform(&self, raw: &FeatureVector) -> FeatureVector {
        let validated = self.validator.apply(raw);
        let selected = self.selector.apply(&validated);
        self.scaler.apply(&selected)
    }

    /// Length of the raw (pre-selection) vector this chain expects, i.e.
    /// `FEATURE_VECTOR_LEN` at construction time.
    pub fn transform_len(&self) -> usize {
        self.validator.clip_min.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validator_replaces_nan_and_clips() {
        let validator = Validator::with_global_clip(3, -10.0, 10.0);
        let vector = FeatureVector(vec![f64::NAN, 100.0, -100.0]);
        let out = validator.apply(&vector);
        assert_eq!(out.0, vec![0.0, 10.0, -10.0]);
    }

    #[test]
    fn selector_projects_and_reorders() {
        let selector = FeatureSelector::new(vec![2, 0]);
        let vector = FeatureVector(vec![1.0, 2.0, 3.0]);
        let out = selector.apply(&vector);
        assert_eq!(out.0, vec![3.0, 1.0]);
    }

    #[test]
    fn scaler_standardizes_and_guards_zero_sigma() {
        let scaler = Scaler::new(vec![1.0, 0.0], vec![2.0, 0.0]);
        let vector = FeatureVector(vec![5.0, 9.0]);
        let out = scaler.apply(&vector);
        assert_eq!(out.0[0], 2.0);
        assert_eq!(out.0[1], 0.0);
    }

    #[test]
    fn chain_applies_in_contractual_order() {
        let validator = Validator::with_global_clip(3, -5.0, 5.0);
        let selector = FeatureSelector::new(vec![1, 2]);
        let scaler = Scaler::new(vec![0.0, 0.0], vec![1.0, 1.0]);
        let chain = PreprocessingChain::new(validator, selector, scaler);

        let raw = FeatureVector(vec![f64::INFINITY, 3.0, 4.0]);
        let out = chain.transform(&raw);
        // validator clips index 0 to 5.0 but selector drops it; only 1,2 survive
        assert_eq!(out.0, vec![3.0, 4.0]);
    }
}
