//! Feature detection: rank SAE feature activations per token position and
//! intersect them with the quarantine registry.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ModxError, Result};
use crate::registry::{QuarantineRegistry, Severity};
use crate::tensor::Matrix;

/// A quarantined feature observed firing during a probe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureActivation {
    pub feature_index: usize,
    pub activation_value: f32,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    pub layer: usize,
    pub token_position: Option<usize>,
}

/// Descending magnitude, lower feature index first on ties.
fn by_magnitude(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then(a.0.cmp(&b.0))
}

/// Rank one position's feature activations.
///
/// Equivalent to: sort descending, take the first `top_k`, drop entries
/// `<= threshold`. Filtering first gives the same result since every
/// surviving entry outranks every dropped one. Non-finite values never
/// survive.
pub fn detect(features: &[f32], top_k: usize, threshold: f32) -> Vec<(usize, f32)> {
    if top_k == 0 {
        return Vec::new();
    }
    let mut candidates: Vec<(usize, f32)> = features
        .iter()
        .copied()
        .enumerate()
        .filter(|&(_, v)| v.is_finite() && v > threshold)
        .collect();

    if candidates.len() > top_k {
        candidates.select_nth_unstable_by(top_k, by_magnitude);
        candidates.truncate(top_k);
    }
    candidates.sort_by(by_magnitude);
    candidates
}

/// Keep only candidates present in the registry, attaching their descriptors.
pub fn match_quarantine(
    candidates: &[(usize, f32)],
    registry: &QuarantineRegistry,
    layer: usize,
    token_position: Option<usize>,
) -> Vec<FeatureActivation> {
    candidates
        .iter()
        .filter_map(|&(feature_index, activation_value)| {
            registry.get(feature_index).map(|entry| FeatureActivation {
                feature_index,
                activation_value,
                description: entry.description.clone(),
                severity: entry.severity,
                layer,
                token_position,
            })
        })
        .collect()
}

/// Cross-position order: descending activation, then ascending token
/// position, then ascending feature index.
pub fn sort_activations(activations: &mut [FeatureActivation]) {
    activations.sort_by(|a, b| {
        b.activation_value
            .total_cmp(&a.activation_value)
            .then(a.token_position.cmp(&b.token_position))
            .then(a.feature_index.cmp(&b.feature_index))
    });
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub top_k: usize,
    pub activation_threshold: f32,
    /// Report each feature once, at its strongest position.
    #[serde(default)]
    pub dedupe_features: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            activation_threshold: 1e-3,
            dedupe_features: false,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(ModxError::Validation("feature top_k must be at least 1".into()));
        }
        if !self.activation_threshold.is_finite() {
            return Err(ModxError::Validation(
                "activation_threshold must be finite".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DetectionReport {
    pub activations: Vec<FeatureActivation>,
    /// Largest above-threshold activation seen at any probed position,
    /// quarantined or not. Zero when nothing cleared the threshold.
    pub max_activation: f32,
    pub features_checked_per_position: usize,
    pub positions_checked: usize,
}

impl DetectionReport {
    pub fn has_quarantined_features(&self) -> bool {
        !self.activations.is_empty()
    }

    pub fn total_features_checked(&self) -> usize {
        self.positions_checked * self.features_checked_per_position
    }
}

pub struct FeatureDetector {
    registry: Arc<QuarantineRegistry>,
    config: DetectorConfig,
}

impl FeatureDetector {
    pub fn new(registry: Arc<QuarantineRegistry>, config: DetectorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { registry, config })
    }

    pub fn registry(&self) -> &QuarantineRegistry {
        &self.registry
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Scan a `[seq_len, d_sae]` feature tensor. `positions` restricts the
    /// scan; positions past the end of the sequence are skipped.
    pub fn scan(
        &self,
        features: &Matrix,
        layer: usize,
        positions: Option<&[usize]>,
    ) -> DetectionReport {
        let all: Vec<usize>;
        let positions = match positions {
            Some(p) => p,
            None => {
                all = (0..features.rows).collect();
                &all
            }
        };

        let mut activations = Vec::new();
        let mut max_activation = 0.0f32;
        let mut positions_checked = 0;

        for &pos in positions {
            if pos >= features.rows {
                continue;
            }
            positions_checked += 1;
            let candidates = detect(
                features.row(pos),
                self.config.top_k,
                self.config.activation_threshold,
            );
            if let Some(&(_, top)) = candidates.first() {
                max_activation = max_activation.max(top);
            }
            activations.extend(match_quarantine(
                &candidates,
                &self.registry,
                layer,
                Some(pos),
            ));
        }

        sort_activations(&mut activations);
        if self.config.dedupe_features {
            let mut seen = HashSet::new();
            activations.retain(|a| seen.insert(a.feature_index));
        }

        tracing::debug!(
            "scanned {positions_checked} positions at layer {layer}: {} quarantined hits, max={max_activation}",
            activations.len()
        );

        DetectionReport {
            activations,
            max_activation,
            features_checked_per_position: self.config.top_k,
            positions_checked,
        }
    }
}
