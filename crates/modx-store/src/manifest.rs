//! Conversion manifest, always re-derived from what is on disk.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::artifacts::{ConvertedLayout, map_file};

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LayerManifest {
    pub layer: usize,
    pub converted: bool,
    pub weights_present: bool,
    pub config_present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d_model: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d_sae: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConversionManifest {
    pub layers: Vec<LayerManifest>,
}

impl ConversionManifest {
    pub fn derive(artifacts: &ConvertedLayout, layers: &[usize]) -> Self {
        let layers = layers
            .iter()
            .map(|&layer| {
                let layout = artifacts.layout();
                let weights = layout.weights_path(layer);
                let weights_present = weights.is_file();
                let config_present = layout.config_path(layer).is_file();
                let checksum = weights_present
                    .then(|| map_file(&weights).ok())
                    .flatten()
                    .map(|mmap| sha256_hex(&mmap));
                let (shapes, problem) = match artifacts.validate(layer) {
                    Ok(shapes) => (Some(shapes), None),
                    Err(problem) => (None, Some(problem)),
                };
                LayerManifest {
                    layer,
                    converted: shapes.is_some(),
                    weights_present,
                    config_present,
                    checksum,
                    d_model: shapes.as_ref().map(|s| s.d_model),
                    d_sae: shapes.as_ref().map(|s| s.d_sae),
                    problem,
                }
            })
            .collect();
        Self { layers }
    }
}
