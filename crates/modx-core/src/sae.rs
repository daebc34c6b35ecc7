//! Sparse autoencoder parameters, the encode transform, and the per-layer
//! artifact cache.
//!
//! Converted artifacts use the runtime schema:
//!
//! ```text
//! W_E  [d_model, d_sae]   encoder matrix
//! W_D  [d_sae, d_model]   decoder matrix
//! b_E  [d_sae]            encoder bias
//! b_D  [d_model]          decoder bias
//!
//! features = σ(scale · (x − b_D?) · W_E + b_E)
//! ```
//!
//! where σ is chosen by the SAE config (ReLU, JumpReLU or TopK) and `scale`
//! is `√d_model / norm_in` for dataset-wise normalized SAEs, 1 otherwise.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::SaeArtifactError;
use crate::tensor::Matrix;

pub const ENCODER_MATRIX_KEY: &str = "W_E";
pub const DECODER_MATRIX_KEY: &str = "W_D";
pub const ENCODER_BIAS_KEY: &str = "b_E";
pub const DECODER_BIAS_KEY: &str = "b_D";

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivationNorm {
    #[serde(rename = "in")]
    pub input: f32,
    #[serde(rename = "out")]
    pub output: f32,
}

/// SAE hyperparameters as shipped in the artifact's `config.json`.
/// Keys this crate does not interpret are ignored on read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SaeConfig {
    pub d_model: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d_sae: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expansion_factor: Option<usize>,
    #[serde(default = "default_act_fn")]
    pub act_fn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump_relu_threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub norm_activation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_average_activation_norm: Option<ActivationNorm>,
    #[serde(default)]
    pub apply_decoder_bias_to_pre_encoder: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_point_in: Option<String>,
}

fn default_act_fn() -> String {
    "relu".to_string()
}

impl SaeConfig {
    /// Minimal ReLU config, used when a source checkpoint ships no hyperparams.
    pub fn relu(d_model: usize, d_sae: usize) -> Self {
        Self {
            d_model,
            d_sae: Some(d_sae),
            expansion_factor: None,
            act_fn: default_act_fn(),
            jump_relu_threshold: None,
            top_k: None,
            norm_activation: None,
            dataset_average_activation_norm: None,
            apply_decoder_bias_to_pre_encoder: false,
            hook_point_in: None,
        }
    }

    pub fn d_sae(&self) -> Option<usize> {
        self.d_sae
            .or_else(|| self.expansion_factor.map(|f| f * self.d_model))
    }

    pub fn nonlinearity(&self) -> Result<Nonlinearity, String> {
        match self.act_fn.to_ascii_lowercase().replace('_', "").as_str() {
            "relu" => Ok(Nonlinearity::Relu),
            "jumprelu" => {
                let threshold = self
                    .jump_relu_threshold
                    .ok_or("jumprelu activation requires jump_relu_threshold")?;
                Ok(Nonlinearity::JumpRelu { threshold })
            }
            "topk" => {
                let k = self.top_k.ok_or("topk activation requires top_k")?;
                if k == 0 {
                    return Err("top_k must be at least 1".to_string());
                }
                Ok(Nonlinearity::TopK { k })
            }
            other => Err(format!("unsupported act_fn '{other}'")),
        }
    }

    /// Multiplier applied to raw activations before encoding.
    pub fn input_scale(&self) -> f32 {
        let dataset_wise = self
            .norm_activation
            .as_deref()
            .is_some_and(|n| n.eq_ignore_ascii_case("dataset-wise"));
        match (dataset_wise, self.dataset_average_activation_norm) {
            (true, Some(norm)) if norm.input > 0.0 => (self.d_model as f32).sqrt() / norm.input,
            _ => 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Nonlinearity {
    Relu,
    /// Zero every pre-activation at or below the threshold.
    JumpRelu { threshold: f32 },
    /// Keep the k largest pre-activations (lower index wins ties), ReLU'd.
    TopK { k: usize },
}

impl Nonlinearity {
    pub fn apply(&self, pre: &mut [f32]) {
        match *self {
            Nonlinearity::Relu => {
                for v in pre.iter_mut() {
                    *v = v.max(0.0);
                }
            }
            Nonlinearity::JumpRelu { threshold } => {
                for v in pre.iter_mut() {
                    if !(*v > threshold) {
                        *v = 0.0;
                    }
                }
            }
            Nonlinearity::TopK { k } => {
                if k >= pre.len() {
                    Nonlinearity::Relu.apply(pre);
                    return;
                }
                let mut order: Vec<usize> = (0..pre.len()).collect();
                order.select_nth_unstable_by(k, |&a, &b| {
                    pre[b].total_cmp(&pre[a]).then(a.cmp(&b))
                });
                let mut keep = vec![false; pre.len()];
                for &i in &order[..k] {
                    keep[i] = true;
                }
                for (v, kept) in pre.iter_mut().zip(keep) {
                    *v = if kept { v.max(0.0) } else { 0.0 };
                }
            }
        }
    }
}

/// One layer's SAE in runtime schema. Immutable once built.
#[derive(Debug)]
pub struct SaeArtifact {
    pub layer: usize,
    pub config: SaeConfig,
    pub encoder_matrix: Matrix,
    pub decoder_matrix: Matrix,
    pub encoder_bias: Vec<f32>,
    pub decoder_bias: Vec<f32>,
    nonlinearity: Nonlinearity,
    input_scale: f32,
}

impl SaeArtifact {
    pub fn new(
        layer: usize,
        config: SaeConfig,
        encoder_matrix: Matrix,
        decoder_matrix: Matrix,
        encoder_bias: Vec<f32>,
        decoder_bias: Vec<f32>,
    ) -> Result<Self, SaeArtifactError> {
        let invalid = |reason: String| SaeArtifactError::Invalid { layer, reason };

        let (d_model, d_sae) = encoder_matrix.shape();
        if d_model == 0 || d_sae == 0 {
            return Err(invalid(format!("empty encoder matrix [{d_model}, {d_sae}]")));
        }
        encoder_matrix.validate().map_err(|e| invalid(e.to_string()))?;
        decoder_matrix.validate().map_err(|e| invalid(e.to_string()))?;
        if decoder_matrix.shape() != (d_sae, d_model) {
            return Err(invalid(format!(
                "decoder matrix is {:?}, expected [{d_sae}, {d_model}]",
                decoder_matrix.shape()
            )));
        }
        if encoder_bias.len() != d_sae {
            return Err(invalid(format!(
                "encoder bias has {} entries, expected {d_sae}",
                encoder_bias.len()
            )));
        }
        if decoder_bias.len() != d_model {
            return Err(invalid(format!(
                "decoder bias has {} entries, expected {d_model}",
                decoder_bias.len()
            )));
        }
        if config.d_model != d_model {
            return Err(invalid(format!(
                "config d_model {} disagrees with weights ({d_model})",
                config.d_model
            )));
        }
        if let Some(cfg_sae) = config.d_sae()
            && cfg_sae != d_sae
        {
            return Err(invalid(format!(
                "config d_sae {cfg_sae} disagrees with weights ({d_sae})"
            )));
        }
        let nonlinearity = config.nonlinearity().map_err(invalid)?;
        let input_scale = config.input_scale();

        Ok(Self {
            layer,
            config,
            encoder_matrix,
            decoder_matrix,
            encoder_bias,
            decoder_bias,
            nonlinearity,
            input_scale,
        })
    }

    pub fn feature_count(&self) -> usize {
        self.encoder_matrix.cols
    }

    pub fn hidden_dim(&self) -> usize {
        self.encoder_matrix.rows
    }

    pub fn nonlinearity(&self) -> Nonlinearity {
        self.nonlinearity
    }

    pub fn check_hidden_dim(&self, hidden_dim: usize) -> Result<(), SaeArtifactError> {
        if self.hidden_dim() != hidden_dim {
            return Err(SaeArtifactError::Invalid {
                layer: self.layer,
                reason: format!(
                    "SAE expects hidden_dim {}, model produces {hidden_dim}",
                    self.hidden_dim()
                ),
            });
        }
        Ok(())
    }

    /// Encode a single hidden-state vector into feature activations.
    pub fn encode_vector(&self, x: &[f32]) -> Vec<f32> {
        debug_assert_eq!(x.len(), self.hidden_dim());
        let mut pre = self.encoder_bias.clone();
        let center = self.config.apply_decoder_bias_to_pre_encoder;
        for (i, &xi) in x.iter().enumerate() {
            let mut v = xi * self.input_scale;
            if center {
                v -= self.decoder_bias[i];
            }
            if v == 0.0 {
                continue;
            }
            for (p, w) in pre.iter_mut().zip(self.encoder_matrix.row(i)) {
                *p += v * w;
            }
        }
        self.nonlinearity.apply(&mut pre);
        pre
    }

    /// Encode every row of a `[seq_len, hidden_dim]` activation tensor.
    pub fn encode(&self, activations: &Matrix) -> Result<Matrix, SaeArtifactError> {
        self.check_hidden_dim(activations.cols)?;
        let mut out = Matrix::zeros(activations.rows, self.feature_count());
        for pos in 0..activations.rows {
            let features = self.encode_vector(activations.row(pos));
            out.row_mut(pos).copy_from_slice(&features);
        }
        Ok(out)
    }
}

/// Source of converted SAE artifacts, one per layer.
pub trait ArtifactLoader: Send + Sync {
    /// Whether a complete converted artifact exists for `layer`.
    fn is_converted(&self, layer: usize) -> bool;

    fn load(&self, layer: usize) -> Result<SaeArtifact, SaeArtifactError>;
}

/// Lazily loads and caches SAE artifacts per layer. Entries are never
/// evicted; the cache is bounded by the number of layers probed.
pub struct SaeManager {
    loader: Box<dyn ArtifactLoader>,
    cache: RwLock<HashMap<usize, Arc<SaeArtifact>>>,
}

impl SaeManager {
    pub fn new(loader: impl ArtifactLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_load(&self, layer: usize) -> Result<Arc<SaeArtifact>, SaeArtifactError> {
        if let Some(sae) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&layer)
        {
            return Ok(Arc::clone(sae));
        }

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(sae) = cache.get(&layer) {
            return Ok(Arc::clone(sae));
        }
        if !self.loader.is_converted(layer) {
            return Err(SaeArtifactError::Missing { layer });
        }

        tracing::info!("loading SAE for layer {layer}");
        let sae = Arc::new(self.loader.load(layer)?);
        tracing::info!(
            "loaded SAE for layer {layer}: d_model={}, d_sae={}, act={:?}",
            sae.hidden_dim(),
            sae.feature_count(),
            sae.nonlinearity()
        );
        cache.insert(layer, Arc::clone(&sae));
        Ok(sae)
    }

    /// Like [`get_or_load`](Self::get_or_load), additionally rejecting an
    /// artifact whose hidden dimension differs from the model's.
    pub fn get_for_model(
        &self,
        layer: usize,
        hidden_dim: usize,
    ) -> Result<Arc<SaeArtifact>, SaeArtifactError> {
        let sae = self.get_or_load(layer)?;
        sae.check_hidden_dim(hidden_dim)?;
        Ok(sae)
    }

    pub fn encode(&self, layer: usize, activations: &Matrix) -> Result<Matrix, SaeArtifactError> {
        self.get_or_load(layer)?.encode(activations)
    }

    pub fn is_loaded(&self, layer: usize) -> bool {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&layer)
    }

    pub fn loaded_layers(&self) -> Vec<usize> {
        let mut layers: Vec<usize> = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        layers.sort_unstable();
        layers
    }
}
