//! In-process test doubles for the runtime and artifact seams.
//!
//! `ScriptedRuntime` replays a fixed continuation and activation tensor;
//! `InMemoryLoader` serves SAE artifacts built in memory. Both are used by
//! this crate's tests and by the HTTP tests downstream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{ModxError, Result, SaeArtifactError};
use crate::generation::GenerationConfig;
use crate::runtime::{ActivationCapture, HookPoint, ModelInfo, ModelRuntime};
use crate::sae::{ArtifactLoader, SaeArtifact, SaeConfig};
use crate::tensor::Matrix;

/// Counters shared between a `ScriptedRuntime` and the test holding it.
#[derive(Debug, Default)]
pub struct CallLog {
    generate: AtomicUsize,
    forward: AtomicUsize,
    clear: AtomicUsize,
    last_sequence: Mutex<Vec<u32>>,
}

impl CallLog {
    pub fn generate_count(&self) -> usize {
        self.generate.load(Ordering::SeqCst)
    }

    pub fn forward_count(&self) -> usize {
        self.forward.load(Ordering::SeqCst)
    }

    pub fn clear_count(&self) -> usize {
        self.clear.load(Ordering::SeqCst)
    }

    /// Tokens passed to the most recent capture pass.
    pub fn last_sequence(&self) -> Vec<u32> {
        self.last_sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct ScriptedRuntime {
    info: Option<ModelInfo>,
    n_layers: usize,
    hidden_dim: usize,
    generation: Vec<u32>,
    activations: Option<Vec<Vec<f32>>>,
    calls: Arc<CallLog>,
}

impl ScriptedRuntime {
    /// Model id that `load` always refuses.
    pub const UNLOADABLE: &'static str = "missing/model";

    /// A runtime with `model_id` already loaded.
    pub fn new(model_id: &str, n_layers: usize, hidden_dim: usize) -> Self {
        Self {
            info: Some(ModelInfo {
                model_id: model_id.to_string(),
                n_layers,
                hidden_dim,
            }),
            ..Self::unloaded(n_layers, hidden_dim)
        }
    }

    /// A runtime with nothing loaded; `load` accepts any id but
    /// [`UNLOADABLE`](Self::UNLOADABLE).
    pub fn unloaded(n_layers: usize, hidden_dim: usize) -> Self {
        Self {
            info: None,
            n_layers,
            hidden_dim,
            generation: Vec::new(),
            activations: None,
            calls: Arc::new(CallLog::default()),
        }
    }

    pub fn with_generation(mut self, tokens: Vec<u32>) -> Self {
        self.generation = tokens;
        self
    }

    /// Rows returned from every capture pass, whatever the sequence length.
    /// Without this, capture returns zeros shaped to the sequence.
    pub fn with_activations(mut self, rows: Vec<Vec<f32>>) -> Self {
        self.activations = Some(rows);
        self
    }

    pub fn calls(&self) -> Arc<CallLog> {
        Arc::clone(&self.calls)
    }
}

impl ModelRuntime for ScriptedRuntime {
    fn load(&mut self, model_id: &str) -> Result<ModelInfo> {
        if model_id == Self::UNLOADABLE {
            return Err(ModxError::ModelLoad(format!("no weights for {model_id}")));
        }
        let info = ModelInfo {
            model_id: model_id.to_string(),
            n_layers: self.n_layers,
            hidden_dim: self.hidden_dim,
        };
        self.info = Some(info.clone());
        Ok(info)
    }

    fn info(&self) -> Option<&ModelInfo> {
        self.info.as_ref()
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        Ok((0..text.split_whitespace().count() as u32).map(|i| 1000 + i).collect())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        Ok(tokens
            .iter()
            .map(|t| format!("t{t}"))
            .collect::<Vec<_>>()
            .join(" "))
    }

    fn generate(&mut self, _prompt: &[u32], config: &GenerationConfig) -> Result<Vec<u32>> {
        self.calls.generate.fetch_add(1, Ordering::SeqCst);
        let mut out = self.generation.clone();
        out.truncate(config.max_new_tokens);
        Ok(out)
    }

    fn run_with_capture(
        &mut self,
        tokens: &[u32],
        hooks: &[HookPoint],
    ) -> Result<ActivationCapture> {
        self.calls.forward.fetch_add(1, Ordering::SeqCst);
        *self
            .calls
            .last_sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = tokens.to_vec();

        let matrix = match &self.activations {
            Some(rows) => Matrix::from_rows(rows)?,
            None => Matrix::zeros(tokens.len(), self.hidden_dim),
        };
        let mut capture = ActivationCapture::default();
        for hook in hooks {
            capture.activations.insert(hook.name(), matrix.clone());
        }
        Ok(capture)
    }

    fn clear_state(&mut self) -> Result<()> {
        self.calls.clear.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone)]
struct ArtifactParts {
    config: SaeConfig,
    encoder_matrix: Matrix,
    decoder_matrix: Matrix,
    encoder_bias: Vec<f32>,
    decoder_bias: Vec<f32>,
}

#[derive(Clone, Default)]
pub struct InMemoryLoader {
    layers: HashMap<usize, ArtifactParts>,
}

impl InMemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// ReLU SAE with the given encoder, zero biases and a transposed decoder.
    pub fn with_encoder(mut self, layer: usize, encoder_matrix: Matrix) -> Self {
        let (d_model, d_sae) = encoder_matrix.shape();
        let mut decoder_matrix = Matrix::zeros(d_sae, d_model);
        for i in 0..d_model {
            for j in 0..d_sae {
                decoder_matrix.data[j * d_model + i] = encoder_matrix.data[i * d_sae + j];
            }
        }
        self.layers.insert(
            layer,
            ArtifactParts {
                config: SaeConfig::relu(d_model, d_sae),
                encoder_matrix,
                decoder_matrix,
                encoder_bias: vec![0.0; d_sae],
                decoder_bias: vec![0.0; d_model],
            },
        );
        self
    }

    /// Feature `i` reads hidden unit `i` for `i < min(hidden_dim, d_sae)`.
    pub fn with_identity(self, layer: usize, hidden_dim: usize, d_sae: usize) -> Self {
        let mut encoder = Matrix::zeros(hidden_dim, d_sae);
        for i in 0..hidden_dim.min(d_sae) {
            encoder.data[i * d_sae + i] = 1.0;
        }
        self.with_encoder(layer, encoder)
    }

    /// Route hidden unit `unit` to feature `feature`, one pair per unit.
    pub fn with_routes(self, layer: usize, d_sae: usize, routes: &[(usize, usize)]) -> Self {
        let hidden_dim = routes.iter().map(|&(unit, _)| unit + 1).max().unwrap_or(1);
        let mut encoder = Matrix::zeros(hidden_dim, d_sae);
        for &(unit, feature) in routes {
            encoder.data[unit * d_sae + feature] = 1.0;
        }
        self.with_encoder(layer, encoder)
    }
}

impl ArtifactLoader for InMemoryLoader {
    fn is_converted(&self, layer: usize) -> bool {
        self.layers.contains_key(&layer)
    }

    fn load(&self, layer: usize) -> std::result::Result<SaeArtifact, SaeArtifactError> {
        let parts = self
            .layers
            .get(&layer)
            .cloned()
            .ok_or(SaeArtifactError::Missing { layer })?;
        SaeArtifact::new(
            layer,
            parts.config,
            parts.encoder_matrix,
            parts.decoder_matrix,
            parts.encoder_bias,
            parts.decoder_bias,
        )
    }
}
