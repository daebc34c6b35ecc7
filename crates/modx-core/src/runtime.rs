//! The model runtime boundary.
//!
//! Tokenization, sampling and forward passes belong to an external tensor
//! runtime. The orchestrator sees it only through [`ModelRuntime`], whose
//! activation capture is a plain call returning the captured tensors keyed
//! by hook point, not a callback registered on the forward pass.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::generation::GenerationConfig;
use crate::tensor::Matrix;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub n_layers: usize,
    pub hidden_dim: usize,
}

/// Residual-stream output of a transformer block, the point SAEs read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HookPoint {
    pub layer: usize,
}

impl HookPoint {
    pub fn resid_post(layer: usize) -> Self {
        Self { layer }
    }

    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blocks.{}.hook_resid_post", self.layer)
    }
}

/// Tensors captured during one forward pass, keyed by hook point name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivationCapture {
    pub activations: BTreeMap<String, Matrix>,
}

impl ActivationCapture {
    pub fn take(&mut self, hook: &HookPoint) -> Option<Matrix> {
        self.activations.remove(&hook.name())
    }
}

pub trait ModelRuntime: Send {
    /// Load (or switch to) a model. Loading the already-loaded model is a no-op.
    fn load(&mut self, model_id: &str) -> Result<ModelInfo>;

    /// The loaded model, or `None` before the first successful load.
    fn info(&self) -> Option<&ModelInfo>;

    fn tokenize(&self, text: &str) -> Result<Vec<u32>>;

    fn decode(&self, tokens: &[u32]) -> Result<String>;

    /// Sample a continuation. Returns only the newly generated tokens.
    fn generate(&mut self, prompt: &[u32], config: &GenerationConfig) -> Result<Vec<u32>>;

    /// Run one forward pass over `tokens`, capturing `[seq_len, hidden_dim]`
    /// at each requested hook point.
    fn run_with_capture(&mut self, tokens: &[u32], hooks: &[HookPoint])
    -> Result<ActivationCapture>;

    /// Drop per-request state (KV caches etc.) so one request cannot leak
    /// context into the next.
    fn clear_state(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<R: ModelRuntime + ?Sized> ModelRuntime for Box<R> {
    fn load(&mut self, model_id: &str) -> Result<ModelInfo> {
        (**self).load(model_id)
    }

    fn info(&self) -> Option<&ModelInfo> {
        (**self).info()
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        (**self).tokenize(text)
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        (**self).decode(tokens)
    }

    fn generate(&mut self, prompt: &[u32], config: &GenerationConfig) -> Result<Vec<u32>> {
        (**self).generate(prompt, config)
    }

    fn run_with_capture(
        &mut self,
        tokens: &[u32],
        hooks: &[HookPoint],
    ) -> Result<ActivationCapture> {
        (**self).run_with_capture(tokens, hooks)
    }

    fn clear_state(&mut self) -> Result<()> {
        (**self).clear_state()
    }
}
