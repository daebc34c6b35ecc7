use serde::{Deserialize, Serialize};

use crate::error::{ModxError, Result};

pub const MAX_TEMPERATURE: f32 = 2.0;

/// Effective sampling parameters handed to the model runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    pub do_sample: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            top_k: None,
            do_sample: true,
        }
    }
}

/// Per-request overrides; `None` falls back to the service default.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOverrides {
    pub max_new_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<usize>,
    pub do_sample: Option<bool>,
}

impl GenerationConfig {
    pub fn with_overrides(&self, o: &GenerationOverrides) -> Self {
        Self {
            max_new_tokens: o.max_new_tokens.unwrap_or(self.max_new_tokens),
            temperature: o.temperature.unwrap_or(self.temperature),
            top_p: o.top_p.unwrap_or(self.top_p),
            top_k: o.top_k.or(self.top_k),
            do_sample: o.do_sample.unwrap_or(self.do_sample),
        }
    }

    /// Range checks. `max_new_tokens_limit` bounds the work a single
    /// request can demand from the shared runtime.
    pub fn validate(&self, max_new_tokens_limit: usize) -> Result<()> {
        if self.max_new_tokens == 0 || self.max_new_tokens > max_new_tokens_limit {
            return Err(ModxError::Validation(format!(
                "max_new_tokens must be in 1..={max_new_tokens_limit}, got {}",
                self.max_new_tokens
            )));
        }
        if !self.temperature.is_finite() || !(0.0..=MAX_TEMPERATURE).contains(&self.temperature) {
            return Err(ModxError::Validation(format!(
                "temperature must be in [0, {MAX_TEMPERATURE}], got {}",
                self.temperature
            )));
        }
        if !self.top_p.is_finite() || !(0.0..=1.0).contains(&self.top_p) {
            return Err(ModxError::Validation(format!(
                "top_p must be in [0, 1], got {}",
                self.top_p
            )));
        }
        if self.top_k == Some(0) {
            return Err(ModxError::Validation("top_k must be at least 1".into()));
        }
        Ok(())
    }
}
