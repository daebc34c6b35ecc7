//! Two-pass inference orchestrator.
//!
//! A request moves through `Pending → Generating → Probing → Detecting →
//! Completed`. Generation samples a continuation; probing re-runs the full
//! prompt+continuation through the model with activation capture at one
//! residual hook; detection encodes the captured tensor with the layer's SAE
//! and ranks quarantined features. Any stage may fail, and a failed request
//! returns a typed error and no partial result.
//!
//! The runtime session is exclusive: it sits behind a mutex held for
//! Generating and Probing only, so concurrent requests queue there while
//! encoding and detection of earlier requests proceed in parallel.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detector::{FeatureActivation, FeatureDetector};
use crate::error::{ModxError, Result};
use crate::generation::{GenerationConfig, GenerationOverrides};
use crate::runtime::{HookPoint, ModelInfo, ModelRuntime};
use crate::sae::{SaeArtifact, SaeManager};
use crate::tensor::Matrix;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Pending,
    Generating,
    Probing,
    Detecting,
    Completed,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    pub fn can_advance_to(self, next: Stage) -> bool {
        use Stage::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Pending, Generating) | (Generating, Probing) | (Probing, Detecting) => true,
            (Detecting, Completed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::Generating => "generating",
            Stage::Probing => "probing",
            Stage::Detecting => "detecting",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage bookkeeping for one request.
struct StageTracker {
    request_id: Uuid,
    stage: Stage,
}

impl StageTracker {
    fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            stage: Stage::Pending,
        }
    }

    fn advance(&mut self, next: Stage) {
        debug_assert!(
            self.stage.can_advance_to(next),
            "illegal stage transition {} -> {next}",
            self.stage
        );
        tracing::debug!("request {}: {} -> {next}", self.request_id, self.stage);
        self.stage = next;
    }

    fn fail(&mut self, err: &ModxError) {
        if self.stage.can_advance_to(Stage::Failed) {
            tracing::warn!(
                "request {} failed during {}: {err}",
                self.request_id,
                self.stage
            );
            self.stage = Stage::Failed;
        }
    }
}

/// Body of a generate call. Unknown fields are rejected at deserialization.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub do_sample: Option<bool>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn overrides(&self) -> GenerationOverrides {
        GenerationOverrides {
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            do_sample: self.do_sample,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetadata {
    pub model_id: String,
    pub layer: usize,
    pub hook_point: String,
    pub max_activation: f32,
    pub features_checked_per_position: usize,
    pub total_features_checked: usize,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub sequence_length: usize,
    pub positions_probed: usize,
    pub generation_config: GenerationConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub generated_text: String,
    pub prompt: String,
    pub has_quarantined_features: bool,
    pub activated_features: Vec<FeatureActivation>,
    pub generation_metadata: GenerationMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
}

/// Outcome of loading a model and checking it against the default-layer SAE.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub model_id: String,
    pub n_layers: usize,
    pub hidden_dim: usize,
    pub layer: usize,
    pub sae_features: usize,
    pub status: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineSettings {
    /// Probe layer used when a request does not name one.
    pub layer: usize,
    pub generation: GenerationConfig,
    pub max_new_tokens_limit: usize,
    /// Longest prompt+continuation probed; longer sequences keep their head.
    pub max_probe_tokens: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            layer: 21,
            generation: GenerationConfig::default(),
            max_new_tokens_limit: 4096,
            max_probe_tokens: 1024,
        }
    }
}

/// What the locked section hands back to detection.
struct Probed {
    model_id: String,
    sae: Arc<SaeArtifact>,
    generated_text: String,
    prompt_tokens: usize,
    generated_tokens: usize,
    activations: Matrix,
    warnings: Vec<String>,
}

pub struct Orchestrator {
    runtime: Mutex<Box<dyn ModelRuntime>>,
    /// Snapshot of the loaded model, readable while the runtime is busy.
    loaded: RwLock<Option<ModelInfo>>,
    saes: Arc<SaeManager>,
    detector: FeatureDetector,
    settings: PipelineSettings,
}

impl Orchestrator {
    pub fn new(
        runtime: impl ModelRuntime + 'static,
        saes: Arc<SaeManager>,
        detector: FeatureDetector,
        settings: PipelineSettings,
    ) -> Self {
        let loaded = runtime.info().cloned();
        Self {
            runtime: Mutex::new(Box::new(runtime)),
            loaded: RwLock::new(loaded),
            saes,
            detector,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn saes(&self) -> &SaeManager {
        &self.saes
    }

    pub fn detector(&self) -> &FeatureDetector {
        &self.detector
    }

    pub fn model_info(&self) -> Option<ModelInfo> {
        self.loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Load `model_id` into the runtime, replacing whatever was loaded.
    pub fn load_model(&self, model_id: &str) -> Result<ModelInfo> {
        let mut runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        self.load_locked(runtime.as_mut(), model_id)
    }

    fn load_locked(&self, runtime: &mut dyn ModelRuntime, model_id: &str) -> Result<ModelInfo> {
        tracing::info!("loading model {model_id}");
        let info = runtime.load(model_id).map_err(|e| match e {
            ModxError::ModelLoad(_) => e,
            other => ModxError::ModelLoad(other.to_string()),
        })?;
        tracing::info!(
            "model {} ready: {} layers, hidden_dim {}",
            info.model_id,
            info.n_layers,
            info.hidden_dim
        );
        *self.loaded.write().unwrap_or_else(PoisonError::into_inner) = Some(info.clone());
        Ok(info)
    }

    /// Load a model and check that the default-layer SAE fits it.
    pub fn analyze(&self, model_id: &str) -> Result<AnalysisReport> {
        let info = self.load_model(model_id)?;
        let layer = self.settings.layer;
        check_layer(layer, &info)?;
        let sae = self.saes.get_for_model(layer, info.hidden_dim)?;
        Ok(AnalysisReport {
            model_id: info.model_id,
            n_layers: info.n_layers,
            hidden_dim: info.hidden_dim,
            layer,
            sae_features: sae.feature_count(),
            status: "analyzed".into(),
            message: "Model loaded and ready for evaluation".into(),
        })
    }

    /// Run one request through every stage.
    pub fn run(&self, request: &GenerateRequest) -> Result<InferenceResult> {
        let mut tracker = StageTracker::new();
        let result = self.run_stages(request, &mut tracker);
        if let Err(e) = &result {
            tracker.fail(e);
        }
        result
    }

    fn run_stages(
        &self,
        request: &GenerateRequest,
        tracker: &mut StageTracker,
    ) -> Result<InferenceResult> {
        if request.prompt.trim().is_empty() {
            return Err(ModxError::Validation("prompt must not be empty".into()));
        }
        let config = self.settings.generation.with_overrides(&request.overrides());
        config.validate(self.settings.max_new_tokens_limit)?;
        let layer = request.layer.unwrap_or(self.settings.layer);

        let probed = {
            let mut runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
            let outcome = self.generate_and_probe(runtime.as_mut(), request, layer, &config, tracker);
            if let Err(e) = runtime.clear_state() {
                tracing::warn!("failed to clear runtime state: {e}");
            }
            outcome?
        };

        tracker.advance(Stage::Detecting);
        let features = probed.sae.encode(&probed.activations)?;
        let report = self.detector.scan(&features, layer, None);

        let mut warnings = probed.warnings;
        if probed.generated_tokens == 0 {
            warnings.push("model generated no new tokens".into());
        }

        tracker.advance(Stage::Completed);
        tracing::info!(
            "request {} completed: layer {layer}, {} positions, {} quarantined hits",
            tracker.request_id,
            report.positions_checked,
            report.activations.len()
        );

        Ok(InferenceResult {
            generated_text: probed.generated_text,
            prompt: request.prompt.clone(),
            has_quarantined_features: report.has_quarantined_features(),
            generation_metadata: GenerationMetadata {
                model_id: probed.model_id,
                layer,
                hook_point: HookPoint::resid_post(layer).name(),
                max_activation: report.max_activation,
                features_checked_per_position: report.features_checked_per_position,
                total_features_checked: report.total_features_checked(),
                prompt_tokens: probed.prompt_tokens,
                generated_tokens: probed.generated_tokens,
                sequence_length: probed.activations.rows,
                positions_probed: report.positions_checked,
                generation_config: config,
            },
            activated_features: report.activations,
            warnings: (!warnings.is_empty()).then_some(warnings),
        })
    }

    /// Everything that needs the runtime session: model resolution, SAE
    /// resolution, generation and the capture pass.
    fn generate_and_probe(
        &self,
        runtime: &mut dyn ModelRuntime,
        request: &GenerateRequest,
        layer: usize,
        config: &GenerationConfig,
        tracker: &mut StageTracker,
    ) -> Result<Probed> {
        let mut info = runtime.info().cloned().ok_or(ModxError::ModelNotLoaded)?;
        if let Some(wanted) = request.model_id.as_deref()
            && wanted != info.model_id
        {
            info = self.load_locked(runtime, wanted)?;
        }
        check_layer(layer, &info)?;
        // resolve the SAE before spending any generation work
        let sae = self.saes.get_for_model(layer, info.hidden_dim)?;

        tracker.advance(Stage::Generating);
        let prompt_tokens = runtime.tokenize(&request.prompt)?;
        if prompt_tokens.is_empty() {
            return Err(ModxError::Validation("prompt produced no tokens".into()));
        }
        let generated = runtime.generate(&prompt_tokens, config)?;
        let generated_text = runtime.decode(&generated)?;

        tracker.advance(Stage::Probing);
        let mut warnings = Vec::new();
        let mut sequence = prompt_tokens.clone();
        sequence.extend_from_slice(&generated);
        let limit = self.settings.max_probe_tokens;
        if sequence.len() > limit {
            warnings.push(format!(
                "probe truncated to the first {limit} of {} tokens",
                sequence.len()
            ));
            sequence.truncate(limit);
        }

        let hook = HookPoint::resid_post(layer);
        let mut capture = runtime.run_with_capture(&sequence, &[hook])?;
        let activations = capture
            .take(&hook)
            .ok_or_else(|| ModxError::Probe(format!("no activations captured at {hook}")))?;
        activations
            .validate()
            .map_err(|e| ModxError::Probe(e.to_string()))?;
        if activations.shape() != (sequence.len(), info.hidden_dim) {
            return Err(ModxError::Probe(format!(
                "captured tensor is {:?}, expected [{}, {}]",
                activations.shape(),
                sequence.len(),
                info.hidden_dim
            )));
        }

        Ok(Probed {
            model_id: info.model_id,
            sae,
            generated_text,
            prompt_tokens: prompt_tokens.len(),
            generated_tokens: generated.len(),
            activations,
            warnings,
        })
    }
}

fn check_layer(layer: usize, info: &ModelInfo) -> Result<()> {
    if layer >= info.n_layers {
        return Err(ModxError::Validation(format!(
            "layer {layer} out of range for {} ({} layers)",
            info.model_id, info.n_layers
        )));
    }
    Ok(())
}
