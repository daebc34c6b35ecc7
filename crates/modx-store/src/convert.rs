//! One-time SAE conversion from the distribution layout to the runtime
//! schema.
//!
//! Source checkpoints store `encoder.weight [d_sae, d_model]`,
//! `decoder.weight [d_model, d_sae]` and their biases. The runtime expects
//! `W_E [d_model, d_sae]`, `W_D [d_sae, d_model]`, `b_E`, `b_D`. Conversion
//! renames, transposes the two matrices, and writes the result next to a
//! `config.json` derived from the source hyperparameters.
//!
//! Idempotence is a property of the filesystem: a layer whose converted
//! files exist and pass a structural check is skipped without any fetch or
//! write, across process restarts.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use hf_hub::api::sync::ApiBuilder;
use safetensors::{Dtype, SafeTensors, View};
use serde::Serialize;

use modx_core::sae::{DECODER_BIAS_KEY, DECODER_MATRIX_KEY, ENCODER_BIAS_KEY, ENCODER_MATRIX_KEY};
use modx_core::SaeConfig;

use crate::artifacts::{ConvertedLayout, check_config, check_runtime_tensors, map_file};
use crate::error::{Result, StoreError};
use crate::layout::{
    CHECKPOINTS_DIR, HYPERPARAMS_FILE, LM_CONFIG_FILE, LayerLayout, WEIGHTS_FILE, write_atomic,
};

/// Local paths of one layer's source files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLayer {
    pub weights: PathBuf,
    pub hyperparams: Option<PathBuf>,
    pub lm_config: Option<PathBuf>,
}

/// Where unconverted checkpoints come from.
pub trait SourceRepository {
    fn describe(&self) -> String;

    fn fetch(&self, layer: usize) -> Result<SourceLayer>;
}

/// An already downloaded snapshot with the per-layer directory layout.
#[derive(Clone, Debug)]
pub struct LocalSnapshot {
    layout: LayerLayout,
}

impl LocalSnapshot {
    pub fn new(layout: LayerLayout) -> Self {
        Self { layout }
    }

    pub fn has_layer(&self, layer: usize) -> bool {
        self.layout.weights_path(layer).is_file()
    }
}

impl SourceRepository for LocalSnapshot {
    fn describe(&self) -> String {
        format!("local snapshot {}", self.layout.root().display())
    }

    fn fetch(&self, layer: usize) -> Result<SourceLayer> {
        let weights = self.layout.weights_path(layer);
        if !weights.is_file() {
            return Err(StoreError::Fetch(format!(
                "source weights not found: {}",
                weights.display()
            )));
        }
        let optional = |p: PathBuf| p.is_file().then_some(p);
        Ok(SourceLayer {
            weights,
            hyperparams: optional(self.layout.hyperparams_path(layer)),
            lm_config: optional(self.layout.lm_config_path(layer)),
        })
    }
}

/// Local snapshot first, per layer; layers it lacks come from `remote`.
pub struct LayeredSource {
    local: LocalSnapshot,
    remote: Option<Box<dyn SourceRepository>>,
}

impl LayeredSource {
    pub fn new(local: LocalSnapshot) -> Self {
        Self {
            local,
            remote: None,
        }
    }

    pub fn with_remote(mut self, remote: impl SourceRepository + 'static) -> Self {
        self.remote = Some(Box::new(remote));
        self
    }
}

impl SourceRepository for LayeredSource {
    fn describe(&self) -> String {
        match &self.remote {
            Some(remote) => format!("{}, then {}", self.local.describe(), remote.describe()),
            None => self.local.describe(),
        }
    }

    fn fetch(&self, layer: usize) -> Result<SourceLayer> {
        match &self.remote {
            Some(remote) if !self.local.has_layer(layer) => remote.fetch(layer),
            _ => self.local.fetch(layer),
        }
    }
}

/// Per-layer downloads from a Hugging Face model repository. Files land in
/// the hf-hub cache layout (`models--<org>--<name>/snapshots/<sha>/...`)
/// and are reused from there on later fetches.
#[derive(Clone, Debug)]
pub struct HubSnapshot {
    repo_id: String,
    layer_dirs: LayerLayout,
    token: Option<String>,
    cache_dir: Option<PathBuf>,
}

impl HubSnapshot {
    /// `template` names the per-layer directory inside the repo.
    pub fn new(repo_id: &str, template: &str) -> Result<Self> {
        Ok(Self {
            repo_id: repo_id.to_string(),
            layer_dirs: LayerLayout::with_template("", template)?,
            token: None,
            cache_dir: None,
        })
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }
}

impl SourceRepository for HubSnapshot {
    fn describe(&self) -> String {
        format!("hub repo {}", self.repo_id)
    }

    fn fetch(&self, layer: usize) -> Result<SourceLayer> {
        let mut builder = ApiBuilder::new()
            .with_progress(false)
            .with_token(self.token.clone());
        if let Some(dir) = &self.cache_dir {
            builder = builder.with_cache_dir(dir.clone());
        }
        let api = builder
            .build()
            .map_err(|e| StoreError::Fetch(format!("hub client: {e}")))?;
        let repo = api.model(self.repo_id.clone());

        let dir = self.layer_dirs.layer_dir_name(layer);
        let remote = |file: &str| format!("{dir}/{file}");
        tracing::info!("downloading layer {layer} from {}", self.repo_id);
        let weights = repo
            .get(&remote(&format!("{CHECKPOINTS_DIR}/{WEIGHTS_FILE}")))
            .map_err(|e| StoreError::Fetch(format!("{}: layer {layer}: {e}", self.repo_id)))?;
        Ok(SourceLayer {
            weights,
            hyperparams: repo.get(&remote(HYPERPARAMS_FILE)).ok(),
            lm_config: repo.get(&remote(LM_CONFIG_FILE)).ok(),
        })
    }
}

/// Per-layer conversion result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "lowercase")]
pub enum LayerOutcome {
    Skipped,
    Converted,
    Failed(String),
}

impl fmt::Display for LayerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerOutcome::Skipped => f.write_str("skipped"),
            LayerOutcome::Converted => f.write_str("converted"),
            LayerOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConversionReport {
    pub outcomes: BTreeMap<usize, LayerOutcome>,
}

impl ConversionReport {
    pub fn outcome(&self, layer: usize) -> Option<&LayerOutcome> {
        self.outcomes.get(&layer)
    }

    fn layers_where(&self, pred: impl Fn(&LayerOutcome) -> bool) -> Vec<usize> {
        self.outcomes
            .iter()
            .filter(|(_, o)| pred(o))
            .map(|(&l, _)| l)
            .collect()
    }

    pub fn converted(&self) -> Vec<usize> {
        self.layers_where(|o| *o == LayerOutcome::Converted)
    }

    pub fn skipped(&self) -> Vec<usize> {
        self.layers_where(|o| *o == LayerOutcome::Skipped)
    }

    pub fn failed(&self) -> Vec<usize> {
        self.layers_where(|o| matches!(o, LayerOutcome::Failed(_)))
    }

    /// Layers from `required` that failed or were never attempted.
    pub fn failed_required(&self, required: &[usize]) -> Vec<usize> {
        required
            .iter()
            .copied()
            .filter(|l| {
                !matches!(
                    self.outcome(*l),
                    Some(LayerOutcome::Skipped | LayerOutcome::Converted)
                )
            })
            .collect()
    }
}

/// An owned tensor buffer ready for serialization.
#[derive(Clone, Debug, PartialEq)]
pub struct OwnedTensor {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl View for OwnedTensor {
    fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

pub fn element_size(dtype: Dtype) -> Option<usize> {
    match dtype {
        Dtype::F64 | Dtype::I64 | Dtype::U64 => Some(8),
        Dtype::F32 | Dtype::I32 | Dtype::U32 => Some(4),
        Dtype::F16 | Dtype::BF16 | Dtype::I16 | Dtype::U16 => Some(2),
        Dtype::BOOL | Dtype::U8 | Dtype::I8 => Some(1),
        _ => None,
    }
}

/// Transpose a row-major `[rows, cols]` buffer of `elem`-byte elements.
/// Moves whole elements, so the bit patterns are untouched.
pub fn transpose_bytes(data: &[u8], rows: usize, cols: usize, elem: usize) -> Vec<u8> {
    debug_assert_eq!(data.len(), rows * cols * elem);
    let mut out = vec![0u8; data.len()];
    for r in 0..rows {
        for c in 0..cols {
            let src = (r * cols + c) * elem;
            let dst = (c * rows + r) * elem;
            out[dst..dst + elem].copy_from_slice(&data[src..src + elem]);
        }
    }
    out
}

/// Runtime name for a source key, and whether the tensor is transposed.
pub fn rename_key(key: &str) -> (&str, bool) {
    match key {
        "encoder.weight" => (ENCODER_MATRIX_KEY, true),
        "decoder.weight" => (DECODER_MATRIX_KEY, true),
        "encoder.bias" => (ENCODER_BIAS_KEY, false),
        "decoder.bias" => (DECODER_BIAS_KEY, false),
        other => (other, false),
    }
}

/// Rename and transpose a source checkpoint into runtime-schema tensors.
pub fn remap_tensors(
    source: &SafeTensors<'_>,
) -> std::result::Result<Vec<(String, OwnedTensor)>, String> {
    let mut out = Vec::new();
    for (key, view) in source.tensors() {
        let (name, transpose) = rename_key(&key);
        let dtype = view.dtype();
        let mut shape = view.shape().to_vec();
        let data = if transpose {
            let &[rows, cols] = shape.as_slice() else {
                return Err(format!("{key} must be 2-D to transpose, got {shape:?}"));
            };
            let elem = element_size(dtype)
                .ok_or_else(|| format!("{key}: cannot transpose dtype {dtype:?}"))?;
            shape = vec![cols, rows];
            transpose_bytes(view.data(), rows, cols, elem)
        } else {
            view.data().to_vec()
        };
        out.push((name.to_string(), OwnedTensor { dtype, shape, data }));
    }
    Ok(out)
}

pub struct Converter<'a> {
    target: &'a ConvertedLayout,
    source: &'a dyn SourceRepository,
}

impl<'a> Converter<'a> {
    pub fn new(target: &'a ConvertedLayout, source: &'a dyn SourceRepository) -> Self {
        Self { target, source }
    }

    /// Convert every layer in `layers`. One layer failing never stops the
    /// others; the report carries each outcome.
    pub fn convert(&self, layers: &[usize], force: bool) -> ConversionReport {
        tracing::info!(
            "converting SAE layers {layers:?} from {} (force={force})",
            self.source.describe()
        );
        let mut report = ConversionReport::default();
        for &layer in layers {
            let outcome = self.convert_layer(layer, force);
            match &outcome {
                LayerOutcome::Skipped => tracing::debug!("layer {layer}: already converted"),
                LayerOutcome::Converted => tracing::info!("layer {layer}: converted"),
                LayerOutcome::Failed(reason) => tracing::error!("layer {layer}: {reason}"),
            }
            report.outcomes.insert(layer, outcome);
        }
        tracing::info!(
            "conversion finished: {} converted, {} skipped, {} failed",
            report.converted().len(),
            report.skipped().len(),
            report.failed().len()
        );
        report
    }

    pub fn convert_layer(&self, layer: usize, force: bool) -> LayerOutcome {
        if !force && self.target.validate(layer).is_ok() {
            return LayerOutcome::Skipped;
        }
        match self.fetch_and_write(layer) {
            Ok(()) => LayerOutcome::Converted,
            Err(reason) => LayerOutcome::Failed(reason),
        }
    }

    fn fetch_and_write(&self, layer: usize) -> std::result::Result<(), String> {
        let src = self.source.fetch(layer).map_err(|e| e.to_string())?;

        let mmap = map_file(&src.weights)
            .map_err(|e| format!("{}: {e}", src.weights.display()))?;
        let checkpoint = SafeTensors::deserialize(&mmap).map_err(|e| e.to_string())?;
        let tensors = remap_tensors(&checkpoint)?;
        let bytes = safetensors::serialize(tensors, &None).map_err(|e| e.to_string())?;

        // re-read what we are about to write so a bad checkpoint never lands
        let written = SafeTensors::deserialize(&bytes).map_err(|e| e.to_string())?;
        let (d_model, d_sae, _) = check_runtime_tensors(&written)?;
        let config = config_bytes(src.hyperparams.as_deref(), d_model, d_sae)?;

        let layout = self.target.layout();
        let checkpoints = layout.layer_dir(layer).join(CHECKPOINTS_DIR);
        fs::create_dir_all(&checkpoints).map_err(|e| format!("{}: {e}", checkpoints.display()))?;

        let write = |path: &Path, data: &[u8]| {
            write_atomic(path, data).map_err(|e| format!("{}: {e}", path.display()))
        };
        write(&layout.weights_path(layer), &bytes)?;
        write(&layout.config_path(layer), &config)?;
        if let Some(lm_config) = &src.lm_config {
            let data = fs::read(lm_config).map_err(|e| format!("{}: {e}", lm_config.display()))?;
            write(&layout.lm_config_path(layer), &data)?;
        }
        Ok(())
    }
}

/// The source hyperparameters byte-for-byte when present and consistent
/// with the weights; a minimal ReLU config otherwise.
fn config_bytes(
    hyperparams: Option<&Path>,
    d_model: usize,
    d_sae: usize,
) -> std::result::Result<Vec<u8>, String> {
    match hyperparams {
        Some(path) => {
            let bytes = fs::read(path).map_err(|e| format!("{}: {e}", path.display()))?;
            let config: SaeConfig = serde_json::from_slice(&bytes)
                .map_err(|e| format!("{}: {e}", path.display()))?;
            check_config(&config, d_model, d_sae)?;
            Ok(bytes)
        }
        None => {
            tracing::warn!("no {HYPERPARAMS_FILE}; writing a ReLU config for d_model={d_model}");
            serde_json::to_vec_pretty(&SaeConfig::relu(d_model, d_sae)).map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{SOURCE_HYPERPARAMS, write_source};

    struct Unreachable;

    impl SourceRepository for Unreachable {
        fn describe(&self) -> String {
            "nowhere".into()
        }

        fn fetch(&self, layer: usize) -> Result<SourceLayer> {
            Err(StoreError::Fetch(format!("layer {layer} unreachable")))
        }
    }

    #[test]
    fn test_transpose_bytes() {
        // [2, 3] of 2-byte elements labelled by (row, col)
        let data: Vec<u8> = [(0u8, 0u8), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]
            .iter()
            .flat_map(|&(r, c)| [r, c])
            .collect();
        let t = transpose_bytes(&data, 2, 3, 2);
        assert_eq!(t, vec![0, 0, 1, 0, 0, 1, 1, 1, 0, 2, 1, 2]);
    }

    #[test]
    fn test_rename_key() {
        assert_eq!(rename_key("encoder.weight"), ("W_E", true));
        assert_eq!(rename_key("decoder.weight"), ("W_D", true));
        assert_eq!(rename_key("encoder.bias"), ("b_E", false));
        assert_eq!(rename_key("decoder.bias"), ("b_D", false));
        assert_eq!(rename_key("log_jumprelu_threshold"), ("log_jumprelu_threshold", false));
    }

    #[test]
    fn test_convert_layer_then_skip() {
        let dir = tempfile::tempdir().unwrap();
        let source = LayerLayout::new(dir.path().join("src"));
        write_source(&source, 3, 4, 8, Dtype::F32, Some(SOURCE_HYPERPARAMS));
        let target = ConvertedLayout::new(LayerLayout::new(dir.path().join("out")));
        let snapshot = LocalSnapshot::new(source);
        let converter = Converter::new(&target, &snapshot);

        assert_eq!(converter.convert_layer(3, false), LayerOutcome::Converted);
        let shapes = target.validate(3).unwrap();
        assert_eq!((shapes.d_model, shapes.d_sae), (4, 8));
        // hyperparams are copied verbatim
        assert_eq!(
            fs::read_to_string(target.layout().config_path(3)).unwrap(),
            SOURCE_HYPERPARAMS
        );
        assert!(target.layout().lm_config_path(3).is_file());

        assert_eq!(converter.convert_layer(3, false), LayerOutcome::Skipped);
        assert_eq!(converter.convert_layer(3, true), LayerOutcome::Converted);
    }

    #[test]
    fn test_missing_hyperparams_synthesizes_config() {
        let dir = tempfile::tempdir().unwrap();
        let source = LayerLayout::new(dir.path().join("src"));
        write_source(&source, 0, 2, 6, Dtype::F16, None);
        let target = ConvertedLayout::new(LayerLayout::new(dir.path().join("out")));
        let snapshot = LocalSnapshot::new(source);

        assert_eq!(
            Converter::new(&target, &snapshot).convert_layer(0, false),
            LayerOutcome::Converted
        );
        let config: SaeConfig =
            serde_json::from_slice(&fs::read(target.layout().config_path(0)).unwrap()).unwrap();
        assert_eq!(config.d_model, 2);
        assert_eq!(config.d_sae(), Some(6));
        assert_eq!(config.act_fn, "relu");
    }

    #[test]
    fn test_inconsistent_hyperparams_fail_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let source = LayerLayout::new(dir.path().join("src"));
        write_source(&source, 1, 4, 8, Dtype::F32, Some(r#"{"d_model": 4096, "d_sae": 8}"#));
        let target = ConvertedLayout::new(LayerLayout::new(dir.path().join("out")));
        let snapshot = LocalSnapshot::new(source);

        let outcome = Converter::new(&target, &snapshot).convert_layer(1, false);
        assert!(matches!(outcome, LayerOutcome::Failed(ref r) if r.contains("d_model")));
        assert!(!target.layout().weights_path(1).exists());
    }

    #[test]
    fn test_fetch_failure_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let target = ConvertedLayout::new(LayerLayout::new(dir.path()));
        let report = Converter::new(&target, &Unreachable).convert(&[0, 1], false);
        assert_eq!(report.failed(), vec![0, 1]);
        assert!(matches!(report.outcome(0), Some(LayerOutcome::Failed(r)) if r.contains("unreachable")));
    }

    #[test]
    fn test_layered_source_prefers_local_layers() {
        let dir = tempfile::tempdir().unwrap();
        let source = LayerLayout::new(dir.path().join("src"));
        write_source(&source, 2, 4, 8, Dtype::F32, None);
        let layered = LayeredSource::new(LocalSnapshot::new(source.clone())).with_remote(Unreachable);

        assert_eq!(layered.fetch(2).unwrap().weights, source.weights_path(2));
        let err = layered.fetch(3).unwrap_err();
        assert!(err.to_string().contains("layer 3 unreachable"));
        assert!(layered.describe().ends_with("then nowhere"));
    }

    #[test]
    fn test_layered_source_without_remote_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let layered = LayeredSource::new(LocalSnapshot::new(LayerLayout::new(dir.path())));
        assert!(layered.fetch(0).unwrap_err().to_string().contains("source weights not found"));
    }

    #[test]
    fn test_failed_required() {
        let mut report = ConversionReport::default();
        report.outcomes.insert(0, LayerOutcome::Converted);
        report.outcomes.insert(1, LayerOutcome::Skipped);
        report.outcomes.insert(2, LayerOutcome::Failed("x".into()));
        assert!(report.failed_required(&[0, 1]).is_empty());
        assert_eq!(report.failed_required(&[1, 2, 9]), vec![2, 9]);
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(LayerOutcome::Failed("boom".into())).unwrap();
        assert_eq!(json, serde_json::json!({"outcome": "failed", "reason": "boom"}));
        let json = serde_json::to_value(LayerOutcome::Skipped).unwrap();
        assert_eq!(json, serde_json::json!({"outcome": "skipped"}));
    }
}
