//! Reading converted SAE artifacts back into memory.

use std::fs::File;
use std::path::Path;

use half::{bf16, f16};
use memmap2::Mmap;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde::Serialize;

use modx_core::sae::{DECODER_BIAS_KEY, DECODER_MATRIX_KEY, ENCODER_BIAS_KEY, ENCODER_MATRIX_KEY};
use modx_core::{ArtifactLoader, Matrix, SaeArtifact, SaeArtifactError, SaeConfig};

use crate::layout::LayerLayout;

/// Dimensions of a structurally valid converted artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ArtifactShapes {
    pub d_model: usize,
    pub d_sae: usize,
    pub dtype: String,
}

pub(crate) fn map_file(path: &Path) -> std::io::Result<Mmap> {
    let file = File::open(path)?;
    // SAFETY: converted files are only ever replaced by rename, never
    // modified in place, and the mapping is read-only.
    unsafe { Mmap::map(&file) }
}

fn shape_of(st: &SafeTensors<'_>, key: &str) -> Result<Vec<usize>, String> {
    st.tensor(key)
        .map(|view| view.shape().to_vec())
        .map_err(|_| format!("missing tensor {key}"))
}

/// Check the runtime-schema tensors against each other. Returns
/// `(d_model, d_sae, dtype)`.
pub(crate) fn check_runtime_tensors(st: &SafeTensors<'_>) -> Result<(usize, usize, Dtype), String> {
    let w_e = shape_of(st, ENCODER_MATRIX_KEY)?;
    let &[d_model, d_sae] = w_e.as_slice() else {
        return Err(format!("{ENCODER_MATRIX_KEY} must be 2-D, got {w_e:?}"));
    };
    let expect = |key: &str, want: &[usize]| -> Result<(), String> {
        let got = shape_of(st, key)?;
        if got != want {
            return Err(format!("{key} has shape {got:?}, expected {want:?}"));
        }
        Ok(())
    };
    expect(DECODER_MATRIX_KEY, &[d_sae, d_model])?;
    expect(ENCODER_BIAS_KEY, &[d_sae])?;
    expect(DECODER_BIAS_KEY, &[d_model])?;
    let dtype = st
        .tensor(ENCODER_MATRIX_KEY)
        .map(|v| v.dtype())
        .map_err(|e| e.to_string())?;
    Ok((d_model, d_sae, dtype))
}

/// Check a config against weight dimensions.
pub(crate) fn check_config(config: &SaeConfig, d_model: usize, d_sae: usize) -> Result<(), String> {
    if config.d_model != d_model {
        return Err(format!(
            "config d_model {} disagrees with weights ({d_model})",
            config.d_model
        ));
    }
    if let Some(cfg_sae) = config.d_sae()
        && cfg_sae != d_sae
    {
        return Err(format!("config d_sae {cfg_sae} disagrees with weights ({d_sae})"));
    }
    config.nonlinearity()?;
    Ok(())
}

/// Decode a float tensor to f32, whatever its stored precision.
pub(crate) fn decode_f32(view: &TensorView<'_>) -> Result<Vec<f32>, String> {
    let data = view.data();
    let values = match view.dtype() {
        Dtype::F32 => data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F16 => data
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        Dtype::BF16 => data
            .chunks_exact(2)
            .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        other => return Err(format!("unsupported tensor dtype {other:?}")),
    };
    Ok(values)
}

/// Converted artifacts under a [`LayerLayout`]; the store-side
/// [`ArtifactLoader`].
#[derive(Clone, Debug)]
pub struct ConvertedLayout {
    layout: LayerLayout,
}

impl ConvertedLayout {
    pub fn new(layout: LayerLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &LayerLayout {
        &self.layout
    }

    /// Full structural check of a layer without decoding any weights.
    pub fn validate(&self, layer: usize) -> Result<ArtifactShapes, String> {
        let weights = self.layout.weights_path(layer);
        let config_path = self.layout.config_path(layer);
        if !weights.is_file() {
            return Err(format!("{} not found", weights.display()));
        }
        if !config_path.is_file() {
            return Err(format!("{} not found", config_path.display()));
        }

        let mmap = map_file(&weights).map_err(|e| e.to_string())?;
        let st = SafeTensors::deserialize(&mmap).map_err(|e| e.to_string())?;
        let (d_model, d_sae, dtype) = check_runtime_tensors(&st)?;

        let config: SaeConfig = std::fs::read(&config_path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()))?;
        check_config(&config, d_model, d_sae)?;

        Ok(ArtifactShapes {
            d_model,
            d_sae,
            dtype: format!("{dtype:?}"),
        })
    }

    fn read(&self, layer: usize) -> Result<SaeArtifact, String> {
        let config: SaeConfig = std::fs::read(self.layout.config_path(layer))
            .map_err(|e| e.to_string())
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()))?;

        let mmap = map_file(&self.layout.weights_path(layer)).map_err(|e| e.to_string())?;
        let st = SafeTensors::deserialize(&mmap).map_err(|e| e.to_string())?;
        let (d_model, d_sae, _) = check_runtime_tensors(&st)?;

        let tensor = |key: &str| -> Result<Vec<f32>, String> {
            let view = st.tensor(key).map_err(|e| e.to_string())?;
            decode_f32(&view).map_err(|e| format!("{key}: {e}"))
        };
        let encoder = Matrix::new(d_model, d_sae, tensor(ENCODER_MATRIX_KEY)?)
            .map_err(|e| e.to_string())?;
        let decoder = Matrix::new(d_sae, d_model, tensor(DECODER_MATRIX_KEY)?)
            .map_err(|e| e.to_string())?;
        let encoder_bias = tensor(ENCODER_BIAS_KEY)?;
        let decoder_bias = tensor(DECODER_BIAS_KEY)?;

        SaeArtifact::new(layer, config, encoder, decoder, encoder_bias, decoder_bias)
            .map_err(|e| e.to_string())
    }
}

impl ArtifactLoader for ConvertedLayout {
    fn is_converted(&self, layer: usize) -> bool {
        self.layout.weights_path(layer).is_file() && self.layout.config_path(layer).is_file()
    }

    fn load(&self, layer: usize) -> Result<SaeArtifact, SaeArtifactError> {
        if !self.is_converted(layer) {
            return Err(SaeArtifactError::Missing { layer });
        }
        self.read(layer)
            .map_err(|reason| SaeArtifactError::Invalid { layer, reason })
    }
}
