//! Safetensors fixtures for unit tests.

use std::fs;

use half::{bf16, f16};
use safetensors::Dtype;

use crate::convert::OwnedTensor;
use crate::layout::LayerLayout;

pub const SOURCE_HYPERPARAMS: &str =
    r#"{"d_model": 4, "d_sae": 8, "act_fn": "relu", "lr": 0.0004, "l1_coefficient": 1.0}"#;

pub fn encode(values: &[f32], dtype: Dtype) -> Vec<u8> {
    match dtype {
        Dtype::F32 => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        Dtype::F16 => values
            .iter()
            .flat_map(|&v| f16::from_f32(v).to_le_bytes())
            .collect(),
        Dtype::BF16 => values
            .iter()
            .flat_map(|&v| bf16::from_f32(v).to_le_bytes())
            .collect(),
        other => panic!("fixture dtype {other:?} not supported"),
    }
}

/// Tensor of `shape` filled with 0, 1, 2, ... in row-major order.
pub fn counting(shape: &[usize], dtype: Dtype) -> OwnedTensor {
    let n: usize = shape.iter().product();
    let values: Vec<f32> = (0..n).map(|i| i as f32).collect();
    OwnedTensor {
        dtype,
        shape: shape.to_vec(),
        data: encode(&values, dtype),
    }
}

fn write_tensors(path: &std::path::Path, tensors: Vec<(String, OwnedTensor)>) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, safetensors::serialize(tensors, &None).unwrap()).unwrap();
}

/// A layer in the distribution layout.
pub fn write_source(
    layout: &LayerLayout,
    layer: usize,
    d_model: usize,
    d_sae: usize,
    dtype: Dtype,
    hyperparams: Option<&str>,
) {
    write_tensors(
        &layout.weights_path(layer),
        vec![
            ("encoder.weight".into(), counting(&[d_sae, d_model], dtype)),
            ("decoder.weight".into(), counting(&[d_model, d_sae], dtype)),
            ("encoder.bias".into(), counting(&[d_sae], dtype)),
            ("decoder.bias".into(), counting(&[d_model], dtype)),
        ],
    );
    if let Some(h) = hyperparams {
        fs::write(layout.hyperparams_path(layer), h).unwrap();
    }
    fs::write(layout.lm_config_path(layer), r#"{"d_model": 4096}"#).unwrap();
}

/// A layer already in the runtime schema with a ReLU config.
pub fn write_converted(
    layout: &LayerLayout,
    layer: usize,
    d_model: usize,
    d_sae: usize,
    dtype: Dtype,
) {
    write_tensors(
        &layout.weights_path(layer),
        vec![
            ("W_E".into(), counting(&[d_model, d_sae], dtype)),
            ("W_D".into(), counting(&[d_sae, d_model], dtype)),
            ("b_E".into(), counting(&[d_sae], dtype)),
            ("b_D".into(), counting(&[d_model], dtype)),
        ],
    );
    fs::write(
        layout.config_path(layer),
        format!(r#"{{"d_model": {d_model}, "d_sae": {d_sae}}}"#),
    )
    .unwrap();
}

/// Arbitrary zero-filled F32 tensors plus a raw config string.
pub fn write_raw_converted(
    layout: &LayerLayout,
    layer: usize,
    tensors: &[(&str, &[usize])],
    config: &str,
) {
    let tensors = tensors
        .iter()
        .map(|&(name, shape)| {
            let n: usize = shape.iter().product();
            (
                name.to_string(),
                OwnedTensor {
                    dtype: Dtype::F32,
                    shape: shape.to_vec(),
                    data: vec![0; n * 4],
                },
            )
        })
        .collect();
    write_tensors(&layout.weights_path(layer), tensors);
    fs::write(layout.config_path(layer), config).unwrap();
}
