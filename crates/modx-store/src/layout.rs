//! Deterministic on-disk layout of per-layer SAE directories.
//!
//! ```text
//! <root>/<layer_dir>/checkpoints/final.safetensors
//! <root>/<layer_dir>/config.json        (converted side)
//! <root>/<layer_dir>/hyperparams.json   (source side)
//! <root>/<layer_dir>/lm_config.json
//! ```
//!
//! `layer_dir` comes from a template containing `{layer}`.

use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};

pub const DEFAULT_LAYER_DIR_TEMPLATE: &str = "Llama3_1-8B-Base-L{layer}R-8x";
pub const WEIGHTS_FILE: &str = "final.safetensors";
pub const CHECKPOINTS_DIR: &str = "checkpoints";
pub const CONFIG_FILE: &str = "config.json";
pub const HYPERPARAMS_FILE: &str = "hyperparams.json";
pub const LM_CONFIG_FILE: &str = "lm_config.json";
/// hf-hub cache directory inside a source snapshot root.
pub const HUB_CACHE_DIR: &str = ".hub-cache";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerLayout {
    root: PathBuf,
    template: String,
}

impl LayerLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            template: DEFAULT_LAYER_DIR_TEMPLATE.to_string(),
        }
    }

    pub fn with_template(root: impl Into<PathBuf>, template: &str) -> Result<Self> {
        if !template.contains("{layer}") {
            return Err(StoreError::InvalidData(format!(
                "layer directory template '{template}' lacks a {{layer}} placeholder"
            )));
        }
        if template.contains('/') || template.contains('\\') {
            return Err(StoreError::InvalidData(format!(
                "layer directory template '{template}' must be a single path component"
            )));
        }
        Ok(Self {
            root: root.into(),
            template: template.to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn layer_dir_name(&self, layer: usize) -> String {
        self.template.replace("{layer}", &layer.to_string())
    }

    pub fn layer_dir(&self, layer: usize) -> PathBuf {
        self.root.join(self.layer_dir_name(layer))
    }

    pub fn weights_path(&self, layer: usize) -> PathBuf {
        self.layer_dir(layer).join(CHECKPOINTS_DIR).join(WEIGHTS_FILE)
    }

    pub fn config_path(&self, layer: usize) -> PathBuf {
        self.layer_dir(layer).join(CONFIG_FILE)
    }

    pub fn hyperparams_path(&self, layer: usize) -> PathBuf {
        self.layer_dir(layer).join(HYPERPARAMS_FILE)
    }

    pub fn lm_config_path(&self, layer: usize) -> PathBuf {
        self.layer_dir(layer).join(LM_CONFIG_FILE)
    }
}

/// Where the unconverted snapshot lives when not configured explicitly:
/// the base path with `-remapped` swapped for `-source`.
pub fn default_source_path(base: &Path) -> PathBuf {
    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let source_name = if name.contains("-remapped") {
        name.replace("-remapped", "-source")
    } else {
        format!("{name}-source")
    };
    base.with_file_name(source_name)
}

/// Write via a sibling temp file and rename, so readers never observe a
/// partially written file at `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp: OsString = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)
}
