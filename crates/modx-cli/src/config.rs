//! Service settings: built-in defaults, then an optional TOML file, then
//! `MODX_*` environment variables, then command-line flags.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use modx_core::{DetectorConfig, GenerationConfig, PipelineSettings, parse_layer_set};
use modx_store::{DEFAULT_LAYER_DIR_TEMPLATE, LayerLayout, default_source_path};

pub const ENV_PREFIX: &str = "MODX_";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub model_id: String,
    /// Layer probed when a request does not name one.
    pub layer: usize,
    pub device: String,

    pub sae_source_repo: String,
    pub sae_base_path: PathBuf,
    /// Local snapshot of the unconverted checkpoints. Defaults to
    /// `sae_base_path` with `-remapped` replaced by `-source`.
    pub sae_source_path: Option<PathBuf>,
    pub layer_dir_template: String,
    pub sae_conversion_layers: String,
    pub force_sae_conversion: bool,
    /// Never download; layers missing from the local snapshot fail.
    pub hub_offline: bool,
    pub quarantined_features_path: PathBuf,

    pub activation_threshold: f32,
    pub feature_top_k: usize,
    pub dedupe_features: bool,

    pub max_new_tokens: usize,
    pub max_new_tokens_limit: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: Option<usize>,
    pub do_sample: bool,
    pub max_probe_tokens: usize,

    /// Base URL of the tensor runtime sidecar. Unset runs detached.
    pub runtime_url: Option<String>,
    pub runtime_timeout_secs: u64,
    pub hf_token: Option<String>,

    pub bind: String,
    /// SQLite file for analysis jobs; in-memory when unset.
    pub jobs_db: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        let generation = GenerationConfig::default();
        let detector = DetectorConfig::default();
        Self {
            model_id: "meta-llama/Llama-3.1-8B-Instruct".into(),
            layer: 21,
            device: "cuda".into(),
            sae_source_repo: "fnlp/Llama3_1-8B-Base-LXR-8x".into(),
            sae_base_path: PathBuf::from("./saes/Llama3_1-8B-Base-LXR-8x-remapped"),
            sae_source_path: None,
            layer_dir_template: DEFAULT_LAYER_DIR_TEMPLATE.into(),
            sae_conversion_layers: "0-31".into(),
            force_sae_conversion: false,
            hub_offline: false,
            quarantined_features_path: PathBuf::from("../features/quarantined_features.json"),
            activation_threshold: detector.activation_threshold,
            feature_top_k: detector.top_k,
            dedupe_features: detector.dedupe_features,
            max_new_tokens: generation.max_new_tokens,
            max_new_tokens_limit: PipelineSettings::default().max_new_tokens_limit,
            temperature: generation.temperature,
            top_p: generation.top_p,
            top_k: generation.top_k,
            do_sample: generation.do_sample,
            max_probe_tokens: PipelineSettings::default().max_probe_tokens,
            runtime_url: None,
            runtime_timeout_secs: 300,
            hf_token: None,
            bind: "127.0.0.1:8000".into(),
            jobs_db: None,
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| {
        anyhow::anyhow!(
            "{ENV_PREFIX}{}: cannot parse '{value}': {e}",
            key.to_uppercase()
        )
    })
}

fn optional(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

impl Settings {
    /// Defaults overlaid with `file` (when given) and the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut settings = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(std::env::vars())?;
        if settings.hf_token.is_none() {
            settings.hf_token = std::env::var("HF_TOKEN").ok().and_then(|t| optional(&t));
        }
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Apply every `MODX_<FIELD>` variable in `vars`. Unknown `MODX_`
    /// names are logged and ignored.
    pub fn apply_env(&mut self, vars: impl IntoIterator<Item = (String, String)>) -> Result<()> {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let key = key.to_ascii_lowercase();
            if !self.set(&key, &value)? {
                tracing::warn!("ignoring unknown setting {name}");
            }
        }
        Ok(())
    }

    /// Set one field by name. Returns false for an unknown name.
    pub fn set(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            "model_id" => self.model_id = value.trim().to_string(),
            "layer" => self.layer = parse(key, value)?,
            "device" => self.device = value.trim().to_string(),
            "sae_source_repo" => self.sae_source_repo = value.trim().to_string(),
            "sae_base_path" => self.sae_base_path = PathBuf::from(value.trim()),
            "sae_source_path" => self.sae_source_path = optional(value).map(PathBuf::from),
            "layer_dir_template" => self.layer_dir_template = value.trim().to_string(),
            "sae_conversion_layers" => self.sae_conversion_layers = value.trim().to_string(),
            "force_sae_conversion" => self.force_sae_conversion = parse(key, value)?,
            "hub_offline" => self.hub_offline = parse(key, value)?,
            "quarantined_features_path" => {
                self.quarantined_features_path = PathBuf::from(value.trim())
            }
            "activation_threshold" => self.activation_threshold = parse(key, value)?,
            "feature_top_k" => self.feature_top_k = parse(key, value)?,
            "dedupe_features" => self.dedupe_features = parse(key, value)?,
            "max_new_tokens" => self.max_new_tokens = parse(key, value)?,
            "max_new_tokens_limit" => self.max_new_tokens_limit = parse(key, value)?,
            "temperature" => self.temperature = parse(key, value)?,
            "top_p" => self.top_p = parse(key, value)?,
            "top_k" => {
                self.top_k = optional(value).map(|v| parse(key, &v)).transpose()?;
            }
            "do_sample" => self.do_sample = parse(key, value)?,
            "max_probe_tokens" => self.max_probe_tokens = parse(key, value)?,
            "runtime_url" => self.runtime_url = optional(value),
            "runtime_timeout_secs" => self.runtime_timeout_secs = parse(key, value)?,
            "hf_token" => self.hf_token = optional(value),
            "bind" => self.bind = value.trim().to_string(),
            "jobs_db" => self.jobs_db = optional(value).map(PathBuf::from),
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.detector_config()
            .validate()
            .context("invalid detector settings")?;
        self.generation_config()
            .validate(self.max_new_tokens_limit)
            .context("invalid generation defaults")?;
        if self.max_probe_tokens == 0 {
            bail!("max_probe_tokens must be at least 1");
        }
        self.conversion_layers()?;
        self.layer_layout()?;
        Ok(())
    }

    pub fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            do_sample: self.do_sample,
        }
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            top_k: self.feature_top_k,
            activation_threshold: self.activation_threshold,
            dedupe_features: self.dedupe_features,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            layer: self.layer,
            generation: self.generation_config(),
            max_new_tokens_limit: self.max_new_tokens_limit,
            max_probe_tokens: self.max_probe_tokens,
        }
    }

    /// The configured conversion set, always including the default layer.
    pub fn conversion_layers(&self) -> Result<Vec<usize>> {
        let mut layers = parse_layer_set(&self.sae_conversion_layers)
            .context("invalid sae_conversion_layers")?;
        if !layers.contains(&self.layer) {
            layers.push(self.layer);
            layers.sort_unstable();
        }
        Ok(layers)
    }

    pub fn layer_layout(&self) -> Result<LayerLayout> {
        LayerLayout::with_template(&self.sae_base_path, &self.layer_dir_template)
            .context("invalid layer_dir_template")
    }

    pub fn source_layout(&self) -> Result<LayerLayout> {
        let root = self
            .sae_source_path
            .clone()
            .unwrap_or_else(|| default_source_path(&self.sae_base_path));
        LayerLayout::with_template(root, &self.layer_dir_template)
            .context("invalid layer_dir_template")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.layer, 21);
        assert_eq!(settings.conversion_layers().unwrap(), (0..32).collect::<Vec<_>>());
        assert_eq!(
            settings.source_layout().unwrap().root(),
            Path::new("./saes/Llama3_1-8B-Base-LXR-8x-source")
        );
    }

    #[test]
    fn test_file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modx.toml");
        std::fs::write(
            &path,
            "layer = 5\nfeature_top_k = 50\nsae_conversion_layers = \"0-7\"\n",
        )
        .unwrap();

        let mut settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.layer, 5);
        assert_eq!(settings.feature_top_k, 50);
        // untouched fields keep their defaults
        assert_eq!(settings.max_new_tokens, 512);

        settings
            .apply_env(vars(&[
                ("MODX_LAYER", "6"),
                ("MODX_RUNTIME_URL", "http://localhost:9000"),
                ("MODX_TOP_K", "40"),
                ("PATH", "/usr/bin"),
            ]))
            .unwrap();
        assert_eq!(settings.layer, 6);
        assert_eq!(settings.runtime_url.as_deref(), Some("http://localhost:9000"));
        assert_eq!(settings.top_k, Some(40));
    }

    #[test]
    fn test_unknown_file_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modx.toml");
        std::fs::write(&path, "layre = 5\n").unwrap();
        assert!(Settings::from_file(&path).is_err());
    }

    #[test]
    fn test_bad_env_value_names_variable() {
        let mut settings = Settings::default();
        let err = settings
            .apply_env(vars(&[("MODX_LAYER", "twenty")]))
            .unwrap_err();
        assert!(err.to_string().contains("MODX_LAYER"));
    }

    #[test]
    fn test_empty_optional_env_clears() {
        let mut settings = Settings {
            runtime_url: Some("http://x".into()),
            ..Default::default()
        };
        settings.apply_env(vars(&[("MODX_RUNTIME_URL", "")])).unwrap();
        assert_eq!(settings.runtime_url, None);
    }

    #[test]
    fn test_default_layer_joins_conversion_set() {
        let settings = Settings {
            layer: 40,
            sae_conversion_layers: "0,1".into(),
            ..Default::default()
        };
        assert_eq!(settings.conversion_layers().unwrap(), vec![0, 1, 40]);
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        let settings = Settings {
            temperature: 3.0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings {
            sae_conversion_layers: "".into(),
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings {
            sae_conversion_layers: "0-4000000000".into(),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
