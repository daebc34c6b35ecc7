use std::fmt;

/// Failure to obtain a usable SAE artifact for a layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SaeArtifactError {
    /// No converted artifact exists; conversion must run first.
    Missing { layer: usize },
    /// The artifact exists but its shapes or config are unusable.
    Invalid { layer: usize, reason: String },
}

impl SaeArtifactError {
    pub fn layer(&self) -> usize {
        match self {
            SaeArtifactError::Missing { layer } | SaeArtifactError::Invalid { layer, .. } => *layer,
        }
    }
}

impl fmt::Display for SaeArtifactError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaeArtifactError::Missing { layer } => {
                write!(f, "no converted SAE artifact for layer {layer}")
            }
            SaeArtifactError::Invalid { layer, reason } => {
                write!(f, "invalid SAE artifact for layer {layer}: {reason}")
            }
        }
    }
}

impl std::error::Error for SaeArtifactError {}

#[derive(Debug, Clone, PartialEq)]
pub enum ModxError {
    /// Malformed request or out-of-range parameter; never reaches the model.
    Validation(String),
    /// No model is loaded into the runtime session.
    ModelNotLoaded,
    /// The runtime refused or failed to load a model reference.
    ModelLoad(String),
    /// Tokenization, sampling or decoding failed.
    Generation(String),
    /// The activation-capture forward pass failed or returned a bad tensor.
    Probe(String),
    SaeArtifact(SaeArtifactError),
    /// Quarantine registry missing or malformed.
    FeatureRegistry(String),
}

impl ModxError {
    /// Stable tag used in structured error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            ModxError::Validation(_) => "validation_error",
            ModxError::ModelNotLoaded => "model_not_loaded",
            ModxError::ModelLoad(_) => "model_load_error",
            ModxError::Generation(_) => "generation_error",
            ModxError::Probe(_) => "probe_error",
            ModxError::SaeArtifact(_) => "sae_artifact_error",
            ModxError::FeatureRegistry(_) => "feature_registry_error",
        }
    }
}

impl fmt::Display for ModxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModxError::Validation(msg) => write!(f, "validation error: {msg}"),
            ModxError::ModelNotLoaded => write!(f, "model not loaded"),
            ModxError::ModelLoad(msg) => write!(f, "model load failed: {msg}"),
            ModxError::Generation(msg) => write!(f, "generation failed: {msg}"),
            ModxError::Probe(msg) => write!(f, "activation probe failed: {msg}"),
            ModxError::SaeArtifact(e) => write!(f, "{e}"),
            ModxError::FeatureRegistry(msg) => write!(f, "feature registry error: {msg}"),
        }
    }
}

impl std::error::Error for ModxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ModxError::SaeArtifact(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SaeArtifactError> for ModxError {
    fn from(e: SaeArtifactError) -> Self {
        ModxError::SaeArtifact(e)
    }
}

pub type Result<T> = std::result::Result<T, ModxError>;
