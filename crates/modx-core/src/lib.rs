//! Quarantined-feature monitoring for language-model inference.
//!
//! A sparse autoencoder decomposes one layer's residual stream into
//! interpretable features; this crate ranks those features per token and
//! flags the ones listed in a quarantine registry. It also owns the
//! two-pass orchestrator (generate, then re-probe the full sequence) and the
//! analysis job model.
//!
//! Zero I/O. Artifacts arrive through [`ArtifactLoader`], the model through
//! [`ModelRuntime`].

pub mod detector;
pub mod error;
pub mod generation;
pub mod jobs;
pub mod layers;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod pipeline;
pub mod registry;
pub mod runtime;
pub mod sae;
pub mod tensor;
pub mod time;

pub use detector::{
    DetectionReport, DetectorConfig, FeatureActivation, FeatureDetector, detect, match_quarantine,
};
pub use error::{ModxError, Result, SaeArtifactError};
pub use generation::{GenerationConfig, GenerationOverrides, MAX_TEMPERATURE};
pub use jobs::{AnalysisJob, JobStatus, ModelReference, parse_model_reference};
pub use layers::parse_layer_set;
pub use pipeline::{
    AnalysisReport, GenerateRequest, GenerationMetadata, InferenceResult, Orchestrator,
    PipelineSettings, Stage,
};
pub use registry::{QuarantineEntry, QuarantineRegistry, Severity};
pub use runtime::{ActivationCapture, HookPoint, ModelInfo, ModelRuntime};
pub use sae::{ArtifactLoader, Nonlinearity, SaeArtifact, SaeConfig, SaeManager};
pub use tensor::Matrix;
