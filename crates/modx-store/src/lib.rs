pub mod artifacts;
pub mod convert;
pub mod error;
pub mod jobs;
pub mod layout;
pub mod manifest;
pub mod registry;
pub mod schema;

#[cfg(test)]
mod testutil;

pub use artifacts::{ArtifactShapes, ConvertedLayout};
pub use convert::{
    ConversionReport, Converter, HubSnapshot, LayerOutcome, LayeredSource, LocalSnapshot,
    OwnedTensor, SourceLayer, SourceRepository,
};
pub use error::{Result, StoreError};
pub use jobs::JobStore;
pub use layout::{DEFAULT_LAYER_DIR_TEMPLATE, HUB_CACHE_DIR, LayerLayout, default_source_path};
pub use manifest::{ConversionManifest, LayerManifest};
pub use registry::load_registry;
