use std::path::Path;

use modx_core::{ModxError, QuarantineRegistry};

/// Read the quarantine registry file. Any failure is a registry error;
/// callers treat it as fatal at startup.
pub fn load_registry(path: &Path) -> modx_core::Result<QuarantineRegistry> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ModxError::FeatureRegistry(format!("cannot read {}: {e}", path.display()))
    })?;
    let registry = QuarantineRegistry::from_json_str(&text).map_err(|e| match e {
        ModxError::FeatureRegistry(msg) => {
            ModxError::FeatureRegistry(format!("{}: {msg}", path.display()))
        }
        other => other,
    })?;
    tracing::info!(
        "loaded {} quarantined features from {}",
        registry.len(),
        path.display()
    );
    Ok(registry)
}
