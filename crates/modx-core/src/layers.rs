use std::collections::BTreeSet;

use crate::error::{ModxError, Result};

/// Layer indices must stay below this.
pub const MAX_LAYERS: usize = 4096;

/// Parse a layer set such as `"0-31"`, `"0,1,21"` or `"0-3,21"`.
///
/// Returns the layers ascending and de-duplicated. Ranges are inclusive.
/// Indices at or above [`MAX_LAYERS`] are rejected before any range is
/// expanded.
pub fn parse_layer_set(spec: &str) -> Result<Vec<usize>> {
    let invalid = |part: &str, why: &str| {
        ModxError::Validation(format!("invalid layer set '{spec}': {why} in '{part}'"))
    };

    let mut layers = BTreeSet::new();
    for part in spec.split(',').map(str::trim) {
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().map_err(|_| invalid(part, "bad start"))?;
                let hi: usize = hi.trim().parse().map_err(|_| invalid(part, "bad end"))?;
                if lo > hi {
                    return Err(invalid(part, "descending range"));
                }
                if hi >= MAX_LAYERS {
                    return Err(invalid(part, "layer index out of range"));
                }
                layers.extend(lo..=hi);
            }
            None => {
                let layer: usize = part.parse().map_err(|_| invalid(part, "not a layer index"))?;
                if layer >= MAX_LAYERS {
                    return Err(invalid(part, "layer index out of range"));
                }
                layers.insert(layer);
            }
        }
    }

    if layers.is_empty() {
        return Err(ModxError::Validation(format!("layer set '{spec}' is empty")));
    }
    Ok(layers.into_iter().collect())
}
