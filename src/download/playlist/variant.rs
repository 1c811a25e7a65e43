use tracing::{debug, info};

use crate::download::playlist::VariantRef;
use crate::error::SelectionError;

/// Picks the variant with the highest bandwidth.
///
/// Ties go to the entry listed first in the manifest, so the choice is
/// stable across runs.
pub fn select(variants: &[VariantRef]) -> Result<&VariantRef, SelectionError> {
    let mut selected = variants.first().ok_or(SelectionError::Empty)?;

    for variant in &variants[1..] {
        if variant.bandwidth > selected.bandwidth {
            selected = variant;
        }
    }

    for (i, variant) in variants.iter().enumerate() {
        debug!(
            option = i + 1,
            bandwidth_mbps = variant.bandwidth as f64 / 1_000_000.0,
            resolution = %variant.resolution_label(),
            "Variant stream"
        );
    }

    info!(
        bandwidth = selected.bandwidth,
        resolution = %selected.resolution_label(),
        url = %selected.manifest_url,
        "Selected highest quality variant"
    );

    Ok(selected)
}
