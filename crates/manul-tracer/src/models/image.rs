//! Image metadata model

use serde::{Deserialize, Serialize};

/// Metadata kept in place of an inline image payload
///
/// Identical images hash to the same `image_hash`, which the store uses as
/// the primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    /// SHA-256 of the decoded image bytes, hex encoded
    pub image_hash: String,

    /// Upper-case format name taken from the MIME subtype (e.g. `PNG`)
    pub format: String,

    /// Size of the decoded image
    pub size_bytes: i64,

    /// Width in pixels, when the header could be read
    pub width: Option<u32>,

    /// Height in pixels, when the header could be read
    pub height: Option<u32>,
}

impl ImageDescriptor {
    /// Size in megabytes
    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }
}
