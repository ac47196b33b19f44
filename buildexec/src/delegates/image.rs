//! Turning fetched image artifacts into something the runtime can stream.

use crate::errors::Result;
use crate::exec::ArtifactHandle;
use async_trait::async_trait;

/// Converts an image artifact into a location the container runtime can
/// stream the image from.
#[async_trait]
pub trait ArtifactSourcer: Send + Sync {
    /// Returns the source for `artifact`.
    async fn source_image(&self, artifact: &ArtifactHandle) -> Result<String>;
}

/// Addresses artifacts by their volume handle.
#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeSourcer;

#[async_trait]
impl ArtifactSourcer for VolumeSourcer {
    async fn source_image(&self, artifact: &ArtifactHandle) -> Result<String> {
        Ok(format!("volume://{}", artifact.id()))
    }
}
