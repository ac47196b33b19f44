//! Named artifacts produced and consumed by steps within one build.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

/// An opaque handle to something a step produced, e.g. a volume on a worker.
pub trait Artifact: Send + Sync + Debug {
    /// Handle understood by the runtime.
    fn id(&self) -> &str;
}

/// A shared artifact handle.
pub type ArtifactHandle = Arc<dyn Artifact>;

/// An artifact identified only by its runtime handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeArtifact {
    handle: String,
}

impl VolumeArtifact {
    /// Creates an artifact for the given handle.
    #[must_use]
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
        }
    }
}

impl Artifact for VolumeArtifact {
    fn id(&self) -> &str {
        &self.handle
    }
}

/// Name-to-artifact registry with nested scopes.
///
/// A scope created with [`ArtifactRepository::new_scope`] sees everything
/// its parent has, but registrations in the child stay in the child.
#[derive(Debug, Default)]
pub struct ArtifactRepository {
    parent: Option<Arc<ArtifactRepository>>,
    artifacts: RwLock<BTreeMap<String, ArtifactHandle>>,
}

impl ArtifactRepository {
    /// Creates an empty root repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a child scope falling back to this repository.
    #[must_use]
    pub fn new_scope(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(Arc::clone(self)),
            artifacts: RwLock::new(BTreeMap::new()),
        })
    }

    /// Returns the enclosing scope, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<Self>> {
        self.parent.as_ref()
    }

    /// Registers an artifact in this scope, replacing any previous one with the same name.
    pub fn register_artifact(&self, name: impl Into<String>, artifact: ArtifactHandle) {
        self.artifacts.write().insert(name.into(), artifact);
    }

    /// Looks up an artifact here, then in enclosing scopes.
    #[must_use]
    pub fn artifact_for(&self, name: &str) -> Option<ArtifactHandle> {
        if let Some(artifact) = self.artifacts.read().get(name) {
            return Some(Arc::clone(artifact));
        }
        self.parent.as_ref().and_then(|p| p.artifact_for(name))
    }

    /// Returns every visible artifact; local names shadow the parent's.
    #[must_use]
    pub fn as_map(&self) -> BTreeMap<String, ArtifactHandle> {
        let mut all = self
            .parent
            .as_ref()
            .map(|p| p.as_map())
            .unwrap_or_default();
        for (name, artifact) in self.artifacts.read().iter() {
            all.insert(name.clone(), Arc::clone(artifact));
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(handle: &str) -> ArtifactHandle {
        Arc::new(VolumeArtifact::new(handle))
    }

    #[test]
    fn test_lookup_falls_back_to_parent() {
        let root = Arc::new(ArtifactRepository::new());
        root.register_artifact("repo", volume("v1"));

        let child = root.new_scope();
        child.register_artifact("image", volume("v2"));

        assert_eq!(child.artifact_for("repo").unwrap().id(), "v1");
        assert_eq!(child.artifact_for("image").unwrap().id(), "v2");
        assert!(root.artifact_for("image").is_none());
    }

    #[test]
    fn test_child_shadows_parent() {
        let root = Arc::new(ArtifactRepository::new());
        root.register_artifact("repo", volume("v1"));
        let child = root.new_scope();
        child.register_artifact("repo", volume("v2"));

        assert_eq!(child.artifact_for("repo").unwrap().id(), "v2");
        assert_eq!(root.artifact_for("repo").unwrap().id(), "v1");

        let map = child.as_map();
        assert_eq!(map.len(), 1);
        assert_eq!(map["repo"].id(), "v2");
    }

    #[test]
    fn test_missing_artifact_is_none() {
        let root = Arc::new(ArtifactRepository::new());
        assert!(root.artifact_for("nope").is_none());
        assert!(root.parent().is_none());
    }
}
