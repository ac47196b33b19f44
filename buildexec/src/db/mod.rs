//! Interfaces to the persistence layer.
//!
//! Storage is an external collaborator: this crate only defines what it
//! needs from builds, pipelines, locks and check scopes. In-memory
//! implementations for tests live in [`crate::testing`].

mod build;
mod resource;

pub use build::{Build, CHECK_BUILD_NAME};
pub use resource::{
    LastCheck, Pipeline, Resource, ResourceCache, ResourceConfig, ResourceConfigScope,
    ResourceType,
};

use crate::errors::Result;
use async_trait::async_trait;
use std::fmt::Debug;

/// An acquired advisory lock.
#[async_trait]
pub trait Lock: Send + Sync + Debug {
    /// Releases the lock.
    async fn release(&self) -> Result<()>;
}

/// Lock handed out when no real locking is needed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoopLock;

#[async_trait]
impl Lock for NoopLock {
    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

/// Subscription to abort requests for one build.
#[async_trait]
pub trait AbortNotifier: Send + Sync {
    /// Resolves once the build has been marked aborted, immediately if it
    /// already was when the notifier was created.
    async fn notified(&self);
    /// Unsubscribes.
    async fn close(&self) -> Result<()>;
}
