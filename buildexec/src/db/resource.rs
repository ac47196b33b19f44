//! Pipeline, resource and check-scope collaborators used by check steps.

use super::Lock;
use crate::errors::Result;
use crate::plan::Version;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Outcome of the most recent check of a config scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastCheck {
    /// When the check started.
    pub start_time: DateTime<Utc>,
    /// When the check ended.
    pub end_time: DateTime<Utc>,
    /// Whether it succeeded.
    pub succeeded: bool,
}

/// A fetched resource version cached on a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCache {
    /// Cache ID.
    pub id: i64,
    /// Resource type the cache was fetched with.
    pub resource_type: String,
    /// Cached version.
    pub version: Version,
}

/// A pipeline.
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Pipeline ID.
    fn id(&self) -> i64;
    /// Pipeline name.
    fn name(&self) -> String;
    /// Looks up a resource by name.
    async fn resource(&self, name: &str) -> Result<Option<Arc<dyn Resource>>>;
    /// Looks up a resource type by name.
    async fn resource_type(&self, name: &str) -> Result<Option<Arc<dyn ResourceType>>>;
}

/// A pipeline resource.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Resource ID.
    fn id(&self) -> i64;
    /// Resource name.
    fn name(&self) -> String;
    /// Points the resource at the given config scope.
    async fn set_resource_config_scope(&self, scope: &dyn ResourceConfigScope) -> Result<()>;
}

/// A pipeline resource type.
#[async_trait]
pub trait ResourceType: Send + Sync {
    /// Type name.
    fn name(&self) -> String;
    /// Points the type at the given config scope.
    async fn set_resource_config_scope(&self, scope: &dyn ResourceConfigScope) -> Result<()>;
}

/// A resource config (type plus source) shared by identical resources.
#[async_trait]
pub trait ResourceConfig: Send + Sync {
    /// Config ID.
    fn id(&self) -> i64;
    /// Finds or creates the scope versions are saved under. `None` selects
    /// the global scope.
    async fn find_or_create_scope(
        &self,
        resource_id: Option<i64>,
    ) -> Result<Arc<dyn ResourceConfigScope>>;
}

/// The unit of version history and check bookkeeping.
#[async_trait]
pub trait ResourceConfigScope: Send + Sync {
    /// Scope ID.
    fn id(&self) -> i64;
    /// The resource this scope is dedicated to, if not global.
    fn resource_id(&self) -> Option<i64>;
    /// The most recent check.
    async fn last_check(&self) -> Result<LastCheck>;
    /// Tries to take the checking lock; `None` if another checker holds it.
    async fn acquire_resource_checking_lock(&self) -> Result<Option<Box<dyn Lock>>>;
    /// Records a check start. Returns false if the scope disappeared.
    async fn update_last_check_start_time(
        &self,
        build_id: i64,
        public_plan: Option<serde_json::Value>,
    ) -> Result<bool>;
    /// Records a check end. Returns false if the scope disappeared.
    async fn update_last_check_end_time(&self, succeeded: bool) -> Result<bool>;
}
