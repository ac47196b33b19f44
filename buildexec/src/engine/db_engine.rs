//! Routing builds to the engine that matches their recorded schema.

use super::{Engine, Runnable, TRACKING_LOCK_LEASE};
use crate::core::BuildStatus;
use crate::db::Build;
use crate::errors::{Result, UnknownEngineError};
use crate::plan::Plan;
use async_trait::async_trait;
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Dispatches to one of several schema engines.
///
/// New builds go to the first engine. Existing builds go to the engine
/// whose schema they were started with.
#[derive(Clone)]
pub struct DbEngine {
    engines: Arc<Vec<Arc<dyn Engine>>>,
}

impl DbEngine {
    /// Creates a dispatcher over `engines`, the first of which starts new
    /// builds.
    #[must_use]
    pub fn new(engines: Vec<Arc<dyn Engine>>) -> Self {
        Self {
            engines: Arc::new(engines),
        }
    }

    /// Wraps an existing build.
    #[must_use]
    pub fn lookup_build(&self, build: Arc<dyn Build>) -> DbBuild {
        DbBuild {
            build,
            engines: Arc::clone(&self.engines),
        }
    }

    /// Schemas of the dispatched engines, in order.
    pub fn schemas(&self) -> Vec<String> {
        self.engines.iter().map(|engine| engine.schema()).collect()
    }
}

impl fmt::Debug for DbEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbEngine")
            .field("schemas", &self.schemas())
            .finish()
    }
}

#[async_trait]
impl Engine for DbEngine {
    fn schema(&self) -> String {
        String::new()
    }

    async fn create_build(&self, build: Arc<dyn Build>, plan: &Plan) -> Result<Box<dyn Runnable>> {
        let Some(engine) = self.engines.first() else {
            return Err(UnknownEngineError::new(String::new()).into());
        };

        engine.create_build(Arc::clone(&build), plan).await?;
        Ok(Box::new(self.lookup_build(build)))
    }

    fn lookup_build(&self, build: Arc<dyn Build>) -> Result<Box<dyn Runnable>> {
        Ok(Box::new(DbEngine::lookup_build(self, build)))
    }

    async fn release_all(&self) {
        info!(engines = self.engines.len(), "releasing-engines");
        join_all(self.engines.iter().map(|engine| engine.release_all())).await;
    }
}

/// A build whose engine is picked from its recorded schema each time it is
/// resumed or aborted.
pub struct DbBuild {
    build: Arc<dyn Build>,
    engines: Arc<Vec<Arc<dyn Engine>>>,
}

impl DbBuild {
    fn engine_for(&self, schema: &str) -> Result<&Arc<dyn Engine>> {
        self.engines
            .iter()
            .find(|engine| engine.schema() == schema)
            .ok_or_else(|| UnknownEngineError::new(schema).into())
    }

    async fn abort_tracked(&self) -> Result<()> {
        let build_id = self.build.id();

        self.build.mark_as_aborted().await?;

        if !self.build.reload().await? {
            debug!(build_id, "build-disappeared");
            return Ok(());
        }

        let schema = self.build.schema();
        if schema.is_empty() {
            // Never started, so no engine is running it.
            info!(build_id, "finishing-unstarted-build");
            return self.build.finish(BuildStatus::Aborted).await;
        }

        let engine = self.engine_for(&schema)?;
        let runnable = engine.lookup_build(Arc::clone(&self.build))?;
        runnable.abort().await
    }
}

impl fmt::Debug for DbBuild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbBuild")
            .field("build_id", &self.build.id())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Runnable for DbBuild {
    fn build_id(&self) -> i64 {
        self.build.id()
    }

    async fn resume(&self) {
        let build_id = self.build.id();

        match self.build.reload().await {
            Ok(true) => {}
            Ok(false) => {
                debug!(build_id, "build-not-found");
                return;
            }
            Err(err) => {
                error!(build_id, error = %err, "failed-to-load-build-from-db");
                return;
            }
        }

        let schema = self.build.schema();
        if schema.is_empty() || !self.build.is_running() {
            debug!(build_id, status = %self.build.status(), "build-not-resumable");
            return;
        }

        let runnable = match self
            .engine_for(&schema)
            .and_then(|engine| engine.lookup_build(Arc::clone(&self.build)))
        {
            Ok(runnable) => runnable,
            Err(err) => {
                error!(build_id, schema = %schema, error = %err, "failed-to-look-up-build");
                if let Err(finish_err) = self.build.finish_with_error(&err).await {
                    error!(build_id, error = %finish_err, "failed-to-finish-build");
                }
                return;
            }
        };

        runnable.resume().await;
    }

    async fn abort(&self) -> Result<()> {
        let build_id = self.build.id();

        let Some(lock) = self.build.acquire_tracking_lock(TRACKING_LOCK_LEASE).await? else {
            // Whoever holds the lock is watching for the abort.
            info!(build_id, "build-tracked-elsewhere");
            return self.build.mark_as_aborted().await;
        };

        let aborted = self.abort_tracked().await;

        if let Err(err) = lock.release().await {
            warn!(build_id, error = %err, "failed-to-release-tracking-lock");
        }

        aborted
    }
}
