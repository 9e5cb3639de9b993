use crate::catalog_db::CatalogPool;
use crate::{
    DiskCopyMgr, GarbageCollector, MigrationOrchestrator, PlacementPolicy, RecallOrchestrator,
    RequestDispatcher, ResourceCatalog, WeightedFreeSpacePolicy,
};
use serde::Deserialize;
use stager_lib::{NameServer, StagerError, StagerResult, VolumeManager};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StagerCatalogConfig {
    #[serde(alias = "catalog_db_path")]
    pub db_path: PathBuf,
    pub max_idle_connections: usize,
    pub busy_timeout_ms: u64,
    pub external_call_timeout_ms: u64,
    pub max_subrequest_retries: u32,
    pub max_migration_retries: u32,
    /// Ended requests older than this are purged by the cleanup loop.
    pub terminated_request_max_age_secs: u64,
    pub fs_reserved_bytes: u64,
}

impl Default for StagerCatalogConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/stager/catalog.db"),
            max_idle_connections: 8,
            busy_timeout_ms: 5000,
            external_call_timeout_ms: 30_000,
            max_subrequest_retries: 10,
            max_migration_retries: 3,
            terminated_request_max_age_secs: 86_400,
            fs_reserved_bytes: 0,
        }
    }
}

/// Namespace and tape volume catalog clients, with the call timeout applied to both.
pub struct ExternalServices {
    pub name_server: Arc<dyn NameServer>,
    pub volume_manager: Arc<dyn VolumeManager>,
    call_timeout: Duration,
}

impl ExternalServices {
    pub fn new(
        name_server: Arc<dyn NameServer>,
        volume_manager: Arc<dyn VolumeManager>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            name_server,
            volume_manager,
            call_timeout,
        }
    }

    pub async fn call<T, F>(&self, what: &str, fut: F) -> StagerResult<T>
    where
        F: Future<Output = StagerResult<T>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!("external call timed out: call={}, timeout={:?}", what, self.call_timeout);
                Err(StagerError::Timeout(format!(
                    "{} did not answer within {:?}",
                    what, self.call_timeout
                )))
            }
        }
    }
}

/// The catalog engine: one pool shared by every component.
pub struct StagerSvc {
    pool: Arc<CatalogPool>,
    resources: Arc<ResourceCatalog>,
    dispatcher: Arc<RequestDispatcher>,
    disk_copies: Arc<DiskCopyMgr>,
    recall: Arc<RecallOrchestrator>,
    migration: Arc<MigrationOrchestrator>,
    gc: Arc<GarbageCollector>,
    config: StagerCatalogConfig,
}

impl StagerSvc {
    pub fn open(
        config: StagerCatalogConfig,
        name_server: Arc<dyn NameServer>,
        volume_manager: Arc<dyn VolumeManager>,
    ) -> StagerResult<Self> {
        let placement: Arc<dyn PlacementPolicy> = Arc::new(WeightedFreeSpacePolicy {
            reserved_bytes: config.fs_reserved_bytes,
        });
        Self::open_with_policy(config, name_server, volume_manager, placement)
    }

    pub fn open_with_policy(
        config: StagerCatalogConfig,
        name_server: Arc<dyn NameServer>,
        volume_manager: Arc<dyn VolumeManager>,
        placement: Arc<dyn PlacementPolicy>,
    ) -> StagerResult<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let pool = CatalogPool::open(
            &config.db_path,
            Duration::from_millis(config.busy_timeout_ms),
            config.max_idle_connections,
        )?;
        let ext = Arc::new(ExternalServices::new(
            name_server,
            volume_manager,
            Duration::from_millis(config.external_call_timeout_ms),
        ));

        let resources = Arc::new(ResourceCatalog::new(pool.clone(), placement.clone()));
        let recall = Arc::new(RecallOrchestrator::new(
            pool.clone(),
            ext.clone(),
            placement.clone(),
        ));
        let disk_copies = Arc::new(DiskCopyMgr::new(pool.clone(), ext.clone(), recall.clone()));
        let dispatcher = Arc::new(RequestDispatcher::new(pool.clone(), disk_copies.clone()));
        let migration = Arc::new(MigrationOrchestrator::new(
            pool.clone(),
            placement,
            config.max_migration_retries,
        ));
        let gc = Arc::new(GarbageCollector::new(pool.clone(), ext));

        Ok(Self {
            pool,
            resources,
            dispatcher,
            disk_copies,
            recall,
            migration,
            gc,
            config,
        })
    }

    pub fn pool(&self) -> &Arc<CatalogPool> {
        &self.pool
    }

    pub fn config(&self) -> &StagerCatalogConfig {
        &self.config
    }

    pub fn resources(&self) -> &Arc<ResourceCatalog> {
        &self.resources
    }

    pub fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.dispatcher
    }

    pub fn disk_copies(&self) -> &Arc<DiskCopyMgr> {
        &self.disk_copies
    }

    pub fn recall(&self) -> &Arc<RecallOrchestrator> {
        &self.recall
    }

    pub fn migration(&self) -> &Arc<MigrationOrchestrator> {
        &self.migration
    }

    pub fn gc(&self) -> &Arc<GarbageCollector> {
        &self.gc
    }
}
