use async_trait::async_trait;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use stager_catalog::{
    FileClassDef, FileSystemDef, RequestType, StagerCatalogConfig, StagerSvc, SvcClassDef,
};
use stager_lib::{
    HttpNameServer, HttpVolumeManager, NameServer, StagerError, StagerResult, VolumeManager,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Runtime;

use crate::background::{
    BackgroundMgr, BackgroundTask, BackgroundTaskExecutor, BackgroundTaskKind,
    BackgroundTaskPolicy,
};

pub const DEFAULT_STAGER_DAEMON_CONFIG_PATH: &str = "/etc/stager/stager_daemon.json";

const READ_TYPES: [RequestType; 4] = [
    RequestType::Get,
    RequestType::PrepareToGet,
    RequestType::Update,
    RequestType::PrepareToUpdate,
];
const WRITE_TYPES: [RequestType; 2] = [RequestType::Put, RequestType::PrepareToPut];
const REQUEST_LEVEL_TYPES: [RequestType; 3] = [
    RequestType::Rm,
    RequestType::SetFileGcWeight,
    RequestType::PutDone,
];

#[derive(Debug, Clone)]
pub struct StagerDaemonRunOptions {
    pub config_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Ticker period of the background worker.
    pub tick_ms: u64,
    pub subrequest_dispatch_ms: u64,
    pub request_dispatch_ms: u64,
    pub tape_mount_poll_ms: u64,
    pub migration_select_ms: u64,
    pub request_cleanup_ms: u64,
    pub max_run_time_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            tick_ms: 200,
            subrequest_dispatch_ms: 1000,
            request_dispatch_ms: 1000,
            tape_mount_poll_ms: 10_000,
            migration_select_ms: 30_000,
            request_cleanup_ms: 600_000,
            max_run_time_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub svc_classes: Vec<SvcClassDef>,
    pub file_classes: Vec<FileClassDef>,
    pub disk_pools: Vec<String>,
    pub tape_pools: Vec<String>,
    pub disk_servers: Vec<String>,
    pub file_systems: Vec<FileSystemDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StagerDaemonConfig {
    #[serde(alias = "catalog_config")]
    pub catalog: StagerCatalogConfig,
    #[serde(alias = "ns_url")]
    pub name_server_url: String,
    #[serde(alias = "vmgr_url")]
    pub volume_manager_url: String,
    /// Service class used for files registered without one.
    pub default_svc_class: String,
    pub poll: PollConfig,
    pub topology: TopologyConfig,
}

impl Default for StagerDaemonConfig {
    fn default() -> Self {
        Self {
            catalog: StagerCatalogConfig::default(),
            name_server_url: "http://127.0.0.1:5010".to_string(),
            volume_manager_url: "http://127.0.0.1:5011".to_string(),
            default_svc_class: "default".to_string(),
            poll: PollConfig::default(),
            topology: TopologyConfig::default(),
        }
    }
}

fn read_json_config<T: DeserializeOwned>(path: &Path) -> StagerResult<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| StagerError::IoError(format!("read {} failed: {}", path.display(), e)))?;
    serde_json::from_str::<T>(&content)
        .map_err(|e| StagerError::InvalidParam(format!("parse {} failed: {}", path.display(), e)))
}

pub(crate) fn load_daemon_config(path: &Path) -> StagerResult<StagerDaemonConfig> {
    if !path.exists() {
        info!("config file not found, using defaults: path={}", path.display());
        return Ok(StagerDaemonConfig::default());
    }
    read_json_config(path)
}

pub(crate) async fn register_topology(svc: &StagerSvc, topology: &TopologyConfig) -> StagerResult<()> {
    let resources = svc.resources();
    for name in topology.disk_pools.iter() {
        resources.register_disk_pool(name).await?;
    }
    for name in topology.tape_pools.iter() {
        resources.register_tape_pool(name).await?;
    }
    for name in topology.disk_servers.iter() {
        resources.register_disk_server(name).await?;
    }
    for def in topology.file_classes.iter() {
        resources.register_file_class(def).await?;
    }
    for def in topology.svc_classes.iter() {
        resources.register_svc_class(def).await?;
    }
    for def in topology.file_systems.iter() {
        resources.register_file_system(def).await?;
    }
    info!(
        "topology registered: svc_classes={}, file_classes={}, file_systems={}",
        topology.svc_classes.len(),
        topology.file_classes.len(),
        topology.file_systems.len()
    );
    Ok(())
}

pub(crate) fn build_background_mgr(config: &StagerDaemonConfig) -> BackgroundMgr {
    let poll = &config.poll;
    let budget = Duration::from_millis(poll.max_run_time_ms);
    let mut mgr = BackgroundMgr::new();
    for (kind, interval_ms) in [
        (BackgroundTaskKind::SubRequestDispatch, poll.subrequest_dispatch_ms),
        (BackgroundTaskKind::RequestDispatch, poll.request_dispatch_ms),
        (BackgroundTaskKind::TapeMountPoll, poll.tape_mount_poll_ms),
        (BackgroundTaskKind::MigrationSelect, poll.migration_select_ms),
        (BackgroundTaskKind::RequestCleanup, poll.request_cleanup_ms),
    ] {
        mgr.set_policy(
            kind,
            BackgroundTaskPolicy::new(Duration::from_millis(interval_ms), budget),
        );
    }
    mgr.push_back(BackgroundTaskKind::SubRequestDispatch, "");
    mgr.push_back(BackgroundTaskKind::RequestDispatch, "");
    mgr.push_back(BackgroundTaskKind::TapeMountPoll, "");
    mgr.push_back(BackgroundTaskKind::RequestCleanup, "");
    for class in config.topology.svc_classes.iter() {
        if !class.tape_pools.is_empty() {
            mgr.push_back(BackgroundTaskKind::MigrationSelect, class.name.clone());
        }
    }
    mgr
}

/// Drives the catalog engine from the background loops.
pub struct StagerTaskExecutor {
    svc: Arc<StagerSvc>,
    default_svc_class: String,
}

impl StagerTaskExecutor {
    pub fn new(svc: Arc<StagerSvc>, default_svc_class: impl Into<String>) -> Self {
        Self {
            svc,
            default_svc_class: default_svc_class.into(),
        }
    }

    /// Claims one SubRequest and places it. Returns false when there was nothing to claim
    /// or the claimed one had to be requeued.
    async fn dispatch_subrequest(&self) -> StagerResult<bool> {
        let types: Vec<RequestType> = READ_TYPES.iter().chain(WRITE_TYPES.iter()).copied().collect();
        let Some(sr) = self.svc.dispatcher().claim_subrequest(&types).await? else {
            return Ok(false);
        };
        let dispatcher = self.svc.dispatcher();
        let Some(cf_id) = sr.castor_file else {
            dispatcher
                .fail_subrequest(sr.id, libc::ENOENT, "no castor file attached")
                .await?;
            return Ok(true);
        };
        let Some(cf) = self.svc.resources().castor_file_by_id(cf_id).await? else {
            dispatcher
                .fail_subrequest(sr.id, libc::ENOENT, "castor file vanished")
                .await?;
            return Ok(true);
        };
        let class = match cf.svc_class {
            Some(id) => Some(id),
            None => self
                .svc
                .resources()
                .select_svc_class(&self.default_svc_class)
                .await?
                .map(|c| c.id),
        };
        let Some(class) = class else {
            dispatcher
                .fail_subrequest(sr.id, libc::EINVAL, "no service class for file")
                .await?;
            return Ok(true);
        };

        let is_write = sr.request_type.is_write();
        let min_free = if is_write { sr.xsize } else { cf.size };
        let Some(fs) = self
            .svc
            .resources()
            .best_file_system_for_job(class, min_free)
            .await?
        else {
            let max_retries = self.svc.config().max_subrequest_retries;
            let status = dispatcher.requeue_subrequest(sr.id, max_retries).await?;
            debug!(
                "dispatch: no file system, requeued: subreq_id={}, status={:?}",
                sr.id, status
            );
            return Ok(false);
        };

        let placed = if is_write {
            self.svc.disk_copies().put_start(&sr, &fs).await.map(|_| ())
        } else {
            self.svc
                .disk_copies()
                .get_update_start(&sr, &fs)
                .await
                .map(|_| ())
        };
        match placed {
            Ok(()) => {
                self.svc
                    .resources()
                    .update_file_system_for_job(&fs.mount_point, &fs.disk_server_name, min_free)
                    .await?;
            }
            Err(e) => {
                // The engine already recorded the failure on the SubRequest.
                warn!(
                    "dispatch: placement failed, subreq_id={}, fs_id={}, err_code={}, err={}",
                    sr.id,
                    fs.id,
                    e.errno(),
                    e
                );
                if !e.is_resource_unavailable() && !e.is_external() {
                    return Err(e);
                }
            }
        }
        Ok(true)
    }

    async fn dispatch_request(&self) -> StagerResult<bool> {
        let Some(request) = self
            .svc
            .dispatcher()
            .claim_request(&REQUEST_LEVEL_TYPES)
            .await?
        else {
            return Ok(false);
        };
        self.svc.dispatcher().process_request(&request).await?;
        Ok(true)
    }

    async fn poll_tape_mounts(&self) -> StagerResult<bool> {
        let tapes = self.svc.migration().tapes_to_do().await?;
        for tape in tapes.iter() {
            info!(
                "tape mount needed: tape_id={}, vid={}, side={}, tpmode={}",
                tape.id, tape.vid, tape.side, tape.tpmode
            );
        }
        let streams = self.svc.migration().streams_to_do().await?;
        for stream in streams.iter() {
            info!(
                "stream needs a drive: stream_id={}, tape_pool={}, initial_size={}",
                stream.id, stream.tape_pool_name, stream.initial_size_to_transfer
            );
        }
        Ok(false)
    }

    async fn select_for_migration(&self, svc_class: &str) -> StagerResult<bool> {
        let Some(class) = self.svc.resources().select_svc_class(svc_class).await? else {
            warn!("migration select: unknown svc class, svc_class={}", svc_class);
            return Ok(false);
        };
        let copies = self
            .svc
            .migration()
            .select_tape_copies_for_migration(&class)
            .await?;
        if !copies.is_empty() {
            info!(
                "migration select: svc_class={}, tape_copies={}",
                svc_class,
                copies.len()
            );
        }
        Ok(false)
    }

    async fn clean_requests(&self) -> StagerResult<bool> {
        let max_age = self.svc.config().terminated_request_max_age_secs;
        self.svc.gc().remove_terminated_requests(max_age).await?;
        Ok(false)
    }
}

#[async_trait]
impl BackgroundTaskExecutor for StagerTaskExecutor {
    async fn execute(&self, task: &BackgroundTask) -> StagerResult<bool> {
        match task.kind {
            BackgroundTaskKind::SubRequestDispatch => self.dispatch_subrequest().await,
            BackgroundTaskKind::RequestDispatch => self.dispatch_request().await,
            BackgroundTaskKind::TapeMountPoll => self.poll_tape_mounts().await,
            BackgroundTaskKind::MigrationSelect => self.select_for_migration(&task.target).await,
            BackgroundTaskKind::RequestCleanup => self.clean_requests().await,
        }
    }
}

/// Opens the catalog and registers the configured topology.
pub(crate) async fn init_stager_svc(
    config: &StagerDaemonConfig,
    name_server: Arc<dyn NameServer>,
    volume_manager: Arc<dyn VolumeManager>,
) -> StagerResult<Arc<StagerSvc>> {
    let svc = StagerSvc::open(config.catalog.clone(), name_server, volume_manager)?;
    register_topology(&svc, &config.topology).await?;
    Ok(Arc::new(svc))
}

pub fn run_stager_daemon(options: StagerDaemonRunOptions) -> StagerResult<()> {
    let config = load_daemon_config(&options.config_path)?;
    let runtime = Runtime::new().map_err(|e| StagerError::Internal(e.to_string()))?;
    let call_timeout = Duration::from_millis(config.catalog.external_call_timeout_ms);
    let name_server: Arc<dyn NameServer> =
        Arc::new(HttpNameServer::new(config.name_server_url.clone(), call_timeout)?);
    let volume_manager: Arc<dyn VolumeManager> =
        Arc::new(HttpVolumeManager::new(config.volume_manager_url.clone(), call_timeout)?);

    runtime.block_on(async move {
        let svc = init_stager_svc(&config, name_server, volume_manager).await?;
        let mgr = Arc::new(Mutex::new(build_background_mgr(&config)));
        let executor = Arc::new(StagerTaskExecutor::new(
            svc.clone(),
            config.default_svc_class.clone(),
        ));
        let worker = BackgroundMgr::spawn_worker(
            mgr,
            executor,
            Duration::from_millis(config.poll.tick_ms.max(1)),
        );
        info!(
            "stager daemon started: db={}, name_server={}, volume_manager={}",
            config.catalog.db_path.display(),
            config.name_server_url,
            config.volume_manager_url
        );

        let stopped = tokio::signal::ctrl_c().await;
        worker.abort();
        match stopped {
            Ok(()) => {
                info!("stager daemon stopping on interrupt");
                Ok(())
            }
            Err(e) => Err(StagerError::IoError(format!(
                "failed to listen for interrupt: {}",
                e
            ))),
        }
    })
}
