use crate::catalog_db::{map_db_err, unix_timestamp, CatalogPool};
use crate::{
    CastorFile, CatalogId, DiskCopyStatus, FileClass, FileClassDef, FileSystem, FileSystemDef,
    RequestType, ResourceCatalog, StagerCatalogConfig, StagerSvc, SubRequest, SubRequestStatus,
    SvcClass, SvcClassDef, TapeCopyStatus,
};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use stager_lib::{
    NameServer, NsFileId, NsSegment, NsSegmentStatus, StagerError, StagerResult, TapeInfo,
    VolumeManager,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const TEST_NS_HOST: &str = "nsA";
pub const TEST_DISK_POOL: &str = "pool_default";

#[derive(Default)]
pub struct MockNameServer {
    segments: Mutex<HashMap<NsFileId, Vec<NsSegment>>>,
    sizes: Mutex<HashMap<NsFileId, u64>>,
    files: Mutex<HashSet<NsFileId>>,
    failing_deletes: Mutex<HashSet<NsFileId>>,
    fail_get_segments: Mutex<bool>,
    fail_set_size: Mutex<bool>,
    delay: Mutex<Option<Duration>>,
}

impl MockNameServer {
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn set_segments(&self, cf: &CastorFile, segments: Vec<NsSegment>) {
        self.segments
            .lock()
            .unwrap()
            .insert(cf.ns_file_id(), segments);
    }

    pub fn fail_get_segments(&self, fail: bool) {
        *self.fail_get_segments.lock().unwrap() = fail;
    }

    pub fn fail_set_size(&self, fail: bool) {
        *self.fail_set_size.lock().unwrap() = fail;
    }

    pub fn fail_delete_of(&self, file: &NsFileId) {
        self.failing_deletes.lock().unwrap().insert(file.clone());
    }

    pub fn add_file(&self, file: &NsFileId) {
        self.files.lock().unwrap().insert(file.clone());
    }

    pub fn exists(&self, file: &NsFileId) -> bool {
        self.files.lock().unwrap().contains(file)
    }

    pub fn size_of(&self, file: &NsFileId) -> Option<u64> {
        self.sizes.lock().unwrap().get(file).copied()
    }

    async fn maybe_delay(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl NameServer for MockNameServer {
    async fn get_segments(&self, file: &NsFileId) -> StagerResult<Vec<NsSegment>> {
        self.maybe_delay().await;
        if *self.fail_get_segments.lock().unwrap() {
            return Err(StagerError::name_server(libc::EIO, "get_segments refused"));
        }
        Ok(self
            .segments
            .lock()
            .unwrap()
            .get(file)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_file_size(&self, file: &NsFileId, size: u64) -> StagerResult<()> {
        self.maybe_delay().await;
        if *self.fail_set_size.lock().unwrap() {
            return Err(StagerError::name_server(libc::EIO, "set_file_size refused"));
        }
        self.sizes.lock().unwrap().insert(file.clone(), size);
        Ok(())
    }

    async fn delete_file(&self, file: &NsFileId) -> StagerResult<()> {
        self.maybe_delay().await;
        if self.failing_deletes.lock().unwrap().contains(file) {
            return Err(StagerError::name_server(libc::EIO, format!("cannot delete {}", file)));
        }
        if !self.files.lock().unwrap().remove(file) {
            return Err(StagerError::name_server(libc::ENOENT, format!("{} not found", file)));
        }
        Ok(())
    }

    async fn resolve_path(&self, file: &NsFileId) -> StagerResult<String> {
        Ok(format!("/castor/{}/{}", file.ns_host, file.file_id))
    }
}

/// Unknown tapes are healthy.
#[derive(Default)]
pub struct MockVolumeManager {
    status: Mutex<HashMap<String, u32>>,
    errors: Mutex<HashSet<String>>,
}

impl MockVolumeManager {
    pub fn set_status(&self, vid: &str, status: u32) {
        self.status.lock().unwrap().insert(vid.to_string(), status);
    }

    pub fn set_error(&self, vid: &str) {
        self.errors.lock().unwrap().insert(vid.to_string());
    }
}

#[async_trait]
impl VolumeManager for MockVolumeManager {
    async fn query_tape(&self, vid: &str, _side: i32) -> StagerResult<TapeInfo> {
        if self.errors.lock().unwrap().contains(vid) {
            return Err(StagerError::volume_manager(libc::EIO, format!("{} unreachable", vid)));
        }
        let status = self.status.lock().unwrap().get(vid).copied().unwrap_or(0);
        Ok(TapeInfo {
            status,
            label: "aul".to_string(),
            density: "200GC".to_string(),
            dgn: "T10K".to_string(),
        })
    }
}

pub async fn create_test_catalog_with_mocks() -> (
    StagerSvc,
    TempDir,
    Arc<MockNameServer>,
    Arc<MockVolumeManager>,
) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let config = StagerCatalogConfig {
        db_path: dir.path().join("catalog.db"),
        external_call_timeout_ms: 500,
        ..Default::default()
    };
    let ns = Arc::new(MockNameServer::default());
    let vmgr = Arc::new(MockVolumeManager::default());
    let svc = StagerSvc::open(config, ns.clone(), vmgr.clone()).unwrap();
    (svc, dir, ns, vmgr)
}

pub async fn create_test_catalog() -> (StagerSvc, TempDir) {
    let (svc, dir, _ns, _vmgr) = create_test_catalog_with_mocks().await;
    (svc, dir)
}

pub async fn count_rows(pool: &Arc<CatalogPool>, table: &str) -> i64 {
    let sql = format!("SELECT COUNT(*) FROM {}", table);
    pool.transact(move |conn| conn.query_row(&sql, [], |row| row.get(0)).map_err(map_db_err))
        .await
        .unwrap()
}

pub fn ns_segment(vid: &str, copy_nb: u32, fseq: u32, seg_size: u64) -> NsSegment {
    NsSegment {
        vid: vid.to_string(),
        side: 0,
        copy_nb,
        fseq,
        block_id: [0, 0, 0, fseq as u8],
        seg_size,
        status: NsSegmentStatus::Ok,
    }
}

pub async fn seed_castor_file(
    pool: &Arc<CatalogPool>,
    file_id: u64,
    size: u64,
    svc_class: Option<CatalogId>,
) -> CastorFile {
    pool.transact(move |conn| {
        conn.execute(
            "INSERT INTO castor_file (file_id, ns_host, file_size, svc_class) VALUES (?1, ?2, ?3, ?4)",
            params![file_id, TEST_NS_HOST, size, svc_class],
        )
        .map_err(map_db_err)?;
        Ok(CastorFile {
            id: conn.last_insert_rowid() as CatalogId,
            file_id,
            ns_host: TEST_NS_HOST.to_string(),
            size,
            svc_class,
            file_class: None,
        })
    })
    .await
    .unwrap()
}

pub async fn seed_svc_class(resources: &ResourceCatalog, name: &str) -> SvcClass {
    resources
        .register_svc_class(&SvcClassDef {
            name: name.to_string(),
            disk_pools: vec![TEST_DISK_POOL.to_string()],
            ..Default::default()
        })
        .await
        .unwrap()
}

/// A class with one tape pool named `<name>_tp`.
pub async fn seed_migrating_class(resources: &ResourceCatalog, name: &str, nb_drives: u32) -> SvcClass {
    resources
        .register_svc_class(&SvcClassDef {
            name: name.to_string(),
            nb_drives,
            disk_pools: vec![TEST_DISK_POOL.to_string()],
            tape_pools: vec![format!("{}_tp", name)],
            ..Default::default()
        })
        .await
        .unwrap()
}

pub async fn seed_file_class(resources: &ResourceCatalog, name: &str, nb_copies: u32) -> FileClass {
    resources
        .register_file_class(&FileClassDef {
            name: name.to_string(),
            nb_copies,
            ..Default::default()
        })
        .await
        .unwrap()
}

pub async fn seed_file_system(
    resources: &ResourceCatalog,
    disk_server: &str,
    mount_point: &str,
    free: u64,
    weight: f64,
) -> FileSystem {
    resources
        .register_file_system(&FileSystemDef {
            disk_server: disk_server.to_string(),
            mount_point: mount_point.to_string(),
            disk_pool: Some(TEST_DISK_POOL.to_string()),
            free,
            weight,
            fs_deviation: 0.0,
        })
        .await
        .unwrap()
}

pub async fn insert_disk_copy_row(
    pool: &Arc<CatalogPool>,
    castor_file: CatalogId,
    file_system: Option<CatalogId>,
    status: DiskCopyStatus,
) -> CatalogId {
    pool.transact(move |conn| {
        let cf = crate::resource_catalog::load_castor_file(conn, castor_file)?
            .ok_or_else(|| StagerError::Internal(format!("no castor file {}", castor_file)))?;
        crate::disk_copy_mgr::insert_disk_copy(conn, &cf, file_system, status).map(|dc| dc.id)
    })
    .await
    .unwrap()
}

pub async fn insert_tape_copy_row(
    pool: &Arc<CatalogPool>,
    castor_file: CatalogId,
    copy_nb: u32,
    status: TapeCopyStatus,
) -> CatalogId {
    pool.transact(move |conn| {
        conn.execute(
            "INSERT INTO tape_copy (copy_nb, status, castor_file) VALUES (?1, ?2, ?3)",
            params![copy_nb, status, castor_file],
        )
        .map_err(map_db_err)?;
        Ok(conn.last_insert_rowid() as CatalogId)
    })
    .await
    .unwrap()
}

pub async fn disk_copy_status(pool: &Arc<CatalogPool>, id: CatalogId) -> Option<DiskCopyStatus> {
    pool.transact(move |conn| {
        conn.query_row(
            "SELECT status FROM disk_copy WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_db_err)
    })
    .await
    .unwrap()
}

pub async fn tape_copy_status(pool: &Arc<CatalogPool>, id: CatalogId) -> Option<TapeCopyStatus> {
    pool.transact(move |conn| {
        conn.query_row(
            "SELECT status FROM tape_copy WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_db_err)
    })
    .await
    .unwrap()
}

/// Inserts a Request; request-level types also enter the request backlog.
pub async fn insert_request(pool: &Arc<CatalogPool>, req_type: RequestType) -> CatalogId {
    pool.transact(move |conn| {
        conn.execute(
            "INSERT INTO request (req_type, svc_class_name, euid, egid, client_host, client_port,
                creation_time)
             VALUES (?1, 'default', 1000, 1000, 'client01', 5015, ?2)",
            params![req_type, unix_timestamp()],
        )
        .map_err(map_db_err)?;
        let id = conn.last_insert_rowid() as CatalogId;
        if req_type.is_request_level() {
            conn.execute(
                "INSERT INTO new_request (id, req_type) VALUES (?1, ?2)",
                params![id, req_type],
            )
            .map_err(map_db_err)?;
        }
        Ok(id)
    })
    .await
    .unwrap()
}

async fn insert_subrequest_row(
    pool: &Arc<CatalogPool>,
    id: Option<CatalogId>,
    request: CatalogId,
    castor_file: Option<CatalogId>,
    disk_copy: Option<CatalogId>,
    file_name: &str,
    status: SubRequestStatus,
) -> CatalogId {
    let file_name = file_name.to_string();
    pool.transact(move |conn| {
        conn.execute(
            "INSERT INTO sub_request (id, request, castor_file, disk_copy, file_name, protocol,
                status, last_modification_time)
             VALUES (?1, ?2, ?3, ?4, ?5, 'rfio', ?6, ?7)",
            params![id, request, castor_file, disk_copy, file_name, status, unix_timestamp()],
        )
        .map_err(map_db_err)?;
        Ok(conn.last_insert_rowid() as CatalogId)
    })
    .await
    .unwrap()
}

pub async fn insert_subrequest(
    pool: &Arc<CatalogPool>,
    request: CatalogId,
    castor_file: Option<CatalogId>,
    file_name: &str,
    status: SubRequestStatus,
) -> CatalogId {
    insert_subrequest_row(pool, None, request, castor_file, None, file_name, status).await
}

pub async fn insert_subrequest_with_id(
    pool: &Arc<CatalogPool>,
    id: CatalogId,
    request: CatalogId,
    castor_file: Option<CatalogId>,
    file_name: &str,
    status: SubRequestStatus,
) -> CatalogId {
    insert_subrequest_row(pool, Some(id), request, castor_file, None, file_name, status).await
}

/// A SubRequest already attached to a disk copy.
pub async fn insert_subrequest_on(
    pool: &Arc<CatalogPool>,
    request: CatalogId,
    castor_file: CatalogId,
    disk_copy: CatalogId,
    status: SubRequestStatus,
) -> CatalogId {
    insert_subrequest_row(
        pool,
        None,
        request,
        Some(castor_file),
        Some(disk_copy),
        "/data/waiter",
        status,
    )
    .await
}

pub async fn subrequest_status(pool: &Arc<CatalogPool>, id: CatalogId) -> Option<SubRequestStatus> {
    pool.transact(move |conn| {
        conn.query_row(
            "SELECT status FROM sub_request WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_db_err)
    })
    .await
    .unwrap()
}

pub async fn load_sr(pool: &Arc<CatalogPool>, id: CatalogId) -> SubRequest {
    pool.transact(move |conn| crate::request_dispatcher::load_subrequest(conn, id))
        .await
        .unwrap()
        .unwrap()
}
