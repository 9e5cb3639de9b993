use crate::catalog_db::{map_db_err, CatalogPool};
use crate::placement_policy::{is_schedulable, pick_best, PlacementCandidate, PlacementPolicy};
use crate::{
    CastorFile, CatalogId, DiskPool, DiskServer, DiskServerStatus, FileClass, FileSystem, Stream,
    SvcClass, Tape, TapeMode, TapePool, TapeStatus,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use stager_lib::{StagerError, StagerResult};
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SvcClassDef {
    pub name: String,
    pub nb_drives: u32,
    pub default_file_size: u64,
    pub max_replica_nb: u32,
    pub replication_policy: String,
    pub gc_policy: String,
    pub migrator_policy: String,
    pub recaller_policy: String,
    pub disk_pools: Vec<String>,
    pub tape_pools: Vec<String>,
}

impl Default for SvcClassDef {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            nb_drives: 1,
            default_file_size: 0,
            max_replica_nb: 1,
            replication_policy: String::new(),
            gc_policy: String::new(),
            migrator_policy: String::new(),
            recaller_policy: String::new(),
            disk_pools: Vec::new(),
            tape_pools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileClassDef {
    pub name: String,
    pub min_file_size: u64,
    pub max_file_size: u64,
    pub nb_copies: u32,
}

impl Default for FileClassDef {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            min_file_size: 0,
            max_file_size: 0,
            nb_copies: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileSystemDef {
    #[serde(alias = "server")]
    pub disk_server: String,
    pub mount_point: String,
    pub disk_pool: Option<String>,
    pub free: u64,
    pub weight: f64,
    pub fs_deviation: f64,
}

impl Default for FileSystemDef {
    fn default() -> Self {
        Self {
            disk_server: String::new(),
            mount_point: String::new(),
            disk_pool: None,
            free: 0,
            weight: 1.0,
            fs_deviation: 0.0,
        }
    }
}

pub(crate) fn load_castor_file(conn: &Connection, id: CatalogId) -> StagerResult<Option<CastorFile>> {
    conn.query_row(
        &format!("SELECT {} FROM castor_file WHERE id = ?1", CastorFile::COLUMNS),
        params![id],
        CastorFile::from_row,
    )
    .optional()
    .map_err(map_db_err)
}

pub(crate) fn load_file_class_of(conn: &Connection, cf: &CastorFile) -> StagerResult<Option<FileClass>> {
    let Some(file_class) = cf.file_class else {
        return Ok(None);
    };
    conn.query_row(
        &format!("SELECT {} FROM file_class WHERE id = ?1", FileClass::COLUMNS),
        params![file_class],
        FileClass::from_row,
    )
    .optional()
    .map_err(map_db_err)
}

pub(crate) fn load_file_system(conn: &Connection, id: CatalogId) -> StagerResult<Option<FileSystem>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM file_system fs JOIN disk_server ds ON ds.id = fs.disk_server
             WHERE fs.id = ?1",
            FileSystem::JOINED_COLUMNS
        ),
        params![id],
        FileSystem::from_row,
    )
    .optional()
    .map_err(map_db_err)
}

pub(crate) fn load_streams_of_pool(conn: &Connection, tape_pool: CatalogId) -> StagerResult<Vec<Stream>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM stream s JOIN tape_pool tp ON tp.id = s.tape_pool
             WHERE s.tape_pool = ?1 ORDER BY s.id",
            Stream::JOINED_COLUMNS
        ))
        .map_err(map_db_err)?;
    let rows = stmt
        .query_map(params![tape_pool], Stream::from_row)
        .map_err(map_db_err)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
}

fn select_ids(conn: &Connection, sql: &str, key: CatalogId) -> StagerResult<Vec<CatalogId>> {
    let mut stmt = conn.prepare(sql).map_err(map_db_err)?;
    let rows = stmt
        .query_map(params![key], |row| row.get::<_, CatalogId>(0))
        .map_err(map_db_err)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
}

fn select_svc_class_in(conn: &Connection, name: &str) -> StagerResult<Option<SvcClass>> {
    let svc_class = conn
        .query_row(
            &format!("SELECT {} FROM svc_class WHERE name = ?1", SvcClass::COLUMNS),
            params![name],
            SvcClass::from_row,
        )
        .optional()
        .map_err(map_db_err)?;
    let Some(mut svc_class) = svc_class else {
        return Ok(None);
    };
    svc_class.disk_pools = select_ids(
        conn,
        "SELECT disk_pool FROM svc_class_disk_pool WHERE svc_class = ?1 ORDER BY disk_pool",
        svc_class.id,
    )?;
    svc_class.tape_pools = select_ids(
        conn,
        "SELECT tape_pool FROM svc_class_tape_pool WHERE svc_class = ?1 ORDER BY tape_pool",
        svc_class.id,
    )?;
    Ok(Some(svc_class))
}

fn select_named_id(conn: &Connection, table: &str, name: &str) -> StagerResult<Option<CatalogId>> {
    conn.query_row(
        &format!("SELECT id FROM {} WHERE name = ?1", table),
        params![name],
        |row| row.get(0),
    )
    .optional()
    .map_err(map_db_err)
}

fn insert_or_select_named(conn: &Connection, table: &str, name: &str) -> StagerResult<CatalogId> {
    conn.execute(
        &format!("INSERT INTO {} (name) VALUES (?1) ON CONFLICT(name) DO NOTHING", table),
        params![name],
    )
    .map_err(map_db_err)?;
    select_named_id(conn, table, name)?.ok_or_else(|| {
        StagerError::Internal(format!("{} {} vanished after insert", table, name))
    })
}

pub(crate) fn select_tape(
    conn: &Connection,
    vid: &str,
    side: i32,
    tpmode: TapeMode,
) -> StagerResult<Option<Tape>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM tape WHERE vid = ?1 AND side = ?2 AND tpmode = ?3",
            Tape::COLUMNS
        ),
        params![vid, side, tpmode],
        Tape::from_row,
    )
    .optional()
    .map_err(map_db_err)
}

/// Inserts the tape; if another worker created it first, reads theirs.
pub(crate) fn insert_tape_or_reselect(
    conn: &Connection,
    vid: &str,
    side: i32,
    tpmode: TapeMode,
) -> StagerResult<Tape> {
    let inserted = conn.execute(
        "INSERT INTO tape (vid, side, tpmode, status) VALUES (?1, ?2, ?3, ?4)",
        params![vid, side, tpmode, TapeStatus::Unused],
    );
    match inserted.map_err(map_db_err) {
        Ok(_) => {
            let id = conn.last_insert_rowid() as CatalogId;
            debug!("tape created: id={}, vid={}, side={}, tpmode={}", id, vid, side, tpmode);
            Ok(Tape {
                id,
                vid: vid.to_string(),
                side,
                tpmode,
                status: TapeStatus::Unused,
                error_code: 0,
                err_msg: None,
            })
        }
        Err(e) if e.is_conflict() => match select_tape(conn, vid, side, tpmode)? {
            Some(tape) => {
                debug!("tape insert raced, reselected: id={}, vid={}", tape.id, vid);
                Ok(tape)
            }
            None => {
                error!(
                    "tape vanished after insert conflict: vid={}, side={}, tpmode={}",
                    vid, side, tpmode
                );
                Err(StagerError::Internal(format!(
                    "tape {}/{}/{} conflicted on insert but cannot be selected",
                    vid, side, tpmode
                )))
            }
        },
        Err(e) => Err(e),
    }
}

pub(crate) fn select_or_create_tape_in(
    conn: &Connection,
    vid: &str,
    side: i32,
    tpmode: TapeMode,
) -> StagerResult<Tape> {
    if let Some(tape) = select_tape(conn, vid, side, tpmode)? {
        return Ok(tape);
    }
    insert_tape_or_reselect(conn, vid, side, tpmode)
}

pub struct ResourceCatalog {
    pool: Arc<CatalogPool>,
    placement: Arc<dyn PlacementPolicy>,
}

impl ResourceCatalog {
    pub fn new(pool: Arc<CatalogPool>, placement: Arc<dyn PlacementPolicy>) -> Self {
        Self { pool, placement }
    }

    pub async fn select_svc_class(&self, name: &str) -> StagerResult<Option<SvcClass>> {
        let name = name.to_string();
        self.pool
            .transact(move |conn| select_svc_class_in(conn, &name))
            .await
    }

    pub async fn select_file_class(&self, name: &str) -> StagerResult<Option<FileClass>> {
        let name = name.to_string();
        self.pool
            .transact(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM file_class WHERE name = ?1", FileClass::COLUMNS),
                    params![name],
                    FileClass::from_row,
                )
                .optional()
                .map_err(map_db_err)
            })
            .await
    }

    pub async fn select_disk_pool(&self, name: &str) -> StagerResult<Option<DiskPool>> {
        let name = name.to_string();
        self.pool
            .transact(move |conn| {
                let Some(id) = select_named_id(conn, "disk_pool", &name)? else {
                    return Ok(None);
                };
                let file_systems = select_ids(
                    conn,
                    "SELECT id FROM file_system WHERE disk_pool = ?1 ORDER BY id",
                    id,
                )?;
                Ok(Some(DiskPool {
                    id,
                    name,
                    file_systems,
                }))
            })
            .await
    }

    pub async fn select_tape_pool(&self, name: &str) -> StagerResult<Option<TapePool>> {
        let name = name.to_string();
        self.pool
            .transact(move |conn| {
                let Some(id) = select_named_id(conn, "tape_pool", &name)? else {
                    return Ok(None);
                };
                let streams = load_streams_of_pool(conn, id)?;
                Ok(Some(TapePool { id, name, streams }))
            })
            .await
    }

    pub async fn select_disk_server(&self, name: &str) -> StagerResult<Option<DiskServer>> {
        let name = name.to_string();
        self.pool
            .transact(move |conn| {
                conn.query_row(
                    "SELECT id, name, status FROM disk_server WHERE name = ?1",
                    params![name],
                    |row| {
                        Ok(DiskServer {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            status: row.get(2)?,
                        })
                    },
                )
                .optional()
                .map_err(map_db_err)
            })
            .await
    }

    pub async fn select_file_system(
        &self,
        mount_point: &str,
        disk_server: &str,
    ) -> StagerResult<Option<FileSystem>> {
        let mount_point = mount_point.to_string();
        let disk_server = disk_server.to_string();
        self.pool
            .transact(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM file_system fs JOIN disk_server ds ON ds.id = fs.disk_server
                         WHERE fs.mount_point = ?1 AND ds.name = ?2",
                        FileSystem::JOINED_COLUMNS
                    ),
                    params![mount_point, disk_server],
                    FileSystem::from_row,
                )
                .optional()
                .map_err(map_db_err)
            })
            .await
    }

    pub async fn select_castor_file(
        &self,
        file_id: u64,
        ns_host: &str,
    ) -> StagerResult<Option<CastorFile>> {
        let ns_host = ns_host.to_string();
        self.pool
            .transact(move |conn| select_castor_file_in(conn, file_id, &ns_host))
            .await
    }

    pub async fn castor_file_by_id(&self, id: CatalogId) -> StagerResult<Option<CastorFile>> {
        self.pool
            .transact(move |conn| load_castor_file(conn, id))
            .await
    }

    pub async fn select_or_create_castor_file(
        &self,
        file_id: u64,
        ns_host: &str,
        svc_class: Option<CatalogId>,
        file_class: Option<CatalogId>,
        size: u64,
    ) -> StagerResult<CastorFile> {
        let ns_host = ns_host.to_string();
        self.pool
            .transact(move |conn| {
                if let Some(cf) = select_castor_file_in(conn, file_id, &ns_host)? {
                    return Ok(cf);
                }
                let inserted = conn.execute(
                    "INSERT INTO castor_file (file_id, ns_host, file_size, svc_class, file_class)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![file_id, ns_host, size, svc_class, file_class],
                );
                match inserted.map_err(map_db_err) {
                    Ok(_) => Ok(CastorFile {
                        id: conn.last_insert_rowid() as CatalogId,
                        file_id,
                        ns_host,
                        size,
                        svc_class,
                        file_class,
                    }),
                    Err(e) if e.is_conflict() => select_castor_file_in(conn, file_id, &ns_host)?
                        .ok_or_else(|| {
                            StagerError::Internal(format!(
                                "castor file {}@{} conflicted on insert but cannot be selected",
                                file_id, ns_host
                            ))
                        }),
                    Err(e) => Err(e),
                }
            })
            .await
    }

    pub async fn select_or_create_tape(
        &self,
        vid: &str,
        side: i32,
        tpmode: TapeMode,
    ) -> StagerResult<Tape> {
        let vid = vid.to_string();
        self.pool
            .transact(move |conn| select_or_create_tape_in(conn, &vid, side, tpmode))
            .await
    }

    pub async fn register_disk_pool(&self, name: &str) -> StagerResult<CatalogId> {
        let name = name.to_string();
        self.pool
            .transact(move |conn| insert_or_select_named(conn, "disk_pool", &name))
            .await
    }

    pub async fn register_tape_pool(&self, name: &str) -> StagerResult<CatalogId> {
        let name = name.to_string();
        self.pool
            .transact(move |conn| insert_or_select_named(conn, "tape_pool", &name))
            .await
    }

    pub async fn register_disk_server(&self, name: &str) -> StagerResult<CatalogId> {
        let name = name.to_string();
        self.pool
            .transact(move |conn| insert_or_select_named(conn, "disk_server", &name))
            .await
    }

    pub async fn register_file_class(&self, def: &FileClassDef) -> StagerResult<FileClass> {
        let def = def.clone();
        self.pool
            .transact(move |conn| {
                conn.execute(
                    "INSERT INTO file_class (name, min_file_size, max_file_size, nb_copies)
                     VALUES (?1, ?2, ?3, ?4) ON CONFLICT(name) DO NOTHING",
                    params![def.name, def.min_file_size, def.max_file_size, def.nb_copies],
                )
                .map_err(map_db_err)?;
                conn.query_row(
                    &format!("SELECT {} FROM file_class WHERE name = ?1", FileClass::COLUMNS),
                    params![def.name],
                    FileClass::from_row,
                )
                .map_err(map_db_err)
            })
            .await
    }

    /// Registers the class and links the named pools, creating them as needed.
    pub async fn register_svc_class(&self, def: &SvcClassDef) -> StagerResult<SvcClass> {
        let def = def.clone();
        self.pool
            .transact(move |conn| {
                conn.execute(
                    "INSERT INTO svc_class (name, nb_drives, default_file_size, max_replica_nb,
                        replication_policy, gc_policy, migrator_policy, recaller_policy)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) ON CONFLICT(name) DO NOTHING",
                    params![
                        def.name,
                        def.nb_drives,
                        def.default_file_size,
                        def.max_replica_nb,
                        def.replication_policy,
                        def.gc_policy,
                        def.migrator_policy,
                        def.recaller_policy
                    ],
                )
                .map_err(map_db_err)?;
                let id = select_named_id(conn, "svc_class", &def.name)?.ok_or_else(|| {
                    StagerError::Internal(format!("svc class {} vanished after insert", def.name))
                })?;
                for pool_name in def.disk_pools.iter() {
                    let pool_id = insert_or_select_named(conn, "disk_pool", pool_name)?;
                    conn.execute(
                        "INSERT OR IGNORE INTO svc_class_disk_pool (svc_class, disk_pool) VALUES (?1, ?2)",
                        params![id, pool_id],
                    )
                    .map_err(map_db_err)?;
                }
                for pool_name in def.tape_pools.iter() {
                    let pool_id = insert_or_select_named(conn, "tape_pool", pool_name)?;
                    conn.execute(
                        "INSERT OR IGNORE INTO svc_class_tape_pool (svc_class, tape_pool) VALUES (?1, ?2)",
                        params![id, pool_id],
                    )
                    .map_err(map_db_err)?;
                }
                select_svc_class_in(conn, &def.name)?.ok_or_else(|| {
                    StagerError::Internal(format!("svc class {} vanished after insert", def.name))
                })
            })
            .await
    }

    pub async fn register_file_system(&self, def: &FileSystemDef) -> StagerResult<FileSystem> {
        let def = def.clone();
        self.pool
            .transact(move |conn| {
                let server = insert_or_select_named(conn, "disk_server", &def.disk_server)?;
                let disk_pool = match def.disk_pool.as_deref() {
                    Some(name) => Some(insert_or_select_named(conn, "disk_pool", name)?),
                    None => None,
                };
                conn.execute(
                    "INSERT INTO file_system (disk_server, disk_pool, mount_point, free_space,
                        weight, fs_deviation, status)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)
                     ON CONFLICT(disk_server, mount_point) DO NOTHING",
                    params![server, disk_pool, def.mount_point, def.free, def.weight, def.fs_deviation],
                )
                .map_err(map_db_err)?;
                conn.query_row(
                    &format!(
                        "SELECT {} FROM file_system fs JOIN disk_server ds ON ds.id = fs.disk_server
                         WHERE fs.disk_server = ?1 AND fs.mount_point = ?2",
                        FileSystem::JOINED_COLUMNS
                    ),
                    params![server, def.mount_point],
                    FileSystem::from_row,
                )
                .map_err(map_db_err)
            })
            .await
    }

    /// Picks a production filesystem of the class's disk pools able to take `min_free` bytes.
    pub async fn best_file_system_for_job(
        &self,
        svc_class: CatalogId,
        min_free: u64,
    ) -> StagerResult<Option<FileSystem>> {
        let placement = self.placement.clone();
        self.pool
            .transact(move |conn| {
                let candidates = schedulable_file_systems(conn, Some(svc_class))?;
                Ok(pick_best(candidates.into_iter().map(|fs| {
                    let score = placement
                        .score_target(&PlacementCandidate::from_file_system(&fs, min_free));
                    (fs, score)
                })))
            })
            .await
    }

    /// Charges a job of `file_size` bytes to the file system picked for it, so the next
    /// placement sees less free space and a higher deviation there.
    pub async fn update_file_system_for_job(
        &self,
        mount_point: &str,
        disk_server: &str,
        file_size: u64,
    ) -> StagerResult<()> {
        let mount = mount_point.to_string();
        let server = disk_server.to_string();
        let n = self
            .pool
            .transact(move |conn| {
                conn.execute(
                    "UPDATE file_system SET
                        fs_deviation = fs_deviation +
                            CASE WHEN free_space > 0 THEN weight * ?1 / free_space ELSE 0 END,
                        free_space = MAX(free_space - ?1, 0)
                     WHERE mount_point = ?2
                     AND disk_server = (SELECT id FROM disk_server WHERE name = ?3)",
                    params![file_size, mount, server],
                )
                .map_err(map_db_err)
            })
            .await?;
        if n == 0 {
            return Err(StagerError::Internal(format!(
                "no file system {} on {} to charge",
                mount_point, disk_server
            )));
        }
        debug!(
            "file system charged: disk_server={}, mount_point={}, size={}",
            disk_server, mount_point, file_size
        );
        Ok(())
    }
}

fn select_castor_file_in(
    conn: &Connection,
    file_id: u64,
    ns_host: &str,
) -> StagerResult<Option<CastorFile>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM castor_file WHERE file_id = ?1 AND ns_host = ?2",
            CastorFile::COLUMNS
        ),
        params![file_id, ns_host],
        CastorFile::from_row,
    )
    .optional()
    .map_err(map_db_err)
}

/// Production filesystems on production servers, restricted to the class's pools when given.
pub(crate) fn schedulable_file_systems(
    conn: &Connection,
    svc_class: Option<CatalogId>,
) -> StagerResult<Vec<FileSystem>> {
    let sql = format!(
        "SELECT {}, ds.status FROM file_system fs JOIN disk_server ds ON ds.id = fs.disk_server
         WHERE ?1 IS NULL OR fs.disk_pool IN
            (SELECT disk_pool FROM svc_class_disk_pool WHERE svc_class = ?1)
         ORDER BY fs.id",
        FileSystem::JOINED_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
    let rows = stmt
        .query_map(params![svc_class], |row| {
            let fs = FileSystem::from_row(row)?;
            let server_status: DiskServerStatus = row.get(9)?;
            Ok((fs, server_status))
        })
        .map_err(map_db_err)?;
    let mut result = Vec::new();
    for row in rows {
        let (fs, server_status) = row.map_err(map_db_err)?;
        if is_schedulable(fs.status, server_status) {
            result.push(fs);
        }
    }
    Ok(result)
}
