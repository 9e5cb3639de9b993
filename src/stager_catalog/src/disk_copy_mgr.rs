use crate::catalog_db::{map_db_err, unix_timestamp, CatalogPool};
use crate::placement_policy::is_schedulable;
use crate::request_dispatcher::{
    archive_subrequest_in, fail_subrequest_in, load_subrequest, wake_waiting_subrequests,
};
use crate::resource_catalog::{load_castor_file, load_file_class_of};
use crate::stager_svc::ExternalServices;
use crate::{
    CastorFile, CatalogId, DiskCopy, DiskCopyForRecall, DiskCopyStatus, DiskServerStatus,
    FileSystem, GetUpdateStartResult, RecallOrchestrator, RequestType, SubRequest,
    SubRequestStatus, TapeCopyStatus,
};
use rusqlite::{params, Connection, OptionalExtension};
use stager_lib::{StagerError, StagerResult};
use std::sync::Arc;
use std::time::Duration;

/// Failure records are retried this many times when the catalog is busy.
const FAILURE_RECORD_ATTEMPTS: u32 = 5;
const FAILURE_RECORD_BACKOFF: Duration = Duration::from_millis(200);

/// Relative location of a replica below its filesystem mount point.
pub(crate) fn build_disk_copy_path(cf: &CastorFile, disk_copy: CatalogId) -> String {
    format!(
        "{:02}/{}@{}.{}",
        cf.file_id % 100,
        cf.file_id,
        cf.ns_host,
        disk_copy
    )
}

pub(crate) fn load_disk_copy(conn: &Connection, id: CatalogId) -> StagerResult<Option<DiskCopy>> {
    conn.query_row(
        &format!("SELECT {} FROM disk_copy WHERE id = ?1", DiskCopy::COLUMNS),
        params![id],
        DiskCopy::from_row,
    )
    .optional()
    .map_err(map_db_err)
}

fn disk_copies_of(conn: &Connection, castor_file: CatalogId) -> StagerResult<Vec<DiskCopy>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM disk_copy WHERE castor_file = ?1 ORDER BY id",
            DiskCopy::COLUMNS
        ))
        .map_err(map_db_err)?;
    let rows = stmt
        .query_map(params![castor_file], DiskCopy::from_row)
        .map_err(map_db_err)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
}

pub(crate) fn insert_disk_copy(
    conn: &Connection,
    cf: &CastorFile,
    file_system: Option<CatalogId>,
    status: DiskCopyStatus,
) -> StagerResult<DiskCopy> {
    let creation_time = unix_timestamp();
    conn.execute(
        "INSERT INTO disk_copy (path, status, file_system, castor_file, creation_time)
         VALUES ('', ?1, ?2, ?3, ?4)",
        params![status, file_system, cf.id, creation_time],
    )
    .map_err(map_db_err)?;
    let id = conn.last_insert_rowid() as CatalogId;
    let path = build_disk_copy_path(cf, id);
    conn.execute(
        "UPDATE disk_copy SET path = ?1 WHERE id = ?2",
        params![path, id],
    )
    .map_err(map_db_err)?;
    debug!(
        "disk copy created: disk_copy_id={}, castor_file_id={}, status={}",
        id, cf.id, status
    );
    Ok(DiskCopy {
        id,
        path,
        status,
        file_system,
        castor_file: cf.id,
        gc_weight: 0.0,
        creation_time,
    })
}

fn set_disk_copy_status(conn: &Connection, id: CatalogId, status: DiskCopyStatus) -> StagerResult<()> {
    conn.execute(
        "UPDATE disk_copy SET status = ?1 WHERE id = ?2",
        params![status, id],
    )
    .map_err(map_db_err)?;
    Ok(())
}

fn link_subrequest(
    conn: &Connection,
    subreq: CatalogId,
    disk_copy: CatalogId,
    parent: Option<CatalogId>,
    status: SubRequestStatus,
) -> StagerResult<()> {
    conn.execute(
        "UPDATE sub_request SET disk_copy = ?1, parent = ?2, status = ?3,
            last_modification_time = ?4 WHERE id = ?5",
        params![disk_copy, parent, status, unix_timestamp(), subreq],
    )
    .map_err(map_db_err)?;
    Ok(())
}

/// The SubRequest that drives production of `disk_copy`, if any.
fn owner_of(conn: &Connection, disk_copy: CatalogId) -> StagerResult<Option<CatalogId>> {
    conn.query_row(
        "SELECT id FROM sub_request WHERE disk_copy = ?1 AND status IN (?2, ?3, ?4)
         ORDER BY id LIMIT 1",
        params![
            disk_copy,
            SubRequestStatus::WaitSched,
            SubRequestStatus::WaitTapeRecall,
            SubRequestStatus::Ready
        ],
        |row| row.get(0),
    )
    .optional()
    .map_err(map_db_err)
}

/// A copy a reader must wait for before it can be served.
fn is_pending_for_readers(status: DiskCopyStatus) -> bool {
    status.is_in_flight() || status == DiskCopyStatus::StageOut
}

fn is_source(status: DiskCopyStatus) -> bool {
    matches!(status, DiskCopyStatus::Staged | DiskCopyStatus::CanBeMigr)
}

/// Readable copies living on schedulable filesystems.
fn replication_sources(conn: &Connection, copies: &[DiskCopy]) -> StagerResult<Vec<DiskCopyForRecall>> {
    let mut sources = Vec::new();
    for dc in copies.iter().filter(|dc| is_source(dc.status)) {
        let Some(fs_id) = dc.file_system else {
            continue;
        };
        let row = conn
            .query_row(
                "SELECT fs.mount_point, fs.weight, fs.status, ds.name, ds.status
                 FROM file_system fs JOIN disk_server ds ON ds.id = fs.disk_server
                 WHERE fs.id = ?1",
                params![fs_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, DiskServerStatus>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(map_db_err)?;
        let Some((mount_point, weight, fs_status, disk_server, server_status)) = row else {
            continue;
        };
        if !is_schedulable(fs_status, server_status) {
            continue;
        }
        sources.push(DiskCopyForRecall {
            disk_copy: dc.clone(),
            fs_weight: weight,
            mount_point,
            disk_server,
        });
    }
    Ok(sources)
}

/// Fails a write SubRequest together with the replica it was producing.
pub(crate) fn fail_write_in(
    conn: &Connection,
    subreq_id: CatalogId,
    error_code: i32,
    message: &str,
) -> StagerResult<bool> {
    let Some(sr) = load_subrequest(conn, subreq_id)? else {
        return Ok(false);
    };
    if sr.status.is_archived() {
        return Ok(false);
    }
    fail_subrequest_in(conn, subreq_id, error_code, message)?;
    if let Some(dc) = sr.disk_copy {
        let n = conn
            .execute(
                "UPDATE disk_copy SET status = ?1 WHERE id = ?2 AND status IN (?3, ?4)",
                params![
                    DiskCopyStatus::Failed,
                    dc,
                    DiskCopyStatus::WaitFs,
                    DiskCopyStatus::StageOut
                ],
            )
            .map_err(map_db_err)?;
        if n > 0 {
            wake_waiting_subrequests(conn, dc, SubRequestStatus::Restart, None)?;
        }
    }
    Ok(true)
}

/// Closes the file being written: records its size and queues tape copies when the class wants them.
pub(crate) fn put_done_in(
    conn: &Connection,
    castor_file: CatalogId,
    size: u64,
) -> StagerResult<Option<DiskCopy>> {
    let cf = load_castor_file(conn, castor_file)?.ok_or_else(|| {
        StagerError::Internal(format!("castor file {} vanished", castor_file))
    })?;
    conn.execute(
        "UPDATE castor_file SET file_size = ?1 WHERE id = ?2",
        params![size, cf.id],
    )
    .map_err(map_db_err)?;

    let stage_out = conn
        .query_row(
            &format!(
                "SELECT {} FROM disk_copy WHERE castor_file = ?1 AND status = ?2 ORDER BY id LIMIT 1",
                DiskCopy::COLUMNS
            ),
            params![cf.id, DiskCopyStatus::StageOut],
            DiskCopy::from_row,
        )
        .optional()
        .map_err(map_db_err)?;
    let Some(mut dc) = stage_out else {
        return Ok(None);
    };

    let nb_copies = load_file_class_of(conn, &cf)?
        .map(|fc| fc.nb_copies)
        .unwrap_or(1);
    if nb_copies == 0 || size == 0 {
        dc.status = DiskCopyStatus::Staged;
    } else {
        let promoted = conn
            .execute(
                "UPDATE tape_copy SET status = ?1 WHERE castor_file = ?2 AND status = ?3",
                params![TapeCopyStatus::ToBeMigrated, cf.id, TapeCopyStatus::Created],
            )
            .map_err(map_db_err)?;
        let pending: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM tape_copy WHERE castor_file = ?1 AND status IN (?2, ?3, ?4)",
                params![
                    cf.id,
                    TapeCopyStatus::ToBeMigrated,
                    TapeCopyStatus::WaitInStreams,
                    TapeCopyStatus::Selected
                ],
                |row| row.get(0),
            )
            .map_err(map_db_err)?;
        if promoted == 0 && pending == 0 {
            for copy_nb in 1..=nb_copies {
                conn.execute(
                    "INSERT INTO tape_copy (copy_nb, status, castor_file) VALUES (?1, ?2, ?3)",
                    params![copy_nb, TapeCopyStatus::ToBeMigrated, cf.id],
                )
                .map_err(map_db_err)?;
            }
        }
        dc.status = DiskCopyStatus::CanBeMigr;
    }
    set_disk_copy_status(conn, dc.id, dc.status)?;
    wake_waiting_subrequests(conn, dc.id, SubRequestStatus::Restart, None)?;
    debug!(
        "put done: castor_file_id={}, disk_copy_id={}, size={}, status={}, nb_copies={}",
        cf.id, dc.id, size, dc.status, nb_copies
    );
    Ok(Some(dc))
}

/// Starts a fresh write generation of the file. `None` when the file cannot be overwritten now.
pub(crate) fn recreate_castor_file_in(
    conn: &Connection,
    cf: &CastorFile,
    subreq: CatalogId,
) -> StagerResult<Option<DiskCopy>> {
    let selected: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM tape_copy WHERE castor_file = ?1 AND status = ?2",
            params![cf.id, TapeCopyStatus::Selected],
            |row| row.get(0),
        )
        .map_err(map_db_err)?;
    if selected > 0 {
        info!(
            "recreate refused, file is being migrated: castor_file_id={}, subreq_id={}",
            cf.id, subreq
        );
        return Ok(None);
    }
    let copies = disk_copies_of(conn, cf.id)?;
    if let Some(busy) = copies.iter().find(|dc| is_pending_for_readers(dc.status)) {
        info!(
            "recreate refused, replica in flight: castor_file_id={}, disk_copy_id={}, status={}, subreq_id={}",
            cf.id, busy.id, busy.status, subreq
        );
        return Ok(None);
    }

    conn.execute(
        "UPDATE disk_copy SET status = ?1 WHERE castor_file = ?2 AND status IN (?3, ?4)",
        params![
            DiskCopyStatus::GcCandidate,
            cf.id,
            DiskCopyStatus::Staged,
            DiskCopyStatus::CanBeMigr
        ],
    )
    .map_err(map_db_err)?;
    conn.execute(
        "DELETE FROM segment WHERE tape_copy IN (SELECT id FROM tape_copy WHERE castor_file = ?1)",
        params![cf.id],
    )
    .map_err(map_db_err)?;
    conn.execute(
        "DELETE FROM stream_tape_copy WHERE tape_copy IN
            (SELECT id FROM tape_copy WHERE castor_file = ?1)",
        params![cf.id],
    )
    .map_err(map_db_err)?;
    conn.execute("DELETE FROM tape_copy WHERE castor_file = ?1", params![cf.id])
        .map_err(map_db_err)?;
    conn.execute(
        "UPDATE castor_file SET file_size = 0 WHERE id = ?1",
        params![cf.id],
    )
    .map_err(map_db_err)?;

    let dc = insert_disk_copy(conn, cf, None, DiskCopyStatus::WaitFs)?;
    conn.execute(
        "UPDATE sub_request SET disk_copy = ?1, last_modification_time = ?2 WHERE id = ?3",
        params![dc.id, unix_timestamp(), subreq],
    )
    .map_err(map_db_err)?;
    Ok(Some(dc))
}

enum ReadPlan {
    Nothing,
    Scheduled(GetUpdateStartResult),
    Recall { castor_file: CastorFile, disk_copy: CatalogId, subreq: CatalogId },
}

fn plan_get_update(conn: &Connection, subreq: CatalogId, fs: &FileSystem) -> StagerResult<ReadPlan> {
    let Some(sr) = load_subrequest(conn, subreq)? else {
        return Ok(ReadPlan::Nothing);
    };
    if sr.status != SubRequestStatus::WaitSched {
        debug!(
            "get_update_start: subrequest no longer scheduled, subreq_id={}, status={}",
            sr.id, sr.status
        );
        return Ok(ReadPlan::Nothing);
    }
    let cf_id = sr.castor_file.ok_or_else(|| {
        StagerError::InvalidState(format!("subrequest {} has no castor file", sr.id))
    })?;
    let cf = load_castor_file(conn, cf_id)?
        .ok_or_else(|| StagerError::Internal(format!("castor file {} vanished", cf_id)))?;
    let copies = disk_copies_of(conn, cf.id)?;

    if let Some(pending) = copies.iter().find(|dc| is_pending_for_readers(dc.status)) {
        let parent = owner_of(conn, pending.id)?;
        link_subrequest(conn, sr.id, pending.id, parent, SubRequestStatus::WaitSubReq)?;
        debug!(
            "get_update_start: waiting on replica, subreq_id={}, disk_copy_id={}, status={}",
            sr.id, pending.id, pending.status
        );
        return Ok(ReadPlan::Nothing);
    }

    if let Some(local) = copies
        .iter()
        .find(|dc| is_source(dc.status) && dc.file_system == Some(fs.id))
    {
        link_subrequest(conn, sr.id, local.id, None, SubRequestStatus::Ready)?;
        return Ok(ReadPlan::Scheduled(GetUpdateStartResult {
            disk_copy: Some(local.clone()),
            sources: Vec::new(),
            empty_file: false,
        }));
    }

    let sources = replication_sources(conn, &copies)?;
    if !sources.is_empty() || cf.size == 0 {
        let dc = insert_disk_copy(conn, &cf, Some(fs.id), DiskCopyStatus::WaitDisk2DiskCopy)?;
        link_subrequest(conn, sr.id, dc.id, None, SubRequestStatus::WaitSched)?;
        let empty_file = sources.is_empty();
        return Ok(ReadPlan::Scheduled(GetUpdateStartResult {
            disk_copy: Some(dc),
            sources,
            empty_file,
        }));
    }

    let dc = insert_disk_copy(conn, &cf, None, DiskCopyStatus::WaitTapeRecall)?;
    link_subrequest(conn, sr.id, dc.id, None, SubRequestStatus::WaitTapeRecall)?;
    Ok(ReadPlan::Recall {
        castor_file: cf,
        disk_copy: dc.id,
        subreq: sr.id,
    })
}

pub struct DiskCopyMgr {
    pool: Arc<CatalogPool>,
    ext: Arc<ExternalServices>,
    recall: Arc<RecallOrchestrator>,
}

impl DiskCopyMgr {
    pub fn new(
        pool: Arc<CatalogPool>,
        ext: Arc<ExternalServices>,
        recall: Arc<RecallOrchestrator>,
    ) -> Self {
        Self { pool, ext, recall }
    }

    /// Picks or creates the replica a read/update SubRequest will use on `fs`.
    ///
    /// An empty result with no error means there is nothing to schedule right now: the
    /// SubRequest waits on another replica, went to tape recall, or was no longer queued.
    pub async fn get_update_start(
        &self,
        subreq: &SubRequest,
        fs: &FileSystem,
    ) -> StagerResult<GetUpdateStartResult> {
        let subreq_id = subreq.id;
        let target = fs.clone();
        let plan = self
            .pool
            .transact(move |conn| plan_get_update(conn, subreq_id, &target))
            .await?;

        let (castor_file, disk_copy, subreq_id) = match plan {
            ReadPlan::Nothing => return Ok(GetUpdateStartResult::default()),
            ReadPlan::Scheduled(result) => {
                if let Some(dc) = result.disk_copy.as_ref() {
                    debug!(
                        "get_update_start: scheduled, subreq_id={}, disk_copy_id={}, status={}, nb_sources={}, empty_file={}",
                        subreq_id,
                        dc.id,
                        dc.status,
                        result.sources.len(),
                        result.empty_file
                    );
                }
                return Ok(result);
            }
            ReadPlan::Recall {
                castor_file,
                disk_copy,
                subreq,
            } => (castor_file, disk_copy, subreq),
        };

        match self
            .recall
            .create_tape_copy_segments_for_recall(&castor_file)
            .await
        {
            Ok(_) => Ok(GetUpdateStartResult::default()),
            Err(e) => {
                let error_code = e.errno();
                let message = e.to_string();
                warn!(
                    "get_update_start: recall could not be scheduled, subreq_id={}, disk_copy_id={}, err_code={}, err={}",
                    subreq_id, disk_copy, error_code, message
                );
                let recorded = self
                    .pool
                    .transact_retrying(
                        FAILURE_RECORD_ATTEMPTS,
                        FAILURE_RECORD_BACKOFF,
                        move |conn| {
                            set_disk_copy_status(conn, disk_copy, DiskCopyStatus::Failed)?;
                            fail_subrequest_in(conn, subreq_id, error_code, &message)?;
                            wake_waiting_subrequests(
                                conn,
                                disk_copy,
                                SubRequestStatus::Failed,
                                Some((error_code, &message)),
                            )?;
                            Ok(())
                        },
                    )
                    .await;
                if let Err(record_err) = recorded {
                    error!(
                        "get_update_start: recall failure could not be recorded, subreq_id={}, disk_copy_id={}, err={}",
                        subreq_id, disk_copy, record_err
                    );
                    return Err(record_err);
                }
                Err(e)
            }
        }
    }

    /// Allocates the write target of a Put on `fs`. Failure fails the SubRequest.
    pub async fn put_start(&self, subreq: &SubRequest, fs: &FileSystem) -> StagerResult<DiskCopy> {
        let subreq_id = subreq.id;
        let fs_id = fs.id;
        let result = self
            .pool
            .transact(move |conn| {
                let sr = load_subrequest(conn, subreq_id)?.ok_or_else(|| {
                    StagerError::InvalidParam(format!("unknown subrequest {}", subreq_id))
                })?;
                if sr.status != SubRequestStatus::WaitSched {
                    return Err(StagerError::InvalidState(format!(
                        "subrequest {} is {}, not WAITSCHED",
                        sr.id, sr.status
                    )));
                }
                let cf_id = sr.castor_file.ok_or_else(|| {
                    StagerError::InvalidState(format!("subrequest {} has no castor file", sr.id))
                })?;
                let cf = load_castor_file(conn, cf_id)?.ok_or_else(|| {
                    StagerError::Internal(format!("castor file {} vanished", cf_id))
                })?;

                let linked = match sr.disk_copy {
                    Some(id) => load_disk_copy(conn, id)?.filter(|dc| {
                        matches!(dc.status, DiskCopyStatus::WaitFs | DiskCopyStatus::StageOut)
                    }),
                    None => None,
                };
                let mut dc = match linked {
                    Some(dc) => dc,
                    None => recreate_castor_file_in(conn, &cf, sr.id)?.ok_or_else(|| {
                        StagerError::ResourceUnavailable(format!(
                            "castor file {} cannot be recreated now",
                            cf.id
                        ))
                    })?,
                };
                conn.execute(
                    "UPDATE disk_copy SET status = ?1, file_system = ?2 WHERE id = ?3",
                    params![DiskCopyStatus::StageOut, fs_id, dc.id],
                )
                .map_err(map_db_err)?;
                dc.status = DiskCopyStatus::StageOut;
                dc.file_system = Some(fs_id);
                link_subrequest(conn, sr.id, dc.id, None, SubRequestStatus::Ready)?;
                Ok(dc)
            })
            .await;

        match result {
            Ok(dc) => {
                info!(
                    "put started: subreq_id={}, disk_copy_id={}, fs_id={}",
                    subreq_id, dc.id, fs_id
                );
                Ok(dc)
            }
            Err(e) => {
                self.fail_write(subreq_id, &e).await;
                Err(e)
            }
        }
    }

    async fn fail_write(&self, subreq_id: CatalogId, cause: &StagerError) {
        let error_code = cause.errno();
        let message = cause.to_string();
        warn!(
            "write failed: subreq_id={}, err_code={}, err={}",
            subreq_id, error_code, message
        );
        if let Err(e) = self
            .pool
            .transact_retrying(FAILURE_RECORD_ATTEMPTS, FAILURE_RECORD_BACKOFF, move |conn| {
                fail_write_in(conn, subreq_id, error_code, &message)
            })
            .await
        {
            error!(
                "write failure could not be recorded: subreq_id={}, err={}",
                subreq_id, e
            );
        }
    }

    async fn fail_request_level(&self, subreq_id: CatalogId, cause: &StagerError) {
        let error_code = cause.errno();
        let message = cause.to_string();
        if let Err(e) = self
            .pool
            .transact(move |conn| fail_subrequest_in(conn, subreq_id, error_code, &message))
            .await
        {
            error!(
                "subrequest failure could not be recorded: subreq_id={}, err={}",
                subreq_id, e
            );
        }
    }

    /// Records the final size of a written file and moves its replica out of STAGEOUT.
    pub async fn put_done(&self, castor_file: CatalogId, size: u64) -> StagerResult<Option<DiskCopy>> {
        self.pool
            .transact(move |conn| put_done_in(conn, castor_file, size))
            .await
    }

    /// Closes a file written through PrepareToPut and archives the PutDone SubRequest.
    pub async fn put_done_start(&self, subreq_id: CatalogId) -> StagerResult<DiskCopy> {
        let result = self
            .pool
            .transact(move |conn| {
                let sr = load_subrequest(conn, subreq_id)?.ok_or_else(|| {
                    StagerError::InvalidParam(format!("unknown subrequest {}", subreq_id))
                })?;
                let cf_id = sr.castor_file.ok_or_else(|| {
                    StagerError::InvalidState(format!("subrequest {} has no castor file", sr.id))
                })?;
                let cf = load_castor_file(conn, cf_id)?.ok_or_else(|| {
                    StagerError::Internal(format!("castor file {} vanished", cf_id))
                })?;
                let dc = disk_copies_of(conn, cf.id)?
                    .into_iter()
                    .find(|dc| dc.status == DiskCopyStatus::StageOut)
                    .ok_or_else(|| {
                        StagerError::InvalidState(format!(
                            "castor file {} has no file being written",
                            cf.id
                        ))
                    })?;
                let writers: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM sub_request sr JOIN request r ON r.id = sr.request
                         WHERE sr.disk_copy = ?1 AND sr.status IN (?2, ?3) AND r.req_type = ?4",
                        params![
                            dc.id,
                            SubRequestStatus::WaitSched,
                            SubRequestStatus::Ready,
                            RequestType::Put
                        ],
                        |row| row.get(0),
                    )
                    .map_err(map_db_err)?;
                if writers > 0 {
                    return Err(StagerError::InvalidState(format!(
                        "castor file {} is still being written by {} put(s)",
                        cf.id, writers
                    )));
                }
                let closed = put_done_in(conn, cf.id, cf.size)?.ok_or_else(|| {
                    StagerError::Internal(format!("disk copy {} left STAGEOUT", dc.id))
                })?;
                archive_subrequest_in(conn, sr.id, SubRequestStatus::Finished)?;
                Ok(closed)
            })
            .await;
        if let Err(e) = &result {
            warn!(
                "put_done_start failed: subreq_id={}, err_code={}, err={}",
                subreq_id,
                e.errno(),
                e
            );
            self.fail_request_level(subreq_id, e).await;
        }
        result
    }

    /// A replication or empty-file creation finished with `status`.
    pub async fn disk2disk_copy_done(
        &self,
        disk_copy: CatalogId,
        status: DiskCopyStatus,
    ) -> StagerResult<()> {
        let success = match status {
            DiskCopyStatus::Staged | DiskCopyStatus::CanBeMigr => true,
            DiskCopyStatus::Failed => false,
            other => {
                return Err(StagerError::InvalidParam(format!(
                    "{} is not a replication outcome",
                    other
                )))
            }
        };
        self.pool
            .transact(move |conn| {
                let Some(dc) = load_disk_copy(conn, disk_copy)? else {
                    return Ok(());
                };
                if dc.status != DiskCopyStatus::WaitDisk2DiskCopy {
                    return Ok(());
                }
                set_disk_copy_status(conn, dc.id, status)?;
                if success {
                    conn.execute(
                        "UPDATE sub_request SET status = ?1, last_modification_time = ?2
                         WHERE disk_copy = ?3 AND status = ?4",
                        params![
                            SubRequestStatus::Ready,
                            unix_timestamp(),
                            dc.id,
                            SubRequestStatus::WaitSched
                        ],
                    )
                    .map_err(map_db_err)?;
                } else if let Some(owner) = owner_of(conn, dc.id)? {
                    fail_subrequest_in(conn, owner, libc::EIO, "disk to disk copy failed")?;
                }
                let woken = wake_waiting_subrequests(conn, dc.id, SubRequestStatus::Restart, None)?;
                debug!(
                    "disk2disk copy done: disk_copy_id={}, status={}, restarted={}",
                    dc.id, status, woken
                );
                Ok(())
            })
            .await
    }

    /// The mover served the file. Safe to call again on an archived SubRequest.
    pub async fn get_update_done(&self, subreq_id: CatalogId) -> StagerResult<()> {
        self.pool
            .transact(move |conn| {
                let Some(sr) = load_subrequest(conn, subreq_id)? else {
                    debug!("get_update_done: already cleaned up, subreq_id={}", subreq_id);
                    return Ok(());
                };
                if sr.status.is_archived() {
                    return Ok(());
                }
                archive_subrequest_in(conn, sr.id, SubRequestStatus::Finished)?;
                Ok(())
            })
            .await
    }

    pub async fn get_update_failed(&self, subreq_id: CatalogId) -> StagerResult<()> {
        self.pool
            .transact(move |conn| {
                let Some(sr) = load_subrequest(conn, subreq_id)? else {
                    return Ok(());
                };
                if sr.status.is_archived() {
                    return Ok(());
                }
                let error_code = if sr.error_code != 0 {
                    sr.error_code
                } else {
                    libc::EIO
                };
                if fail_subrequest_in(conn, sr.id, error_code, "mover reported failure")? {
                    warn!(
                        "get/update failed: subreq_id={}, request_id={}, err_code={}",
                        sr.id, sr.request, error_code
                    );
                }
                if let Some(dc_id) = sr.disk_copy {
                    conn.execute(
                        "UPDATE disk_copy SET status = ?1 WHERE id = ?2 AND status = ?3",
                        params![
                            DiskCopyStatus::Failed,
                            dc_id,
                            DiskCopyStatus::WaitDisk2DiskCopy
                        ],
                    )
                    .map_err(map_db_err)?;
                    wake_waiting_subrequests(conn, dc_id, SubRequestStatus::Restart, None)?;
                }
                Ok(())
            })
            .await
    }

    pub async fn put_failed(&self, subreq_id: CatalogId) -> StagerResult<()> {
        self.pool
            .transact(move |conn| {
                if fail_write_in(conn, subreq_id, libc::EIO, "mover reported failure")? {
                    warn!(
                        "put failed: subreq_id={}, err_code={}",
                        subreq_id,
                        libc::EIO
                    );
                }
                Ok(())
            })
            .await
    }

    /// Closes a written file and queues its tape copies. The namespace must accept the new
    /// size before anything changes in the catalog.
    pub async fn prepare_for_migration(
        &self,
        subreq: &SubRequest,
        file_size: u64,
    ) -> StagerResult<()> {
        let subreq_id = subreq.id;
        let target = self
            .pool
            .transact(move |conn| {
                let Some(sr) = load_subrequest(conn, subreq_id)? else {
                    return Ok(None);
                };
                if sr.status.is_archived() {
                    return Ok(None);
                }
                let cf_id = sr.castor_file.ok_or_else(|| {
                    StagerError::InvalidState(format!("subrequest {} has no castor file", sr.id))
                })?;
                load_castor_file(conn, cf_id)?
                    .map(Some)
                    .ok_or_else(|| StagerError::Internal(format!("castor file {} vanished", cf_id)))
            })
            .await;
        let cf = match target {
            Ok(Some(cf)) => cf,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.fail_write(subreq_id, &e).await;
                return Err(e);
            }
        };

        let file = cf.ns_file_id();
        if let Err(e) = self
            .ext
            .call(
                "set_file_size",
                self.ext.name_server.set_file_size(&file, file_size),
            )
            .await
        {
            error!(
                "prepare_for_migration: namespace refused size, subreq_id={}, file={}, err_code={}, err={}",
                subreq_id,
                file,
                e.errno(),
                e
            );
            self.fail_write(subreq_id, &e).await;
            return Err(e);
        }

        let cf_id = cf.id;
        let closed = self
            .pool
            .transact(move |conn| {
                match load_subrequest(conn, subreq_id)? {
                    Some(sr) if !sr.status.is_archived() => {}
                    _ => return Ok(false),
                }
                put_done_in(conn, cf_id, file_size)?;
                archive_subrequest_in(conn, subreq_id, SubRequestStatus::Finished)?;
                Ok(true)
            })
            .await;
        match closed {
            Ok(true) => {
                info!(
                    "prepared for migration: subreq_id={}, castor_file_id={}, size={}",
                    subreq_id, cf_id, file_size
                );
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                self.fail_write(subreq_id, &e).await;
                Err(e)
            }
        }
    }

    /// Discards every replica of the file and opens a new WAITFS one for `subreq`.
    pub async fn recreate_castor_file(
        &self,
        castor_file: &CastorFile,
        subreq: &SubRequest,
    ) -> StagerResult<Option<DiskCopy>> {
        let cf = castor_file.clone();
        let subreq_id = subreq.id;
        self.pool
            .transact(move |conn| recreate_castor_file_in(conn, &cf, subreq_id))
            .await
    }

    /// Whether the SubRequest should go to a scheduler now, with the replicas a read could use.
    pub async fn is_subrequest_to_schedule(
        &self,
        subreq: &SubRequest,
    ) -> StagerResult<(bool, Vec<DiskCopyForRecall>)> {
        if subreq.request_type.is_write() {
            return Ok((true, Vec::new()));
        }
        let Some(cf_id) = subreq.castor_file else {
            return Ok((true, Vec::new()));
        };
        let subreq_id = subreq.id;
        self.pool
            .transact(move |conn| {
                let copies = disk_copies_of(conn, cf_id)?;
                if let Some(pending) = copies.iter().find(|dc| is_pending_for_readers(dc.status)) {
                    let parent = owner_of(conn, pending.id)?;
                    link_subrequest(conn, subreq_id, pending.id, parent, SubRequestStatus::WaitSubReq)?;
                    return Ok((false, Vec::new()));
                }
                Ok((true, replication_sources(conn, &copies)?))
            })
            .await
    }

    /// Marks the staged replicas of the file for garbage collection.
    pub async fn stage_rm(&self, subreq_id: CatalogId) -> StagerResult<bool> {
        let result = self
            .pool
            .transact(move |conn| {
                let sr = load_subrequest(conn, subreq_id)?.ok_or_else(|| {
                    StagerError::InvalidParam(format!("unknown subrequest {}", subreq_id))
                })?;
                let Some(cf_id) = sr.castor_file else {
                    fail_subrequest_in(conn, sr.id, libc::ENOENT, "file unknown to the stager")?;
                    return Ok(false);
                };
                let copies = disk_copies_of(conn, cf_id)?;
                let selected: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM tape_copy WHERE castor_file = ?1 AND status = ?2",
                        params![cf_id, TapeCopyStatus::Selected],
                        |row| row.get(0),
                    )
                    .map_err(map_db_err)?;
                let busy = selected > 0
                    || copies.iter().any(|dc| {
                        is_pending_for_readers(dc.status) || dc.status == DiskCopyStatus::CanBeMigr
                    });
                if busy {
                    fail_subrequest_in(conn, sr.id, libc::EBUSY, "file is busy")?;
                    return Ok(false);
                }
                let removed = conn
                    .execute(
                        "UPDATE disk_copy SET status = ?1 WHERE castor_file = ?2 AND status = ?3",
                        params![DiskCopyStatus::GcCandidate, cf_id, DiskCopyStatus::Staged],
                    )
                    .map_err(map_db_err)?;
                if removed == 0 {
                    fail_subrequest_in(conn, sr.id, libc::ENOENT, "file not staged")?;
                    return Ok(false);
                }
                archive_subrequest_in(conn, sr.id, SubRequestStatus::Finished)?;
                info!(
                    "stage rm: subreq_id={}, castor_file_id={}, disk_copies={}",
                    sr.id, cf_id, removed
                );
                Ok(true)
            })
            .await;
        if let Err(e) = &result {
            self.fail_request_level(subreq_id, e).await;
        }
        result
    }

    pub async fn set_file_gc_weight(&self, subreq_id: CatalogId, weight: f64) -> StagerResult<bool> {
        let result = self
            .pool
            .transact(move |conn| {
                let sr = load_subrequest(conn, subreq_id)?.ok_or_else(|| {
                    StagerError::InvalidParam(format!("unknown subrequest {}", subreq_id))
                })?;
                let Some(cf_id) = sr.castor_file else {
                    fail_subrequest_in(conn, sr.id, libc::ENOENT, "file unknown to the stager")?;
                    return Ok(false);
                };
                let updated = conn
                    .execute(
                        "UPDATE disk_copy SET gc_weight = ?1 WHERE castor_file = ?2 AND status = ?3",
                        params![weight, cf_id, DiskCopyStatus::Staged],
                    )
                    .map_err(map_db_err)?;
                if updated == 0 {
                    fail_subrequest_in(conn, sr.id, libc::ENOENT, "file not staged")?;
                    return Ok(false);
                }
                archive_subrequest_in(conn, sr.id, SubRequestStatus::Finished)?;
                Ok(true)
            })
            .await;
        if let Err(e) = &result {
            self.fail_request_level(subreq_id, e).await;
        }
        result
    }
}
