use crate::catalog_db::{map_db_err, unix_timestamp, CatalogPool};
use crate::disk_copy_mgr::load_disk_copy;
use crate::request_dispatcher::{active_subrequest_statuses, fail_subrequest_in};
use crate::resource_catalog::{load_castor_file, load_file_class_of};
use crate::stager_svc::ExternalServices;
use crate::{CatalogId, DiskCopyStatus, GcLocalFile, SubRequestStatus};
use rusqlite::{params, Connection, OptionalExtension};
use stager_lib::{NsFileId, StagerResult};
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// DiskCopy rows removed from the catalog.
    pub removed: usize,
    pub ns_deleted: usize,
    pub ns_failed: usize,
}

/// A file with no replica left anywhere, and none expected on tape.
fn is_gone(conn: &Connection, castor_file: CatalogId) -> StagerResult<Option<NsFileId>> {
    let Some(cf) = load_castor_file(conn, castor_file)? else {
        return Ok(None);
    };
    let nb_copies = load_file_class_of(conn, &cf)?
        .map(|fc| fc.nb_copies)
        .unwrap_or(1);
    if nb_copies != 0 {
        return Ok(None);
    }
    let (disk, tape): (i64, i64) = conn
        .query_row(
            "SELECT (SELECT COUNT(*) FROM disk_copy WHERE castor_file = ?1),
                    (SELECT COUNT(*) FROM tape_copy WHERE castor_file = ?1)",
            params![cf.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(map_db_err)?;
    if disk + tape > 0 {
        return Ok(None);
    }
    Ok(Some(cf.ns_file_id()))
}

fn select_ids(conn: &Connection, sql: &str, key: CatalogId) -> StagerResult<Vec<CatalogId>> {
    let mut stmt = conn.prepare(sql).map_err(map_db_err)?;
    let rows = stmt
        .query_map(params![key], |row| row.get(0))
        .map_err(map_db_err)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
}

/// Drops what the catalog holds for a file removed from the namespace.
/// Replicas on a file system are left to the disk server GC.
fn forget_castor_file(conn: &Connection, castor_file: CatalogId) -> StagerResult<()> {
    let pending = select_ids(
        conn,
        &format!(
            "SELECT id FROM sub_request WHERE castor_file = ?1 AND status IN ({})",
            active_subrequest_statuses()
        ),
        castor_file,
    )?;
    for sr in pending {
        fail_subrequest_in(conn, sr, libc::ENOENT, "file removed from the name server")?;
    }

    conn.execute(
        "DELETE FROM segment WHERE tape_copy IN (SELECT id FROM tape_copy WHERE castor_file = ?1)",
        params![castor_file],
    )
    .map_err(map_db_err)?;
    conn.execute(
        "DELETE FROM stream_tape_copy WHERE tape_copy IN
            (SELECT id FROM tape_copy WHERE castor_file = ?1)",
        params![castor_file],
    )
    .map_err(map_db_err)?;
    conn.execute("DELETE FROM tape_copy WHERE castor_file = ?1", params![castor_file])
        .map_err(map_db_err)?;

    conn.execute(
        "DELETE FROM disk_copy WHERE castor_file = ?1 AND file_system IS NULL",
        params![castor_file],
    )
    .map_err(map_db_err)?;
    conn.execute(
        "UPDATE disk_copy SET status = ?1 WHERE castor_file = ?2 AND status NOT IN (?1, ?3)",
        params![DiskCopyStatus::GcCandidate, castor_file, DiskCopyStatus::BeingDeleted],
    )
    .map_err(map_db_err)?;

    // Kept while failed SubRequests still point at it.
    conn.execute(
        "DELETE FROM castor_file WHERE id = ?1
         AND NOT EXISTS (SELECT 1 FROM disk_copy WHERE castor_file = ?1)
         AND NOT EXISTS (SELECT 1 FROM sub_request WHERE castor_file = ?1)",
        params![castor_file],
    )
    .map_err(map_db_err)?;
    Ok(())
}

pub struct GarbageCollector {
    pool: Arc<CatalogPool>,
    ext: Arc<ExternalServices>,
}

impl GarbageCollector {
    pub fn new(pool: Arc<CatalogPool>, ext: Arc<ExternalServices>) -> Self {
        Self { pool, ext }
    }

    /// Claims the GC candidates of one disk server; they move to BEINGDELETED.
    pub async fn select_files2delete(&self, disk_server: &str) -> StagerResult<Vec<GcLocalFile>> {
        let server = disk_server.to_string();
        let files = self
            .pool
            .transact(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "UPDATE disk_copy SET status = ?1 WHERE status = ?2 AND file_system IN
                            (SELECT fs.id FROM file_system fs JOIN disk_server ds ON ds.id = fs.disk_server
                             WHERE ds.name = ?3)
                         RETURNING id, path, file_system",
                    )
                    .map_err(map_db_err)?;
                let rows = stmt
                    .query_map(
                        params![DiskCopyStatus::BeingDeleted, DiskCopyStatus::GcCandidate, server],
                        |row| {
                            Ok((
                                row.get::<_, CatalogId>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, CatalogId>(2)?,
                            ))
                        },
                    )
                    .map_err(map_db_err)?;
                let claimed = rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)?;

                let mut files = Vec::with_capacity(claimed.len());
                for (id, path, fs) in claimed {
                    let mount_point: String = conn
                        .query_row(
                            "SELECT mount_point FROM file_system WHERE id = ?1",
                            params![fs],
                            |row| row.get(0),
                        )
                        .map_err(map_db_err)?;
                    files.push(GcLocalFile {
                        file_name: format!("{}/{}", mount_point.trim_end_matches('/'), path),
                        disk_copy_id: id,
                    });
                }
                files.sort_by_key(|f| f.disk_copy_id);
                Ok(files)
            })
            .await?;
        if !files.is_empty() {
            info!(
                "gc candidates selected: disk_server={}, count={}",
                disk_server,
                files.len()
            );
        }
        Ok(files)
    }

    /// Drops the catalog rows of removed replicas, then deletes files left with no copy from
    /// the namespace. A namespace failure is logged and skipped.
    pub async fn files_deleted(&self, disk_copy_ids: &[CatalogId]) -> StagerResult<GcReport> {
        let ids = disk_copy_ids.to_vec();
        let (removed, to_unlink) = self
            .pool
            .transact(move |conn| {
                let mut removed = 0;
                let mut touched = BTreeSet::new();
                for id in ids {
                    let Some(dc) = load_disk_copy(conn, id)? else {
                        continue;
                    };
                    removed += conn
                        .execute("DELETE FROM disk_copy WHERE id = ?1", params![id])
                        .map_err(map_db_err)?;
                    touched.insert(dc.castor_file);
                }
                let mut to_unlink = Vec::new();
                for cf in touched {
                    if let Some(file) = is_gone(conn, cf)? {
                        to_unlink.push(file);
                    }
                }
                Ok((removed, to_unlink))
            })
            .await?;

        let mut report = GcReport {
            removed,
            ..Default::default()
        };
        for file in to_unlink.iter() {
            match self
                .ext
                .call("delete_file", self.ext.name_server.delete_file(file))
                .await
            {
                Ok(()) => report.ns_deleted += 1,
                Err(e) if e.is_entry_vanished() => {
                    info!("gc: namespace entry already gone, file={}", file);
                    report.ns_deleted += 1;
                }
                Err(e) => {
                    error!(
                        "gc: namespace delete failed, file={}, err_code={}, err={}",
                        file,
                        e.errno(),
                        e
                    );
                    report.ns_failed += 1;
                }
            }
        }
        info!(
            "gc files deleted: removed={}, ns_deleted={}, ns_failed={}",
            report.removed, report.ns_deleted, report.ns_failed
        );
        Ok(report)
    }

    /// The name server cleaner removed these files. Whatever the catalog still holds for
    /// them is dropped; the file ids it never knew are returned.
    pub async fn ns_files_deleted(&self, ns_host: &str, file_ids: &[u64]) -> StagerResult<Vec<u64>> {
        if file_ids.is_empty() {
            return Ok(Vec::new());
        }
        let host = ns_host.to_string();
        let ids = file_ids.to_vec();
        let (orphans, forgotten) = self
            .pool
            .transact(move |conn| {
                let mut orphans = Vec::new();
                let mut forgotten = 0;
                for file_id in ids {
                    let cf: Option<CatalogId> = conn
                        .query_row(
                            "SELECT id FROM castor_file WHERE file_id = ?1 AND ns_host = ?2",
                            params![file_id, host],
                            |row| row.get(0),
                        )
                        .optional()
                        .map_err(map_db_err)?;
                    match cf {
                        Some(cf) => {
                            forget_castor_file(conn, cf)?;
                            forgotten += 1;
                        }
                        None => orphans.push(file_id),
                    }
                }
                Ok((orphans, forgotten))
            })
            .await?;
        info!(
            "ns files deleted: ns_host={}, forgotten={}, orphans={}",
            ns_host,
            forgotten,
            orphans.len()
        );
        Ok(orphans)
    }

    /// A disk server found files the catalog may not know. Returns the disk copy ids
    /// with no catalog row; the server removes those files.
    pub async fn stg_files_deleted(&self, disk_copy_ids: &[CatalogId]) -> StagerResult<Vec<CatalogId>> {
        if disk_copy_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = disk_copy_ids.to_vec();
        let orphans = self
            .pool
            .transact(move |conn| {
                let mut orphans = Vec::new();
                for id in ids {
                    if load_disk_copy(conn, id)?.is_none() {
                        orphans.push(id);
                    }
                }
                Ok(orphans)
            })
            .await?;
        if !orphans.is_empty() {
            info!("stager files deleted: orphans={}", orphans.len());
        }
        Ok(orphans)
    }

    /// Deletes requests whose SubRequests all ended and were last touched more than
    /// `max_age_secs` ago. Requests still waiting for dispatch are never touched.
    pub async fn remove_terminated_requests(&self, max_age_secs: u64) -> StagerResult<usize> {
        let cutoff = unix_timestamp().saturating_sub(max_age_secs as i64);
        let removed = self
            .pool
            .transact(move |conn| {
                let ids = {
                    let mut stmt = conn
                        .prepare(
                            "DELETE FROM request WHERE creation_time <= ?1
                             AND id NOT IN (SELECT id FROM new_request)
                             AND NOT EXISTS (SELECT 1 FROM sub_request sr
                                 WHERE sr.request = request.id
                                 AND (sr.status NOT IN (?2, ?3, ?4) OR sr.last_modification_time > ?1))
                             RETURNING id",
                        )
                        .map_err(map_db_err)?;
                    let rows = stmt
                        .query_map(
                            params![
                                cutoff,
                                SubRequestStatus::Failed,
                                SubRequestStatus::Finished,
                                SubRequestStatus::FailedFinished
                            ],
                            |row| row.get::<_, CatalogId>(0),
                        )
                        .map_err(map_db_err)?;
                    rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)?
                };
                for id in ids.iter() {
                    conn.execute("DELETE FROM sub_request WHERE request = ?1", params![id])
                        .map_err(map_db_err)?;
                }
                Ok(ids.len())
            })
            .await?;
        info!("terminated requests removed: count={}, max_age_secs={}", removed, max_age_secs);
        Ok(removed)
    }

    /// Replicas the disk server could not remove become FAILED.
    pub async fn files_deletion_failed(&self, disk_copy_ids: &[CatalogId]) -> StagerResult<usize> {
        let ids = disk_copy_ids.to_vec();
        let failed = self
            .pool
            .transact(move |conn| {
                let mut failed = 0;
                for id in ids {
                    failed += conn
                        .execute(
                            "UPDATE disk_copy SET status = ?1 WHERE id = ?2 AND status = ?3",
                            params![DiskCopyStatus::Failed, id, DiskCopyStatus::BeingDeleted],
                        )
                        .map_err(map_db_err)?;
                }
                Ok(failed)
            })
            .await?;
        if failed > 0 {
            warn!("gc deletion failed: count={}", failed);
        }
        Ok(failed)
    }
}
