use crate::catalog_db::{map_db_err, CatalogPool};
use crate::placement_policy::{is_schedulable, pick_best, PlacementCandidate, PlacementPolicy};
use crate::recall_orchestrator::{delete_tape_copy, load_tape_copy};
use crate::resource_catalog::load_streams_of_pool;
use crate::{
    CastorFile, CatalogId, DiskCopyStatus, DiskServerStatus, FileSystem, Stream, StreamStatus,
    SvcClass, Tape, TapeCopy, TapeCopyForMigration, TapeCopyStatus, TapePool, TapeStatus,
};
use rusqlite::{params, Connection, OptionalExtension};
use stager_lib::{StagerError, StagerResult};
use std::collections::HashSet;
use std::sync::Arc;

/// How an in-memory stream set differs from the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamsDiff {
    pub added: Vec<CatalogId>,
    pub removed: Vec<CatalogId>,
    pub refreshed: Vec<CatalogId>,
}

fn load_stream(conn: &Connection, id: CatalogId) -> StagerResult<Option<Stream>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM stream s JOIN tape_pool tp ON tp.id = s.tape_pool WHERE s.id = ?1",
            Stream::JOINED_COLUMNS
        ),
        params![id],
        Stream::from_row,
    )
    .optional()
    .map_err(map_db_err)
}

fn set_stream_status(conn: &Connection, id: CatalogId, status: StreamStatus) -> StagerResult<()> {
    conn.execute(
        "UPDATE stream SET status = ?1 WHERE id = ?2",
        params![status, id],
    )
    .map_err(map_db_err)?;
    Ok(())
}

fn streams_of_tape_copy(conn: &Connection, tape_copy: CatalogId) -> StagerResult<Vec<CatalogId>> {
    let mut stmt = conn
        .prepare("SELECT stream FROM stream_tape_copy WHERE tape_copy = ?1 ORDER BY stream")
        .map_err(map_db_err)?;
    let rows = stmt
        .query_map(params![tape_copy], |row| row.get(0))
        .map_err(map_db_err)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
}

/// Deletes those of `streams` that no longer hold any tape copy.
fn retire_drained_streams(conn: &Connection, streams: &[CatalogId]) -> StagerResult<usize> {
    let mut retired = 0;
    for stream in streams {
        retired += conn
            .execute(
                "DELETE FROM stream WHERE id = ?1
                 AND NOT EXISTS (SELECT 1 FROM stream_tape_copy WHERE stream = ?1)",
                params![stream],
            )
            .map_err(map_db_err)?;
    }
    Ok(retired)
}

/// Loads the tape copy a mover reported on; it must still be SELECTED.
fn selected_tape_copy(conn: &Connection, id: CatalogId) -> StagerResult<Option<TapeCopy>> {
    let Some(tc) = load_tape_copy(conn, id)? else {
        return Ok(None);
    };
    if tc.status != TapeCopyStatus::Selected {
        return Err(StagerError::InvalidState(format!(
            "tape copy {} is {}, not SELECTED",
            tc.id, tc.status
        )));
    }
    Ok(Some(tc))
}

struct MigrationCandidate {
    file_system: FileSystem,
    server_status: DiskServerStatus,
    job: TapeCopyForMigration,
}

const CANDIDATE_SQL: &str = "SELECT fs.id, fs.mount_point, fs.disk_server, ds.name, fs.disk_pool,
        fs.free_space, fs.weight, fs.fs_deviation, fs.status, ds.status,
        tc.id, tc.copy_nb, tc.status, tc.castor_file, dc.id, dc.path,
        cf.id, cf.file_id, cf.ns_host, cf.file_size, cf.svc_class, cf.file_class
    FROM stream_tape_copy stc
    JOIN tape_copy tc ON tc.id = stc.tape_copy
    JOIN disk_copy dc ON dc.castor_file = tc.castor_file
    JOIN file_system fs ON fs.id = dc.file_system
    JOIN disk_server ds ON ds.id = fs.disk_server
    JOIN castor_file cf ON cf.id = tc.castor_file
    WHERE stc.stream = ?1 AND tc.status = ?2 AND dc.status = ?3
    ORDER BY tc.id, dc.id";

fn migration_candidates(conn: &Connection, stream: CatalogId) -> StagerResult<Vec<MigrationCandidate>> {
    let mut stmt = conn.prepare(CANDIDATE_SQL).map_err(map_db_err)?;
    let rows = stmt
        .query_map(
            params![stream, TapeCopyStatus::WaitInStreams, DiskCopyStatus::CanBeMigr],
            |row| {
                let file_system = FileSystem::from_row(row)?;
                let tape_copy = TapeCopy {
                    id: row.get(10)?,
                    copy_nb: row.get(11)?,
                    status: row.get(12)?,
                    castor_file: row.get(13)?,
                };
                let castor_file = CastorFile {
                    id: row.get(16)?,
                    file_id: row.get(17)?,
                    ns_host: row.get(18)?,
                    size: row.get(19)?,
                    svc_class: row.get(20)?,
                    file_class: row.get(21)?,
                };
                Ok(MigrationCandidate {
                    server_status: row.get(9)?,
                    job: TapeCopyForMigration {
                        tape_copy,
                        disk_copy_id: row.get(14)?,
                        disk_copy_path: row.get(15)?,
                        disk_server: file_system.disk_server_name.clone(),
                        mount_point: file_system.mount_point.clone(),
                        castor_file,
                    },
                    file_system,
                })
            },
        )
        .map_err(map_db_err)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
}

pub struct MigrationOrchestrator {
    pool: Arc<CatalogPool>,
    placement: Arc<dyn PlacementPolicy>,
    max_retries: u32,
}

impl MigrationOrchestrator {
    pub fn new(pool: Arc<CatalogPool>, placement: Arc<dyn PlacementPolicy>, max_retries: u32) -> Self {
        Self {
            pool,
            placement,
            max_retries,
        }
    }

    /// PENDING tapes, now WAITVDQM.
    pub async fn tapes_to_do(&self) -> StagerResult<Vec<Tape>> {
        let tapes = self
            .pool
            .transact(|conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "UPDATE tape SET status = ?1 WHERE status = ?2 RETURNING {}",
                        Tape::COLUMNS
                    ))
                    .map_err(map_db_err)?;
                let rows = stmt
                    .query_map(params![TapeStatus::WaitVdqm, TapeStatus::Pending], Tape::from_row)
                    .map_err(map_db_err)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
            })
            .await?;
        if !tapes.is_empty() {
            debug!("tapes to do: count={}", tapes.len());
        }
        Ok(tapes)
    }

    /// PENDING streams, now WAITDRIVE.
    pub async fn streams_to_do(&self) -> StagerResult<Vec<Stream>> {
        let streams = self
            .pool
            .transact(|conn| {
                let ids = {
                    let mut stmt = conn
                        .prepare("UPDATE stream SET status = ?1 WHERE status = ?2 RETURNING id")
                        .map_err(map_db_err)?;
                    let rows = stmt
                        .query_map(
                            params![StreamStatus::WaitDrive, StreamStatus::Pending],
                            |row| row.get::<_, CatalogId>(0),
                        )
                        .map_err(map_db_err)?;
                    rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)?
                };
                let mut streams = Vec::with_capacity(ids.len());
                for id in ids {
                    let stream = load_stream(conn, id)?.ok_or_else(|| {
                        StagerError::Internal(format!("stream {} has no tape pool", id))
                    })?;
                    streams.push(stream);
                }
                streams.sort_by_key(|s| s.id);
                Ok(streams)
            })
            .await?;
        if !streams.is_empty() {
            debug!("streams to do: count={}", streams.len());
        }
        Ok(streams)
    }

    /// Moves the class's TOBEMIGRATED tape copies into streams of its tape pools,
    /// opening streams up to the class's drive count.
    pub async fn select_tape_copies_for_migration(
        &self,
        svc_class: &SvcClass,
    ) -> StagerResult<Vec<TapeCopy>> {
        if svc_class.tape_pools.is_empty() {
            debug!("svc class has no tape pool, nothing to migrate: svc_class={}", svc_class.name);
            return Ok(Vec::new());
        }
        let class_id = svc_class.id;
        let tape_pools = svc_class.tape_pools.clone();
        let nb_streams = svc_class.nb_drives.max(1) as usize;
        let copies = self
            .pool
            .transact(move |conn| {
                let copies = {
                    let mut stmt = conn
                        .prepare(&format!(
                            "UPDATE tape_copy SET status = ?1 WHERE status = ?2 AND castor_file IN
                                (SELECT id FROM castor_file WHERE svc_class = ?3)
                             RETURNING {}",
                            TapeCopy::COLUMNS
                        ))
                        .map_err(map_db_err)?;
                    let rows = stmt
                        .query_map(
                            params![TapeCopyStatus::WaitInStreams, TapeCopyStatus::ToBeMigrated, class_id],
                            TapeCopy::from_row,
                        )
                        .map_err(map_db_err)?;
                    rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)?
                };
                if copies.is_empty() {
                    return Ok(copies);
                }

                let mut total: u64 = 0;
                for tc in copies.iter() {
                    let size: u64 = conn
                        .query_row(
                            "SELECT file_size FROM castor_file WHERE id = ?1",
                            params![tc.castor_file],
                            |row| row.get(0),
                        )
                        .map_err(map_db_err)?;
                    total += size;
                }

                for tape_pool in tape_pools.iter() {
                    let existing = load_streams_of_pool(conn, *tape_pool)?;
                    for _ in existing.len()..nb_streams {
                        conn.execute(
                            "INSERT INTO stream (tape_pool, initial_size_to_transfer, status)
                             VALUES (?1, ?2, ?3)",
                            params![tape_pool, total, StreamStatus::Pending],
                        )
                        .map_err(map_db_err)?;
                        debug!(
                            "stream created: stream_id={}, tape_pool={}, size={}",
                            conn.last_insert_rowid(),
                            tape_pool,
                            total
                        );
                    }
                    for tc in copies.iter() {
                        conn.execute(
                            "INSERT OR IGNORE INTO stream_tape_copy (stream, tape_copy)
                             SELECT id, ?1 FROM stream WHERE tape_pool = ?2",
                            params![tc.id, tape_pool],
                        )
                        .map_err(map_db_err)?;
                    }
                }
                Ok(copies)
            })
            .await?;
        if !copies.is_empty() {
            info!(
                "tape copies selected for migration: svc_class={}, count={}",
                svc_class.name,
                copies.len()
            );
        }
        Ok(copies)
    }

    pub async fn any_tape_copy_for_stream(&self, stream: &Stream) -> StagerResult<bool> {
        let stream_id = stream.id;
        self.pool
            .transact(move |conn| {
                let count: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM stream_tape_copy stc
                         JOIN tape_copy tc ON tc.id = stc.tape_copy
                         WHERE stc.stream = ?1 AND tc.status = ?2",
                        params![stream_id, TapeCopyStatus::WaitInStreams],
                        |row| row.get(0),
                    )
                    .map_err(map_db_err)?;
                if count > 0 {
                    set_stream_status(conn, stream_id, StreamStatus::WaitMount)?;
                }
                Ok(count > 0)
            })
            .await
    }

    /// Next tape copy a running stream should write. `None` when the stream is drained.
    pub async fn best_tape_copy_for_stream(
        &self,
        stream: &Stream,
    ) -> StagerResult<Option<TapeCopyForMigration>> {
        let stream_id = stream.id;
        let placement = self.placement.clone();
        let chosen = self
            .pool
            .transact(move |conn| {
                let candidates = migration_candidates(conn, stream_id)?;
                let best = pick_best(candidates.into_iter().map(|c| {
                    let score = if is_schedulable(c.file_system.status, c.server_status) {
                        let size = c.job.castor_file.size;
                        placement.score_source(&PlacementCandidate::from_file_system(&c.file_system, size))
                    } else {
                        None
                    };
                    (c.job, score)
                }));
                let Some(mut job) = best else {
                    return Ok(None);
                };
                let n = conn
                    .execute(
                        "UPDATE tape_copy SET status = ?1 WHERE id = ?2 AND status = ?3",
                        params![TapeCopyStatus::Selected, job.tape_copy.id, TapeCopyStatus::WaitInStreams],
                    )
                    .map_err(map_db_err)?;
                if n != 1 {
                    return Err(StagerError::Internal(format!(
                        "tape copy {} changed status while selected",
                        job.tape_copy.id
                    )));
                }
                job.tape_copy.status = TapeCopyStatus::Selected;
                set_stream_status(conn, stream_id, StreamStatus::Running)?;
                Ok(Some(job))
            })
            .await?;
        match chosen.as_ref() {
            Some(job) => debug!(
                "tape copy for stream: stream_id={}, tape_copy_id={}, disk_server={}, path={}",
                stream_id, job.tape_copy.id, job.disk_server, job.disk_copy_path
            ),
            None => debug!("no tape copy left for stream: stream_id={}", stream_id),
        }
        Ok(chosen)
    }

    /// The tape copy is on tape. Its rows go away, and streams left empty are retired.
    /// Returns true when it was the file's last tape copy and the disk replica became STAGED.
    /// Reporting an already reconciled copy again is a no-op.
    pub async fn file_migrated(&self, tape_copy: &TapeCopy) -> StagerResult<bool> {
        let tape_copy_id = tape_copy.id;
        let outcome = self
            .pool
            .transact(move |conn| {
                let Some(tc) = selected_tape_copy(conn, tape_copy_id)? else {
                    return Ok(None);
                };
                let streams = streams_of_tape_copy(conn, tc.id)?;
                delete_tape_copy(conn, tc.id)?;
                let retired = retire_drained_streams(conn, &streams)?;

                let remaining: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM tape_copy WHERE castor_file = ?1",
                        params![tc.castor_file],
                        |row| row.get(0),
                    )
                    .map_err(map_db_err)?;
                let mut staged = false;
                if remaining == 0 {
                    let n = conn
                        .execute(
                            "UPDATE disk_copy SET status = ?1 WHERE castor_file = ?2 AND status = ?3",
                            params![DiskCopyStatus::Staged, tc.castor_file, DiskCopyStatus::CanBeMigr],
                        )
                        .map_err(map_db_err)?;
                    staged = n > 0;
                }
                Ok(Some((tc, staged, retired)))
            })
            .await?;

        let Some((tc, staged, retired)) = outcome else {
            debug!("file_migrated: tape copy already reconciled, tape_copy_id={}", tape_copy_id);
            return Ok(false);
        };
        info!(
            "file migrated: tape_copy_id={}, castor_file_id={}, copy_nb={}, staged={}, streams_retired={}",
            tc.id, tc.castor_file, tc.copy_nb, staged, retired
        );
        Ok(staged)
    }

    /// Writing the tape copy failed. It goes back to TOBEMIGRATED for the next selection
    /// pass, or to FAILED once it was retried `max_migration_retries` times.
    pub async fn file_migration_failed(
        &self,
        tape_copy: &TapeCopy,
        error_code: i32,
    ) -> StagerResult<Option<TapeCopyStatus>> {
        let tape_copy_id = tape_copy.id;
        let max_retries = self.max_retries;
        let outcome = self
            .pool
            .transact(move |conn| {
                let Some(tc) = selected_tape_copy(conn, tape_copy_id)? else {
                    return Ok(None);
                };
                let streams = streams_of_tape_copy(conn, tc.id)?;
                conn.execute(
                    "DELETE FROM stream_tape_copy WHERE tape_copy = ?1",
                    params![tc.id],
                )
                .map_err(map_db_err)?;
                let nb_retried: u32 = conn
                    .query_row(
                        "UPDATE tape_copy SET nb_retried = nb_retried + 1 WHERE id = ?1
                         RETURNING nb_retried",
                        params![tc.id],
                        |row| row.get(0),
                    )
                    .map_err(map_db_err)?;
                let next = if nb_retried > max_retries {
                    TapeCopyStatus::Failed
                } else {
                    TapeCopyStatus::ToBeMigrated
                };
                conn.execute(
                    "UPDATE tape_copy SET status = ?1 WHERE id = ?2",
                    params![next, tc.id],
                )
                .map_err(map_db_err)?;
                retire_drained_streams(conn, &streams)?;
                Ok(Some((tc, next, nb_retried)))
            })
            .await?;

        let Some((tc, next, nb_retried)) = outcome else {
            return Ok(None);
        };
        if next == TapeCopyStatus::Failed {
            error!(
                "file migration failed for good: tape_copy_id={}, castor_file_id={}, err_code={}, nb_retried={}",
                tc.id, tc.castor_file, error_code, nb_retried
            );
        } else {
            warn!(
                "file migration failed, will retry: tape_copy_id={}, castor_file_id={}, err_code={}, nb_retried={}",
                tc.id, tc.castor_file, error_code, nb_retried
            );
        }
        Ok(Some(next))
    }

    /// Aligns `tape_pool.streams` with the catalog and reports what changed.
    pub async fn streams_for_tape_pool(&self, tape_pool: &mut TapePool) -> StagerResult<StreamsDiff> {
        let pool_id = tape_pool.id;
        let current = self
            .pool
            .transact(move |conn| load_streams_of_pool(conn, pool_id))
            .await?;

        let known: HashSet<CatalogId> = tape_pool.streams.iter().map(|s| s.id).collect();
        let present: HashSet<CatalogId> = current.iter().map(|s| s.id).collect();
        let mut diff = StreamsDiff::default();
        for stream in tape_pool.streams.iter() {
            if !present.contains(&stream.id) {
                diff.removed.push(stream.id);
            }
        }
        for stream in current.iter() {
            if known.contains(&stream.id) {
                diff.refreshed.push(stream.id);
            } else {
                diff.added.push(stream.id);
            }
        }
        tape_pool.streams = current;
        Ok(diff)
    }

    /// Gives a stream's claimed tape copies back after a failed mount. Returns false when the
    /// stream had nothing left and was dropped.
    pub async fn reset_stream(&self, stream: &Stream) -> StagerResult<bool> {
        let stream_id = stream.id;
        let kept = self
            .pool
            .transact(move |conn| {
                conn.execute(
                    "UPDATE tape_copy SET status = ?1 WHERE status = ?2 AND id IN
                        (SELECT tape_copy FROM stream_tape_copy WHERE stream = ?3)",
                    params![TapeCopyStatus::WaitInStreams, TapeCopyStatus::Selected, stream_id],
                )
                .map_err(map_db_err)?;
                let remaining: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM stream_tape_copy stc
                         JOIN tape_copy tc ON tc.id = stc.tape_copy
                         WHERE stc.stream = ?1 AND tc.status = ?2",
                        params![stream_id, TapeCopyStatus::WaitInStreams],
                        |row| row.get(0),
                    )
                    .map_err(map_db_err)?;
                let kept = remaining > 0;
                if kept {
                    conn.execute(
                        "UPDATE stream SET status = ?1, tape = NULL WHERE id = ?2",
                        params![StreamStatus::Pending, stream_id],
                    )
                    .map_err(map_db_err)?;
                } else {
                    conn.execute(
                        "DELETE FROM stream_tape_copy WHERE stream = ?1",
                        params![stream_id],
                    )
                    .map_err(map_db_err)?;
                    conn.execute("DELETE FROM stream WHERE id = ?1", params![stream_id])
                        .map_err(map_db_err)?;
                }
                conn.execute(
                    "UPDATE tape_copy SET status = ?1 WHERE status = ?2 AND id NOT IN
                        (SELECT tape_copy FROM stream_tape_copy)",
                    params![TapeCopyStatus::ToBeMigrated, TapeCopyStatus::WaitInStreams],
                )
                .map_err(map_db_err)?;
                Ok(kept)
            })
            .await?;
        info!("stream reset: stream_id={}, kept={}", stream_id, kept);
        Ok(kept)
    }
}
