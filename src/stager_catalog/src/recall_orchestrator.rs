use crate::catalog_db::{map_db_err, unix_timestamp, CatalogPool};
use crate::disk_copy_mgr::build_disk_copy_path;
use crate::placement_policy::{pick_best, PlacementCandidate, PlacementPolicy};
use crate::request_dispatcher::wake_waiting_subrequests;
use crate::resource_catalog::{load_castor_file, schedulable_file_systems, select_or_create_tape_in};
use crate::stager_svc::ExternalServices;
use crate::{
    CastorFile, CatalogId, DiskCopy, DiskCopyForRecall, DiskCopyStatus, RecallCopy, Segment,
    SegmentStatus, SubRequestStatus, Tape, TapeCopy, TapeCopyStatus, TapeMode, TapeStatus,
};
use rusqlite::{params, Connection, OptionalExtension};
use stager_lib::{NsSegment, StagerError, StagerResult};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Picks the lowest copy number whose segments are all usable and add up to the file size.
/// `segments` must already be in fseq order.
pub(crate) fn choose_recall_copy(
    segments: &[NsSegment],
    usable_tapes: &HashSet<(String, i32)>,
    file_size: u64,
) -> Option<(u32, Vec<NsSegment>)> {
    let mut rejected = HashSet::new();
    let mut copies: BTreeMap<u32, Vec<NsSegment>> = BTreeMap::new();
    for seg in segments {
        let usable = seg.is_ok() && usable_tapes.contains(&(seg.vid.clone(), seg.side));
        if !usable && rejected.insert(seg.copy_nb) {
            debug!(
                "recall: copy rejected, copy_nb={}, vid={}, fseq={}, status={:?}",
                seg.copy_nb, seg.vid, seg.fseq, seg.status
            );
        }
        copies.entry(seg.copy_nb).or_default().push(seg.clone());
    }

    for (copy_nb, segs) in copies {
        if rejected.contains(&copy_nb) {
            continue;
        }
        let total: u64 = segs.iter().map(|s| s.seg_size).sum();
        if total != file_size {
            warn!(
                "recall: copy rejected, segments do not cover the file: copy_nb={}, total={}, file_size={}",
                copy_nb, total, file_size
            );
            continue;
        }
        return Some((copy_nb, segs));
    }
    None
}

fn insert_recall_copy(
    conn: &Connection,
    castor_file: CatalogId,
    copy_nb: u32,
    segments: &[NsSegment],
) -> StagerResult<RecallCopy> {
    conn.execute(
        "INSERT INTO tape_copy (copy_nb, status, castor_file) VALUES (?1, ?2, ?3)",
        params![copy_nb, TapeCopyStatus::ToBeRecalled, castor_file],
    )
    .map_err(map_db_err)?;
    let tape_copy = TapeCopy {
        id: conn.last_insert_rowid() as CatalogId,
        copy_nb,
        status: TapeCopyStatus::ToBeRecalled,
        castor_file,
    };

    let mut created = Vec::with_capacity(segments.len());
    let mut offset = 0u64;
    for seg in segments {
        let tape = select_or_create_tape_in(conn, &seg.vid, seg.side, TapeMode::WriteDisable)?;
        if tape.status.is_idle() {
            conn.execute(
                "UPDATE tape SET status = ?1 WHERE id = ?2",
                params![TapeStatus::Pending, tape.id],
            )
            .map_err(map_db_err)?;
        }
        conn.execute(
            "INSERT INTO segment (tape_copy, tape, fseq, seg_offset, bytes_in, block_id, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                tape_copy.id,
                tape.id,
                seg.fseq,
                offset,
                seg.seg_size,
                seg.block_id.to_vec(),
                SegmentStatus::Unprocessed
            ],
        )
        .map_err(map_db_err)?;
        created.push(Segment {
            id: conn.last_insert_rowid() as CatalogId,
            tape_copy: tape_copy.id,
            tape: tape.id,
            fseq: seg.fseq,
            offset,
            bytes_in: seg.seg_size,
            block_id: seg.block_id,
            status: SegmentStatus::Unprocessed,
            error_code: 0,
        });
        offset += seg.seg_size;
    }
    Ok(RecallCopy {
        tape_copy,
        segments: created,
    })
}

pub(crate) fn load_tape_copy(conn: &Connection, id: CatalogId) -> StagerResult<Option<TapeCopy>> {
    conn.query_row(
        &format!("SELECT {} FROM tape_copy WHERE id = ?1", TapeCopy::COLUMNS),
        params![id],
        TapeCopy::from_row,
    )
    .optional()
    .map_err(map_db_err)
}

/// The disk copy a recall of this file writes into.
fn recall_target_of(conn: &Connection, castor_file: CatalogId) -> StagerResult<Option<DiskCopy>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM disk_copy WHERE castor_file = ?1 AND status = ?2 ORDER BY id LIMIT 1",
            DiskCopy::COLUMNS
        ),
        params![castor_file, DiskCopyStatus::WaitTapeRecall],
        DiskCopy::from_row,
    )
    .optional()
    .map_err(map_db_err)
}

pub(crate) fn delete_tape_copy(conn: &Connection, tape_copy: CatalogId) -> StagerResult<()> {
    conn.execute("DELETE FROM segment WHERE tape_copy = ?1", params![tape_copy])
        .map_err(map_db_err)?;
    conn.execute(
        "DELETE FROM stream_tape_copy WHERE tape_copy = ?1",
        params![tape_copy],
    )
    .map_err(map_db_err)?;
    conn.execute("DELETE FROM tape_copy WHERE id = ?1", params![tape_copy])
        .map_err(map_db_err)?;
    Ok(())
}

pub struct RecallOrchestrator {
    pool: Arc<CatalogPool>,
    ext: Arc<ExternalServices>,
    placement: Arc<dyn PlacementPolicy>,
}

impl RecallOrchestrator {
    pub fn new(
        pool: Arc<CatalogPool>,
        ext: Arc<ExternalServices>,
        placement: Arc<dyn PlacementPolicy>,
    ) -> Self {
        Self {
            pool,
            ext,
            placement,
        }
    }

    /// Builds the TapeCopy and Segment rows needed to read the file back from tape.
    /// Nothing is written when no copy is usable.
    pub async fn create_tape_copy_segments_for_recall(
        &self,
        castor_file: &CastorFile,
    ) -> StagerResult<RecallCopy> {
        let file = castor_file.ns_file_id();
        let mut segments = self
            .ext
            .call("get_segments", self.ext.name_server.get_segments(&file))
            .await?;
        segments.sort_by_key(|s| s.fseq);

        let mut usable_tapes = HashSet::new();
        let mut queried: HashMap<(String, i32), bool> = HashMap::new();
        for seg in segments.iter().filter(|s| s.is_ok()) {
            let key = (seg.vid.clone(), seg.side);
            if queried.contains_key(&key) {
                continue;
            }
            let usable = match self
                .ext
                .call(
                    "query_tape",
                    self.ext.volume_manager.query_tape(&seg.vid, seg.side),
                )
                .await
            {
                Ok(info) => info.can_recall(),
                Err(e) => {
                    warn!(
                        "recall: tape query failed, segment treated as invalid: vid={}, side={}, err_code={}, err={}",
                        seg.vid,
                        seg.side,
                        e.errno(),
                        e
                    );
                    false
                }
            };
            if usable {
                usable_tapes.insert(key.clone());
            }
            queried.insert(key, usable);
        }

        let Some((copy_nb, chosen)) = choose_recall_copy(&segments, &usable_tapes, castor_file.size)
        else {
            warn!(
                "recall: no valid tape copy, castor_file_id={}, file={}, nb_segments={}",
                castor_file.id,
                file,
                segments.len()
            );
            return Err(StagerError::NoValidCopy(format!(
                "castor_file={} file={}",
                castor_file.id, file
            )));
        };

        let cf_id = castor_file.id;
        let copy = self
            .pool
            .transact(move |conn| insert_recall_copy(conn, cf_id, copy_nb, &chosen))
            .await
            .map_err(|e| {
                error!(
                    "recall: catalog update rolled back, castor_file_id={}, err={}",
                    cf_id, e
                );
                StagerError::Internal(format!(
                    "creating recall copy for castor_file {} failed: {}",
                    cf_id, e
                ))
            })?;
        info!(
            "recall scheduled: castor_file_id={}, tape_copy_id={}, copy_nb={}, nb_segments={}",
            cf_id,
            copy.tape_copy.id,
            copy.tape_copy.copy_nb,
            copy.segments.len()
        );
        Ok(copy)
    }

    /// UNPROCESSED segments of a mounted tape, now SELECTED.
    pub async fn segments_for_tape(&self, tape: &Tape) -> StagerResult<Vec<Segment>> {
        let tape_id = tape.id;
        let mut segments = self
            .pool
            .transact(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "UPDATE segment SET status = ?1 WHERE tape = ?2 AND status = ?3 RETURNING {}",
                        Segment::COLUMNS
                    ))
                    .map_err(map_db_err)?;
                let rows = stmt
                    .query_map(
                        params![SegmentStatus::Selected, tape_id, SegmentStatus::Unprocessed],
                        Segment::from_row,
                    )
                    .map_err(map_db_err)?;
                let segments = rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)?;
                conn.execute(
                    "UPDATE tape SET status = ?1 WHERE id = ?2",
                    params![TapeStatus::Mounted, tape_id],
                )
                .map_err(map_db_err)?;
                Ok(segments)
            })
            .await?;
        segments.sort_by_key(|s| s.fseq);
        debug!("segments for tape: tape_id={}, count={}", tape_id, segments.len());
        Ok(segments)
    }

    pub async fn any_segments_for_tape(&self, tape: &Tape) -> StagerResult<u64> {
        let tape_id = tape.id;
        self.pool
            .transact(move |conn| {
                let count: u64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM segment WHERE tape = ?1 AND status = ?2",
                        params![tape_id, SegmentStatus::Unprocessed],
                        |row| row.get(0),
                    )
                    .map_err(map_db_err)?;
                if count > 0 {
                    conn.execute(
                        "UPDATE tape SET status = ?1 WHERE id = ?2",
                        params![TapeStatus::WaitMount, tape_id],
                    )
                    .map_err(map_db_err)?;
                }
                Ok(count)
            })
            .await
    }

    /// Where the bytes of `segment` land. Every segment of a file goes to the same filesystem.
    pub async fn best_file_system_for_segment(
        &self,
        segment: &Segment,
    ) -> StagerResult<Option<DiskCopyForRecall>> {
        let tape_copy_id = segment.tape_copy;
        let placement = self.placement.clone();
        self.pool
            .transact(move |conn| {
                let tape_copy = load_tape_copy(conn, tape_copy_id)?.ok_or_else(|| {
                    StagerError::Internal(format!("segment references missing tape copy {}", tape_copy_id))
                })?;
                let cf = load_castor_file(conn, tape_copy.castor_file)?.ok_or_else(|| {
                    StagerError::Internal(format!(
                        "tape copy {} references missing castor file {}",
                        tape_copy_id, tape_copy.castor_file
                    ))
                })?;
                let Some(mut dc) = recall_target_of(conn, cf.id)? else {
                    return Ok(None);
                };

                let candidates = schedulable_file_systems(conn, cf.svc_class)?;
                let chosen = match dc.file_system {
                    Some(fs_id) => candidates.into_iter().find(|fs| fs.id == fs_id),
                    None => pick_best(candidates.into_iter().map(|fs| {
                        let score = placement
                            .score_target(&PlacementCandidate::from_file_system(&fs, cf.size));
                        (fs, score)
                    })),
                };
                let Some(fs) = chosen else {
                    debug!(
                        "no filesystem for recall: castor_file_id={}, size={}",
                        cf.id, cf.size
                    );
                    return Ok(None);
                };

                if dc.file_system.is_none() {
                    if dc.path.is_empty() {
                        dc.path = build_disk_copy_path(&cf, dc.id);
                    }
                    conn.execute(
                        "UPDATE disk_copy SET file_system = ?1, path = ?2 WHERE id = ?3",
                        params![fs.id, dc.path, dc.id],
                    )
                    .map_err(map_db_err)?;
                    dc.file_system = Some(fs.id);
                }
                Ok(Some(DiskCopyForRecall {
                    disk_copy: dc,
                    fs_weight: fs.weight,
                    mount_point: fs.mount_point,
                    disk_server: fs.disk_server_name,
                }))
            })
            .await
    }

    /// The recall finished: DiskCopy STAGED, waiting SubRequests RESTART, tape copy dropped.
    pub async fn file_recalled(&self, tape_copy: &TapeCopy) -> StagerResult<()> {
        let tape_copy_id = tape_copy.id;
        let castor_file = tape_copy.castor_file;
        self.pool
            .transact(move |conn| {
                let Some(dc) = recall_target_of(conn, castor_file)? else {
                    error!(
                        "file_recalled: no disk copy waiting for recall, tape_copy_id={}, castor_file_id={}",
                        tape_copy_id, castor_file
                    );
                    return Err(StagerError::Internal(format!(
                        "castor file {} has no disk copy waiting for tape copy {}",
                        castor_file, tape_copy_id
                    )));
                };
                conn.execute(
                    "UPDATE disk_copy SET status = ?1 WHERE id = ?2",
                    params![DiskCopyStatus::Staged, dc.id],
                )
                .map_err(map_db_err)?;
                let owners = conn
                    .execute(
                        "UPDATE sub_request SET status = ?1, last_modification_time = ?2
                         WHERE disk_copy = ?3 AND status = ?4",
                        params![
                            SubRequestStatus::Restart,
                            unix_timestamp(),
                            dc.id,
                            SubRequestStatus::WaitTapeRecall
                        ],
                    )
                    .map_err(map_db_err)?;
                let waiters = wake_waiting_subrequests(conn, dc.id, SubRequestStatus::Restart, None)?;
                delete_tape_copy(conn, tape_copy_id)?;
                info!(
                    "file recalled: tape_copy_id={}, disk_copy_id={}, restarted={}",
                    tape_copy_id,
                    dc.id,
                    owners + waiters
                );
                Ok(())
            })
            .await
    }

    pub async fn file_recall_failed(&self, tape_copy: &TapeCopy) -> StagerResult<()> {
        let tape_copy_id = tape_copy.id;
        let castor_file = tape_copy.castor_file;
        let error_code = libc::EIO;
        self.pool
            .transact(move |conn| {
                let message = format!("recall of tape copy {} failed", tape_copy_id);
                if let Some(dc) = recall_target_of(conn, castor_file)? {
                    conn.execute(
                        "UPDATE disk_copy SET status = ?1 WHERE id = ?2",
                        params![DiskCopyStatus::Failed, dc.id],
                    )
                    .map_err(map_db_err)?;
                    conn.execute(
                        "UPDATE sub_request SET status = ?1, error_code = ?2, error_message = ?3,
                            last_modification_time = ?4
                         WHERE disk_copy = ?5 AND status = ?6",
                        params![
                            SubRequestStatus::Failed,
                            error_code,
                            message,
                            unix_timestamp(),
                            dc.id,
                            SubRequestStatus::WaitTapeRecall
                        ],
                    )
                    .map_err(map_db_err)?;
                    wake_waiting_subrequests(
                        conn,
                        dc.id,
                        SubRequestStatus::Failed,
                        Some((error_code, &message)),
                    )?;
                }
                conn.execute(
                    "UPDATE segment SET status = ?1, error_code = ?2 WHERE tape_copy = ?3",
                    params![SegmentStatus::Failed, error_code, tape_copy_id],
                )
                .map_err(map_db_err)?;
                conn.execute(
                    "UPDATE tape_copy SET status = ?1 WHERE id = ?2",
                    params![TapeCopyStatus::Failed, tape_copy_id],
                )
                .map_err(map_db_err)?;
                warn!(
                    "file recall failed: tape_copy_id={}, castor_file_id={}, err_code={}",
                    tape_copy_id, castor_file, error_code
                );
                Ok(())
            })
            .await
    }

    pub async fn failed_segments(&self) -> StagerResult<Vec<Segment>> {
        self.pool
            .transact(|conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM segment WHERE status = ?1 ORDER BY id",
                        Segment::COLUMNS
                    ))
                    .map_err(map_db_err)?;
                let rows = stmt
                    .query_map(params![SegmentStatus::Failed], Segment::from_row)
                    .map_err(map_db_err)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{
        count_rows, create_test_catalog_with_mocks, disk_copy_status, insert_disk_copy_row,
        ns_segment, seed_castor_file, seed_file_system, seed_svc_class,
    };
    use stager_lib::{NsSegmentStatus, TAPE_DISABLED};

    fn usable(vids: &[&str]) -> HashSet<(String, i32)> {
        vids.iter().map(|v| (v.to_string(), 0)).collect()
    }

    #[test]
    fn test_choose_rejects_whole_copy_on_one_bad_segment() {
        let segs = vec![
            ns_segment("T1", 1, 1, 500),
            ns_segment("T2", 2, 2, 1000),
            ns_segment("T1", 1, 3, 500),
            ns_segment("T3", 1, 4, 0),
        ];
        // T3 unusable: copy 1 is rejected even though its first segments were fine.
        let (copy_nb, chosen) = choose_recall_copy(&segs, &usable(&["T1", "T2"]), 1000).unwrap();
        assert_eq!(copy_nb, 2);
        assert_eq!(chosen.len(), 1);
    }

    #[test]
    fn test_choose_prefers_lowest_valid_copy() {
        // Name server order does not matter, copy 2 wins over copy 3.
        let segs = vec![
            ns_segment("T3", 3, 1, 1000),
            ns_segment("T2", 2, 5, 1000),
            ns_segment("T1", 1, 9, 1000),
        ];
        let (copy_nb, chosen) = choose_recall_copy(&segs, &usable(&["T2", "T3"]), 1000).unwrap();
        assert_eq!(copy_nb, 2);
        assert_eq!(chosen[0].vid, "T2");
    }

    #[test]
    fn test_choose_rejects_not_ok_status_and_size_mismatch() {
        let mut bad = ns_segment("T1", 1, 1, 1000);
        bad.status = NsSegmentStatus::NotOk;
        let short = ns_segment("T2", 2, 2, 999);
        assert!(choose_recall_copy(&[bad, short], &usable(&["T1", "T2"]), 1000).is_none());
        assert!(choose_recall_copy(&[], &usable(&[]), 0).is_none());
    }

    #[tokio::test]
    async fn test_recall_offsets_cover_file() {
        let (svc, _dir, ns, _vmgr) = create_test_catalog_with_mocks().await;
        let cf = seed_castor_file(svc.pool(), 10, 3048, None).await;
        ns.set_segments(
            &cf,
            vec![ns_segment("T00001", 1, 8, 2048), ns_segment("T00001", 1, 7, 1000)],
        );
        let copy = svc
            .recall()
            .create_tape_copy_segments_for_recall(&cf)
            .await
            .unwrap();
        assert_eq!(copy.tape_copy.status, TapeCopyStatus::ToBeRecalled);
        let offsets: Vec<u64> = copy.segments.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0, 1000]);
        let total: u64 = copy.segments.iter().map(|s| s.bytes_in).sum();
        assert_eq!(total, cf.size);
        assert_eq!(copy.segments[0].fseq, 7);

        let tape = svc
            .resources()
            .select_or_create_tape("T00001", 0, TapeMode::WriteDisable)
            .await
            .unwrap();
        assert_eq!(tape.status, TapeStatus::Pending);
        assert_eq!(count_rows(svc.pool(), "tape").await, 1);
    }

    #[tokio::test]
    async fn test_recall_skips_copy_on_disabled_tape() {
        let (svc, _dir, ns, vmgr) = create_test_catalog_with_mocks().await;
        let cf = seed_castor_file(svc.pool(), 11, 300, None).await;
        vmgr.set_status("TBAD01", TAPE_DISABLED);
        ns.set_segments(
            &cf,
            vec![
                ns_segment("TGOOD1", 1, 1, 100),
                ns_segment("TBAD01", 1, 2, 200),
                ns_segment("TGOOD2", 2, 3, 300),
            ],
        );
        let copy = svc
            .recall()
            .create_tape_copy_segments_for_recall(&cf)
            .await
            .unwrap();
        assert_eq!(copy.tape_copy.copy_nb, 2);
        assert_eq!(copy.segments.len(), 1);
        assert_eq!(count_rows(svc.pool(), "segment").await, 1);
        // Only the chosen copy's tape was bound.
        assert_eq!(count_rows(svc.pool(), "tape").await, 1);
    }

    #[tokio::test]
    async fn test_no_valid_copy_writes_nothing() {
        let (svc, _dir, ns, vmgr) = create_test_catalog_with_mocks().await;
        let cf = seed_castor_file(svc.pool(), 12, 200, None).await;
        vmgr.set_status("TBAD01", TAPE_DISABLED);
        vmgr.set_error("TERR01");
        ns.set_segments(
            &cf,
            vec![
                ns_segment("TGOOD1", 1, 1, 100),
                ns_segment("TBAD01", 1, 2, 100),
                ns_segment("TERR01", 2, 3, 200),
            ],
        );
        let err = svc
            .recall()
            .create_tape_copy_segments_for_recall(&cf)
            .await
            .unwrap_err();
        assert!(matches!(err, StagerError::NoValidCopy(_)));
        assert_eq!(count_rows(svc.pool(), "tape_copy").await, 0);
        assert_eq!(count_rows(svc.pool(), "segment").await, 0);
        assert_eq!(count_rows(svc.pool(), "tape").await, 0);
    }

    #[tokio::test]
    async fn test_name_server_failure_is_external_error() {
        let (svc, _dir, ns, _vmgr) = create_test_catalog_with_mocks().await;
        let cf = seed_castor_file(svc.pool(), 13, 200, None).await;
        ns.fail_get_segments(true);
        let err = svc
            .recall()
            .create_tape_copy_segments_for_recall(&cf)
            .await
            .unwrap_err();
        assert!(err.is_external());
        assert_eq!(count_rows(svc.pool(), "tape_copy").await, 0);
    }

    #[tokio::test]
    async fn test_mount_side_segment_flow() {
        let (svc, _dir, ns, _vmgr) = create_test_catalog_with_mocks().await;
        let class = seed_svc_class(svc.resources(), "default").await;
        let fs_small = seed_file_system(svc.resources(), "ds01", "/srv/small", 100, 5.0).await;
        let fs_big = seed_file_system(svc.resources(), "ds01", "/srv/big", 10_000, 1.0).await;
        let cf = seed_castor_file(svc.pool(), 20, 3000, Some(class.id)).await;
        let dc = insert_disk_copy_row(svc.pool(), cf.id, None, DiskCopyStatus::WaitTapeRecall).await;
        ns.set_segments(
            &cf,
            vec![ns_segment("T00009", 1, 1, 1000), ns_segment("T00009", 1, 2, 2000)],
        );
        let copy = svc
            .recall()
            .create_tape_copy_segments_for_recall(&cf)
            .await
            .unwrap();
        let tape = svc
            .resources()
            .select_or_create_tape("T00009", 0, TapeMode::WriteDisable)
            .await
            .unwrap();

        assert_eq!(svc.recall().any_segments_for_tape(&tape).await.unwrap(), 2);
        let segments = svc.recall().segments_for_tape(&tape).await.unwrap();
        assert_eq!(segments.len(), 2);
        assert!(segments.iter().all(|s| s.status == SegmentStatus::Selected));
        assert_eq!(svc.recall().any_segments_for_tape(&tape).await.unwrap(), 0);
        let mounted = svc
            .resources()
            .select_or_create_tape("T00009", 0, TapeMode::WriteDisable)
            .await
            .unwrap();
        assert_eq!(mounted.status, TapeStatus::Mounted);

        // The small filesystem has the higher weight but cannot hold the file.
        let target = svc
            .recall()
            .best_file_system_for_segment(&segments[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(target.disk_copy.id, dc);
        assert_eq!(target.mount_point, fs_big.mount_point);
        assert_ne!(target.mount_point, fs_small.mount_point);
        assert!(!target.disk_copy.path.is_empty());
        let again = svc
            .recall()
            .best_file_system_for_segment(&segments[1])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.disk_copy.file_system, Some(fs_big.id));

        svc.recall().file_recalled(&copy.tape_copy).await.unwrap();
        assert_eq!(disk_copy_status(svc.pool(), dc).await, Some(DiskCopyStatus::Staged));
        assert_eq!(count_rows(svc.pool(), "segment").await, 0);
        // The tape copy is gone once recalled.
        assert!(svc
            .recall()
            .best_file_system_for_segment(&segments[0])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_no_file_system_qualifies_returns_none() {
        let (svc, _dir, ns, _vmgr) = create_test_catalog_with_mocks().await;
        let class = seed_svc_class(svc.resources(), "default").await;
        seed_file_system(svc.resources(), "ds01", "/srv/small", 10, 1.0).await;
        let cf = seed_castor_file(svc.pool(), 21, 500, Some(class.id)).await;
        insert_disk_copy_row(svc.pool(), cf.id, None, DiskCopyStatus::WaitTapeRecall).await;
        ns.set_segments(&cf, vec![ns_segment("T00010", 1, 1, 500)]);
        let copy = svc
            .recall()
            .create_tape_copy_segments_for_recall(&cf)
            .await
            .unwrap();
        let target = svc
            .recall()
            .best_file_system_for_segment(&copy.segments[0])
            .await
            .unwrap();
        assert!(target.is_none());
    }

    #[tokio::test]
    async fn test_recall_failure_marks_everything_failed() {
        let (svc, _dir, ns, _vmgr) = create_test_catalog_with_mocks().await;
        let cf = seed_castor_file(svc.pool(), 22, 100, None).await;
        let dc = insert_disk_copy_row(svc.pool(), cf.id, None, DiskCopyStatus::WaitTapeRecall).await;
        ns.set_segments(&cf, vec![ns_segment("T00011", 1, 1, 100)]);
        let copy = svc
            .recall()
            .create_tape_copy_segments_for_recall(&cf)
            .await
            .unwrap();
        svc.recall().file_recall_failed(&copy.tape_copy).await.unwrap();

        let failed = svc.recall().failed_segments().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].tape_copy, copy.tape_copy.id);
        assert_eq!(disk_copy_status(svc.pool(), dc).await, Some(DiskCopyStatus::Failed));
        assert!(svc.recall().file_recalled(&copy.tape_copy).await.is_err());
    }

    #[tokio::test]
    async fn test_idle_tape_moves_to_pending_but_busy_tape_keeps_status() {
        let (svc, _dir, ns, _vmgr) = create_test_catalog_with_mocks().await;
        let mounted = svc
            .resources()
            .select_or_create_tape("T00012", 0, TapeMode::WriteDisable)
            .await
            .unwrap();
        svc.pool()
            .transact(move |conn| {
                conn.execute(
                    "UPDATE tape SET status = ?1 WHERE id = ?2",
                    params![TapeStatus::Mounted, mounted.id],
                )
                .map_err(map_db_err)
            })
            .await
            .unwrap();
        let cf = seed_castor_file(svc.pool(), 23, 100, None).await;
        ns.set_segments(&cf, vec![ns_segment("T00012", 1, 1, 100)]);
        svc.recall()
            .create_tape_copy_segments_for_recall(&cf)
            .await
            .unwrap();
        let tape = svc
            .resources()
            .select_or_create_tape("T00012", 0, TapeMode::WriteDisable)
            .await
            .unwrap();
        assert_eq!(tape.status, TapeStatus::Mounted);
    }
}
