#[cfg(test)]
mod tests {
    use crate::catalog_db::map_db_err;
    use crate::test_util::{
        count_rows, create_test_catalog_with_mocks, disk_copy_status, insert_disk_copy_row,
        insert_request, insert_subrequest, insert_subrequest_with_id, load_sr, ns_segment,
        seed_file_class, seed_file_system, seed_migrating_class, seed_svc_class,
        subrequest_status, tape_copy_status, TEST_NS_HOST,
    };
    use crate::{
        CatalogId, DiskCopyStatus, RequestType, SegmentStatus, StagerSvc, SubRequestStatus,
        TapeCopy, TapeCopyStatus, TapeMode, TapeStatus,
    };
    use rusqlite::params;
    use stager_lib::{StagerError, TAPE_DISABLED};

    async fn load_tape_copies(svc: &StagerSvc, castor_file: CatalogId) -> Vec<TapeCopy> {
        svc.pool()
            .transact(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM tape_copy WHERE castor_file = ?1 ORDER BY id",
                        TapeCopy::COLUMNS
                    ))
                    .map_err(map_db_err)?;
                let rows = stmt
                    .query_map(params![castor_file], TapeCopy::from_row)
                    .map_err(map_db_err)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
            })
            .await
            .unwrap()
    }

    // ==================== Recall Scenarios ====================

    #[tokio::test]
    async fn test_get_cache_miss_recalls_then_serves() {
        let (svc, _dir, ns, _vmgr) = create_test_catalog_with_mocks().await;
        let class = seed_svc_class(svc.resources(), "default").await;
        seed_file_system(svc.resources(), "ds01", "/srv/fs1", 1 << 30, 1.0).await;
        let cf = svc
            .resources()
            .select_or_create_castor_file(1001, TEST_NS_HOST, Some(class.id), None, 3048)
            .await
            .unwrap();
        ns.set_segments(
            &cf,
            vec![ns_segment("T00001", 1, 1, 1000), ns_segment("T00001", 1, 2, 2048)],
        );
        let req = insert_request(svc.pool(), RequestType::Get).await;
        let sr_id = insert_subrequest(svc.pool(), req, Some(cf.id), "/data/x", SubRequestStatus::Start).await;

        let sr = svc
            .dispatcher()
            .claim_subrequest(&[RequestType::Get])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sr.id, sr_id);
        let fs = svc
            .resources()
            .best_file_system_for_job(class.id, cf.size)
            .await
            .unwrap()
            .unwrap();

        let result = svc.disk_copies().get_update_start(&sr, &fs).await.unwrap();
        assert!(result.disk_copy.is_none());
        assert!(result.sources.is_empty());
        let waiting = load_sr(svc.pool(), sr_id).await;
        assert_eq!(waiting.status, SubRequestStatus::WaitTapeRecall);
        let dc = waiting.disk_copy.unwrap();
        assert_eq!(disk_copy_status(svc.pool(), dc).await, Some(DiskCopyStatus::WaitTapeRecall));

        let tape_copies = load_tape_copies(&svc, cf.id).await;
        assert_eq!(tape_copies.len(), 1);
        assert_eq!(tape_copies[0].status, TapeCopyStatus::ToBeRecalled);
        assert_eq!(tape_copies[0].copy_nb, 1);

        // Mount side.
        let tape = svc
            .resources()
            .select_or_create_tape("T00001", 0, TapeMode::WriteDisable)
            .await
            .unwrap();
        assert_eq!(tape.status, TapeStatus::Pending);
        let claimed = svc.migration().tapes_to_do().await.unwrap();
        assert_eq!(claimed.len(), 1);
        let segments = svc.recall().segments_for_tape(&tape).await.unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].offset, 0);
        assert_eq!(segments[1].offset, 1000);
        let total: u64 = segments.iter().map(|s| s.bytes_in).sum();
        assert_eq!(total, 3048);
        assert!(segments.iter().all(|s| s.status == SegmentStatus::Selected));

        let target = svc
            .recall()
            .best_file_system_for_segment(&segments[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(target.disk_copy.id, dc);
        assert_eq!(target.mount_point, "/srv/fs1");
        assert!(target.full_path().starts_with("/srv/fs1/01/1001@nsA."));

        svc.recall().file_recalled(&tape_copies[0]).await.unwrap();
        assert_eq!(subrequest_status(svc.pool(), sr_id).await, Some(SubRequestStatus::Restart));
        assert_eq!(disk_copy_status(svc.pool(), dc).await, Some(DiskCopyStatus::Staged));
        assert_eq!(count_rows(svc.pool(), "tape_copy").await, 0);

        // The restarted SubRequest now hits the recalled replica.
        let sr = svc
            .dispatcher()
            .claim_subrequest(&[RequestType::Get])
            .await
            .unwrap()
            .unwrap();
        let result = svc.disk_copies().get_update_start(&sr, &fs).await.unwrap();
        assert_eq!(result.disk_copy.map(|d| d.id), Some(dc));
        assert_eq!(subrequest_status(svc.pool(), sr_id).await, Some(SubRequestStatus::Ready));
        svc.disk_copies().get_update_done(sr_id).await.unwrap();
        assert_eq!(subrequest_status(svc.pool(), sr_id).await, None);
    }

    #[tokio::test]
    async fn test_recall_picks_copy_without_disabled_tape() {
        let (svc, _dir, ns, vmgr) = create_test_catalog_with_mocks().await;
        let fs = seed_file_system(svc.resources(), "ds01", "/srv/fs1", 1 << 30, 1.0).await;
        let cf = svc
            .resources()
            .select_or_create_castor_file(1002, TEST_NS_HOST, None, None, 1500)
            .await
            .unwrap();
        vmgr.set_status("T00010", TAPE_DISABLED);
        ns.set_segments(
            &cf,
            vec![
                ns_segment("T00011", 1, 1, 500),
                ns_segment("T00010", 1, 2, 1000),
                ns_segment("T00020", 2, 3, 1500),
            ],
        );
        let req = insert_request(svc.pool(), RequestType::Get).await;
        let sr_id = insert_subrequest(svc.pool(), req, Some(cf.id), "/data/y", SubRequestStatus::WaitSched).await;
        let sr = load_sr(svc.pool(), sr_id).await;

        svc.disk_copies().get_update_start(&sr, &fs).await.unwrap();
        let tape_copies = load_tape_copies(&svc, cf.id).await;
        assert_eq!(tape_copies.len(), 1);
        assert_eq!(tape_copies[0].copy_nb, 2);
        // No segment references a tape of copy 1.
        let vids: Vec<String> = svc
            .pool()
            .transact(|conn| {
                let mut stmt = conn
                    .prepare("SELECT t.vid FROM segment s JOIN tape t ON t.id = s.tape")
                    .map_err(map_db_err)?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(map_db_err)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
            })
            .await
            .unwrap();
        assert_eq!(vids, vec!["T00020".to_string()]);
    }

    #[tokio::test]
    async fn test_no_valid_copy_fails_subrequest_and_leaves_no_rows() {
        let (svc, _dir, ns, vmgr) = create_test_catalog_with_mocks().await;
        let fs = seed_file_system(svc.resources(), "ds01", "/srv/fs1", 1 << 30, 1.0).await;
        let cf = svc
            .resources()
            .select_or_create_castor_file(1003, TEST_NS_HOST, None, None, 1000)
            .await
            .unwrap();
        vmgr.set_status("T00030", TAPE_DISABLED);
        let mut bad = ns_segment("T00031", 2, 2, 1000);
        bad.status = stager_lib::NsSegmentStatus::NotOk;
        ns.set_segments(&cf, vec![ns_segment("T00030", 1, 1, 1000), bad]);
        let req = insert_request(svc.pool(), RequestType::Get).await;
        let sr_id = insert_subrequest(svc.pool(), req, Some(cf.id), "/data/z", SubRequestStatus::WaitSched).await;
        let sr = load_sr(svc.pool(), sr_id).await;

        let err = svc.disk_copies().get_update_start(&sr, &fs).await.unwrap_err();
        assert!(matches!(err, StagerError::NoValidCopy(_)));
        assert_eq!(count_rows(svc.pool(), "tape_copy").await, 0);
        assert_eq!(count_rows(svc.pool(), "segment").await, 0);
        assert_eq!(count_rows(svc.pool(), "tape").await, 0);

        let failed = load_sr(svc.pool(), sr_id).await;
        assert_eq!(failed.status, SubRequestStatus::Failed);
        assert_eq!(failed.error_code, libc::ENODATA);
        let dc = failed.disk_copy.unwrap();
        assert_eq!(disk_copy_status(svc.pool(), dc).await, Some(DiskCopyStatus::Failed));

        // Other recalls keep going.
        let other = svc
            .resources()
            .select_or_create_castor_file(1004, TEST_NS_HOST, None, None, 10)
            .await
            .unwrap();
        ns.set_segments(&other, vec![ns_segment("T00032", 1, 1, 10)]);
        let sr2 = insert_subrequest(svc.pool(), req, Some(other.id), "/data/w", SubRequestStatus::WaitSched).await;
        let sr2 = load_sr(svc.pool(), sr2).await;
        svc.disk_copies().get_update_start(&sr2, &fs).await.unwrap();
        assert_eq!(count_rows(svc.pool(), "tape_copy").await, 1);
    }

    // ==================== Terminal Transitions ====================

    #[tokio::test]
    async fn test_get_update_done_twice_is_a_no_op() {
        let (svc, _dir, _ns, _vmgr) = create_test_catalog_with_mocks().await;
        let fs = seed_file_system(svc.resources(), "ds01", "/srv/fs1", 1 << 30, 1.0).await;
        let cf = svc
            .resources()
            .select_or_create_castor_file(1005, TEST_NS_HOST, None, None, 10)
            .await
            .unwrap();
        insert_disk_copy_row(svc.pool(), cf.id, Some(fs.id), DiskCopyStatus::Staged).await;
        let req = insert_request(svc.pool(), RequestType::Get).await;
        insert_subrequest_with_id(svc.pool(), 42, req, Some(cf.id), "/data/x", SubRequestStatus::Ready).await;
        let sibling = insert_subrequest(svc.pool(), req, Some(cf.id), "/data/x2", SubRequestStatus::Ready).await;

        svc.disk_copies().get_update_done(42).await.unwrap();
        assert_eq!(subrequest_status(svc.pool(), 42).await, Some(SubRequestStatus::Finished));
        svc.disk_copies().get_update_done(42).await.unwrap();
        assert_eq!(subrequest_status(svc.pool(), 42).await, Some(SubRequestStatus::Finished));

        // Closing the last one cleans the whole request up, and repeating stays harmless.
        svc.disk_copies().get_update_done(sibling).await.unwrap();
        assert_eq!(subrequest_status(svc.pool(), 42).await, None);
        svc.disk_copies().get_update_done(42).await.unwrap();
        svc.disk_copies().get_update_done(sibling).await.unwrap();
    }

    // ==================== Garbage Collection ====================

    #[tokio::test]
    async fn test_gc_namespace_failure_does_not_undo_catalog_cleanup() {
        let (svc, _dir, ns, _vmgr) = create_test_catalog_with_mocks().await;
        let fs = seed_file_system(svc.resources(), "ds01", "/srv/fs1", 1 << 30, 1.0).await;
        let disk_only = seed_file_class(svc.resources(), "disk_only", 0).await;
        let mut files = Vec::new();
        for file_id in [2001u64, 2002] {
            let cf = svc
                .resources()
                .select_or_create_castor_file(file_id, TEST_NS_HOST, None, Some(disk_only.id), 10)
                .await
                .unwrap();
            ns.add_file(&cf.ns_file_id());
            insert_disk_copy_row(svc.pool(), cf.id, Some(fs.id), DiskCopyStatus::GcCandidate).await;
            files.push(cf);
        }
        ns.fail_delete_of(&files[0].ns_file_id());

        let claimed = svc.gc().select_files2delete("ds01").await.unwrap();
        assert_eq!(claimed.len(), 2);
        let ids: Vec<CatalogId> = claimed.iter().map(|f| f.disk_copy_id).collect();

        let report = svc.gc().files_deleted(&ids).await.unwrap();
        assert_eq!(report.removed, 2);
        assert_eq!(report.ns_deleted, 1);
        assert_eq!(report.ns_failed, 1);
        assert_eq!(disk_copy_status(svc.pool(), ids[0]).await, None);
        assert_eq!(disk_copy_status(svc.pool(), ids[1]).await, None);
        assert!(ns.exists(&files[0].ns_file_id()));
        assert!(!ns.exists(&files[1].ns_file_id()));
        // CastorFile rows are never removed here.
        assert_eq!(count_rows(svc.pool(), "castor_file").await, 2);
    }

    #[tokio::test]
    async fn test_gc_treats_vanished_namespace_entry_as_deleted() {
        let (svc, _dir, _ns, _vmgr) = create_test_catalog_with_mocks().await;
        let fs = seed_file_system(svc.resources(), "ds01", "/srv/fs1", 1 << 30, 1.0).await;
        let disk_only = seed_file_class(svc.resources(), "disk_only", 0).await;
        let cf = svc
            .resources()
            .select_or_create_castor_file(2003, TEST_NS_HOST, None, Some(disk_only.id), 10)
            .await
            .unwrap();
        let dc = insert_disk_copy_row(svc.pool(), cf.id, Some(fs.id), DiskCopyStatus::BeingDeleted).await;
        let report = svc.gc().files_deleted(&[dc]).await.unwrap();
        assert_eq!(report.ns_deleted, 1);
        assert_eq!(report.ns_failed, 0);
    }

    // ==================== Write And Migration ====================

    #[tokio::test]
    async fn test_put_then_migrate() {
        let (svc, _dir, ns, _vmgr) = create_test_catalog_with_mocks().await;
        let class = seed_migrating_class(svc.resources(), "migr", 1).await;
        seed_file_system(svc.resources(), "ds01", "/srv/fs1", 1 << 30, 1.0).await;
        let cf = svc
            .resources()
            .select_or_create_castor_file(3001, TEST_NS_HOST, Some(class.id), None, 0)
            .await
            .unwrap();
        let req = insert_request(svc.pool(), RequestType::Put).await;
        let sr_id = insert_subrequest(svc.pool(), req, Some(cf.id), "/data/new", SubRequestStatus::Start).await;

        let sr = svc
            .dispatcher()
            .claim_subrequest(&[RequestType::Put, RequestType::PrepareToPut])
            .await
            .unwrap()
            .unwrap();
        let fs = svc
            .resources()
            .best_file_system_for_job(class.id, 4096)
            .await
            .unwrap()
            .unwrap();
        let dc = svc.disk_copies().put_start(&sr, &fs).await.unwrap();
        assert_eq!(dc.status, DiskCopyStatus::StageOut);

        svc.disk_copies().prepare_for_migration(&sr, 4096).await.unwrap();
        assert_eq!(ns.size_of(&cf.ns_file_id()), Some(4096));
        assert_eq!(subrequest_status(svc.pool(), sr_id).await, None);
        let copies = load_tape_copies(&svc, cf.id).await;
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].status, TapeCopyStatus::ToBeMigrated);

        let selected = svc
            .migration()
            .select_tape_copies_for_migration(&class)
            .await
            .unwrap();
        assert_eq!(selected.len(), 1);
        let streams = svc.migration().streams_to_do().await.unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].tape_pool_name, "migr_tp");
        assert!(svc.migration().any_tape_copy_for_stream(&streams[0]).await.unwrap());
        let job = svc
            .migration()
            .best_tape_copy_for_stream(&streams[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.disk_copy_id, dc.id);
        assert_eq!(job.castor_file.size, 4096);
        assert_eq!(job.disk_copy_path, dc.path);
        assert_eq!(tape_copy_status(svc.pool(), copies[0].id).await, Some(TapeCopyStatus::Selected));

        // A new write generation is refused while the copy is on its way to tape.
        let req = insert_request(svc.pool(), RequestType::Put).await;
        let sr2 = insert_subrequest(svc.pool(), req, Some(cf.id), "/data/new", SubRequestStatus::WaitSched).await;
        let sr2 = load_sr(svc.pool(), sr2).await;
        let err = svc.disk_copies().put_start(&sr2, &fs).await.unwrap_err();
        assert!(err.is_resource_unavailable());

        // The mover reports the copy on tape: the replica is STAGED and the stream retired.
        assert!(svc.migration().file_migrated(&job.tape_copy).await.unwrap());
        assert_eq!(disk_copy_status(svc.pool(), dc.id).await, Some(DiskCopyStatus::Staged));
        assert!(load_tape_copies(&svc, cf.id).await.is_empty());
        assert_eq!(count_rows(svc.pool(), "stream").await, 0);

        // Now the file can be rewritten and migrated again.
        let req = insert_request(svc.pool(), RequestType::Put).await;
        let sr3 = insert_subrequest(svc.pool(), req, Some(cf.id), "/data/new", SubRequestStatus::WaitSched).await;
        let sr3 = load_sr(svc.pool(), sr3).await;
        let dc3 = svc.disk_copies().put_start(&sr3, &fs).await.unwrap();
        assert_ne!(dc3.id, dc.id);
        assert_eq!(dc3.status, DiskCopyStatus::StageOut);
        assert_eq!(disk_copy_status(svc.pool(), dc.id).await, Some(DiskCopyStatus::GcCandidate));

        svc.disk_copies().prepare_for_migration(&sr3, 8192).await.unwrap();
        assert_eq!(ns.size_of(&cf.ns_file_id()), Some(8192));
        let copies = load_tape_copies(&svc, cf.id).await;
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].status, TapeCopyStatus::ToBeMigrated);
        assert_eq!(disk_copy_status(svc.pool(), dc3.id).await, Some(DiskCopyStatus::CanBeMigr));
    }

    #[tokio::test]
    async fn test_request_level_rm_through_dispatcher() {
        let (svc, _dir, _ns, _vmgr) = create_test_catalog_with_mocks().await;
        let fs = seed_file_system(svc.resources(), "ds01", "/srv/fs1", 1 << 30, 1.0).await;
        let cf = svc
            .resources()
            .select_or_create_castor_file(4001, TEST_NS_HOST, None, None, 10)
            .await
            .unwrap();
        let dc = insert_disk_copy_row(svc.pool(), cf.id, Some(fs.id), DiskCopyStatus::Staged).await;
        let req = insert_request(svc.pool(), RequestType::Rm).await;
        insert_subrequest(svc.pool(), req, Some(cf.id), "/data/x", SubRequestStatus::Start).await;
        insert_subrequest(svc.pool(), req, None, "/data/unknown", SubRequestStatus::Start).await;

        let request = svc
            .dispatcher()
            .claim_request(&[RequestType::Rm])
            .await
            .unwrap()
            .unwrap();
        let outcome = svc.dispatcher().process_request(&request).await.unwrap();
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(disk_copy_status(svc.pool(), dc).await, Some(DiskCopyStatus::GcCandidate));
    }

    #[tokio::test]
    async fn test_tape_pending_only_once_for_two_files() {
        let (svc, _dir, ns, _vmgr) = create_test_catalog_with_mocks().await;
        for file_id in [5001u64, 5002] {
            let cf = svc
                .resources()
                .select_or_create_castor_file(file_id, TEST_NS_HOST, None, None, 100)
                .await
                .unwrap();
            ns.set_segments(&cf, vec![ns_segment("T00050", 1, file_id as u32, 100)]);
            svc.recall()
                .create_tape_copy_segments_for_recall(&cf)
                .await
                .unwrap();
        }
        assert_eq!(count_rows(svc.pool(), "tape").await, 1);
        let tapes = svc.migration().tapes_to_do().await.unwrap();
        assert_eq!(tapes.len(), 1);
        let tape = &tapes[0];
        assert_eq!(svc.recall().any_segments_for_tape(tape).await.unwrap(), 2);
    }
}
