use crate::catalog_db::{map_db_err, unix_timestamp, CatalogPool};
use crate::{
    CatalogId, DiskCopyMgr, RequestHeader, RequestType, StageRequest, SubRequest, SubRequestStatus,
};
use rusqlite::{params, Connection, OptionalExtension};
use stager_lib::{StagerError, StagerResult};
use std::sync::Arc;

/// SQL list of the SubRequest statuses that still need work from this engine.
pub(crate) fn active_subrequest_statuses() -> String {
    SubRequestStatus::ALL
        .iter()
        .filter(|st| st.is_active())
        .map(|st| st.code().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn type_list(types: &[RequestType]) -> String {
    types
        .iter()
        .map(|t| t.code().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn load_subrequest(conn: &Connection, id: CatalogId) -> StagerResult<Option<SubRequest>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM sub_request sr JOIN request r ON r.id = sr.request WHERE sr.id = ?1",
            SubRequest::JOINED_COLUMNS
        ),
        params![id],
        SubRequest::from_row,
    )
    .optional()
    .map_err(map_db_err)
}

pub(crate) fn subrequests_of_request(
    conn: &Connection,
    request: CatalogId,
) -> StagerResult<Vec<SubRequest>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM sub_request sr JOIN request r ON r.id = sr.request
             WHERE sr.request = ?1 ORDER BY sr.id",
            SubRequest::JOINED_COLUMNS
        ))
        .map_err(map_db_err)?;
    let rows = stmt
        .query_map(params![request], SubRequest::from_row)
        .map_err(map_db_err)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
}

pub(crate) fn set_subrequest_status(
    conn: &Connection,
    id: CatalogId,
    status: SubRequestStatus,
) -> StagerResult<usize> {
    conn.execute(
        "UPDATE sub_request SET status = ?1, last_modification_time = ?2 WHERE id = ?3",
        params![status, unix_timestamp(), id],
    )
    .map_err(map_db_err)
}

/// Records the failure cause. Archived or already failed rows are left alone.
pub(crate) fn fail_subrequest_in(
    conn: &Connection,
    id: CatalogId,
    error_code: i32,
    message: &str,
) -> StagerResult<bool> {
    let n = conn
        .execute(
            "UPDATE sub_request SET status = ?1, error_code = ?2, error_message = ?3,
                last_modification_time = ?4
             WHERE id = ?5 AND status NOT IN (?1, ?6, ?7)",
            params![
                SubRequestStatus::Failed,
                error_code,
                message,
                unix_timestamp(),
                id,
                SubRequestStatus::Finished,
                SubRequestStatus::FailedFinished
            ],
        )
        .map_err(map_db_err)?;
    Ok(n > 0)
}

/// Moves SubRequests parked on a disk copy to `status`.
pub(crate) fn wake_waiting_subrequests(
    conn: &Connection,
    disk_copy: CatalogId,
    status: SubRequestStatus,
    error: Option<(i32, &str)>,
) -> StagerResult<usize> {
    let (error_code, message) = match error {
        Some((code, msg)) => (code, Some(msg)),
        None => (0, None),
    };
    conn.execute(
        "UPDATE sub_request SET status = ?1, parent = NULL, error_code = ?2,
            error_message = ?3, last_modification_time = ?4
         WHERE disk_copy = ?5 AND status = ?6",
        params![
            status,
            error_code,
            message,
            unix_timestamp(),
            disk_copy,
            SubRequestStatus::WaitSubReq
        ],
    )
    .map_err(map_db_err)
}

/// Archives the SubRequest; the Request goes away with its last active SubRequest.
pub(crate) fn archive_subrequest_in(
    conn: &Connection,
    id: CatalogId,
    final_status: SubRequestStatus,
) -> StagerResult<bool> {
    let request: Option<CatalogId> = conn
        .query_row(
            "SELECT request FROM sub_request WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_db_err)?;
    let Some(request) = request else {
        return Ok(false);
    };
    set_subrequest_status(conn, id, final_status)?;

    let remaining: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sub_request WHERE request = ?1 AND status NOT IN (?2, ?3)",
            params![
                request,
                SubRequestStatus::Finished,
                SubRequestStatus::FailedFinished
            ],
            |row| row.get(0),
        )
        .map_err(map_db_err)?;
    if remaining == 0 {
        conn.execute("DELETE FROM sub_request WHERE request = ?1", params![request])
            .map_err(map_db_err)?;
        conn.execute("DELETE FROM request WHERE id = ?1", params![request])
            .map_err(map_db_err)?;
        conn.execute("DELETE FROM new_request WHERE id = ?1", params![request])
            .map_err(map_db_err)?;
        debug!("request archived: request_id={}, last_subreq_id={}", request, id);
    }
    Ok(true)
}

enum RequestClaim {
    Empty,
    Claimed(StageRequest),
    Malformed { id: CatalogId, req_type: Option<i64> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

pub struct RequestDispatcher {
    pool: Arc<CatalogPool>,
    disk_copies: Arc<DiskCopyMgr>,
}

impl RequestDispatcher {
    pub fn new(pool: Arc<CatalogPool>, disk_copies: Arc<DiskCopyMgr>) -> Self {
        Self { pool, disk_copies }
    }

    /// Claims one START/RESTART/RETRY SubRequest of the given types and moves it to WAITSCHED.
    pub async fn claim_subrequest(
        &self,
        candidate_types: &[RequestType],
    ) -> StagerResult<Option<SubRequest>> {
        if candidate_types.is_empty() {
            return Ok(None);
        }
        let sql = format!(
            "UPDATE sub_request SET status = {wait}, last_modification_time = ?1
             WHERE status IN ({start}, {restart}, {retry}) AND id =
                (SELECT sr.id FROM sub_request sr JOIN request r ON r.id = sr.request
                 WHERE sr.status IN ({start}, {restart}, {retry}) AND r.req_type IN ({types})
                 ORDER BY sr.priority DESC, sr.id LIMIT 1)
             RETURNING id",
            wait = SubRequestStatus::WaitSched.code(),
            start = SubRequestStatus::Start.code(),
            restart = SubRequestStatus::Restart.code(),
            retry = SubRequestStatus::Retry.code(),
            types = type_list(candidate_types),
        );
        let claimed = self
            .pool
            .transact(move |conn| {
                let id: Option<CatalogId> = conn
                    .query_row(&sql, params![unix_timestamp()], |row| row.get(0))
                    .optional()
                    .map_err(map_db_err)?;
                match id {
                    Some(id) => load_subrequest(conn, id),
                    None => Ok(None),
                }
            })
            .await?;
        if let Some(sr) = claimed.as_ref() {
            debug!(
                "subrequest claimed: subreq_id={}, request_id={}, type={}, file={}",
                sr.id, sr.request, sr.request_type, sr.file_name
            );
        }
        Ok(claimed)
    }

    /// Pops one Request of the given types from the request backlog.
    pub async fn claim_request(
        &self,
        candidate_types: &[RequestType],
    ) -> StagerResult<Option<StageRequest>> {
        if candidate_types.is_empty() {
            return Ok(None);
        }
        let sql = format!(
            "DELETE FROM new_request WHERE id =
                (SELECT id FROM new_request WHERE req_type IN ({}) ORDER BY id LIMIT 1)
             RETURNING id",
            type_list(candidate_types)
        );
        let claim = self
            .pool
            .transact(move |conn| {
                let id: Option<CatalogId> = conn
                    .query_row(&sql, [], |row| row.get(0))
                    .optional()
                    .map_err(map_db_err)?;
                let Some(id) = id else {
                    return Ok(RequestClaim::Empty);
                };
                load_stage_request(conn, id)
            })
            .await?;

        match claim {
            RequestClaim::Empty => Ok(None),
            RequestClaim::Claimed(req) => {
                debug!(
                    "request claimed: request_id={}, type={}",
                    req.header().id,
                    req.request_type()
                );
                Ok(Some(req))
            }
            RequestClaim::Malformed { id, req_type } => {
                error!(
                    "claim_request: malformed request skipped, request_id={}, req_type={:?}",
                    id, req_type
                );
                Err(StagerError::Internal(format!(
                    "request {} has unknown type {:?}",
                    id, req_type
                )))
            }
        }
    }

    /// Puts a SubRequest that could not be placed back in RETRY, or fails it past `max_retries`.
    pub async fn requeue_subrequest(
        &self,
        subreq_id: CatalogId,
        max_retries: u32,
    ) -> StagerResult<Option<SubRequestStatus>> {
        self.pool
            .transact(move |conn| {
                let Some(sr) = load_subrequest(conn, subreq_id)? else {
                    return Ok(None);
                };
                if sr.status != SubRequestStatus::WaitSched {
                    return Ok(Some(sr.status));
                }
                let retries = sr.retry_counter + 1;
                if retries > max_retries {
                    warn!(
                        "requeue: retries exhausted, subreq_id={}, retries={}, err_code={}",
                        subreq_id,
                        sr.retry_counter,
                        libc::ENOSPC
                    );
                    fail_subrequest_in(
                        conn,
                        subreq_id,
                        libc::ENOSPC,
                        "no filesystem available after retries",
                    )?;
                    return Ok(Some(SubRequestStatus::Failed));
                }
                conn.execute(
                    "UPDATE sub_request SET status = ?1, retry_counter = ?2,
                        last_modification_time = ?3 WHERE id = ?4",
                    params![SubRequestStatus::Retry, retries, unix_timestamp(), subreq_id],
                )
                .map_err(map_db_err)?;
                Ok(Some(SubRequestStatus::Retry))
            })
            .await
    }

    pub async fn fail_subrequest(
        &self,
        subreq_id: CatalogId,
        error_code: i32,
        message: &str,
    ) -> StagerResult<bool> {
        let message = message.to_string();
        warn!(
            "subrequest failed: subreq_id={}, err_code={}, msg={}",
            subreq_id, error_code, message
        );
        self.pool
            .transact(move |conn| fail_subrequest_in(conn, subreq_id, error_code, &message))
            .await
    }

    /// Sets the status and tells whether no other SubRequest of the Request is still active.
    pub async fn update_and_check_subrequest(
        &self,
        subreq_id: CatalogId,
        status: SubRequestStatus,
    ) -> StagerResult<bool> {
        self.pool
            .transact(move |conn| {
                let request: CatalogId = conn
                    .query_row(
                        "SELECT request FROM sub_request WHERE id = ?1",
                        params![subreq_id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(map_db_err)?
                    .ok_or_else(|| {
                        StagerError::InvalidParam(format!("unknown subrequest {}", subreq_id))
                    })?;
                set_subrequest_status(conn, subreq_id, status)?;
                let others: i64 = conn
                    .query_row(
                        &format!(
                            "SELECT COUNT(*) FROM sub_request WHERE request = ?1 AND id != ?2
                             AND status IN ({})",
                            active_subrequest_statuses()
                        ),
                        params![request, subreq_id],
                        |row| row.get(0),
                    )
                    .map_err(map_db_err)?;
                Ok(others == 0)
            })
            .await
    }

    pub async fn archive_subrequest(
        &self,
        subreq_id: CatalogId,
        final_status: SubRequestStatus,
    ) -> StagerResult<bool> {
        if !final_status.is_archived() {
            return Err(StagerError::InvalidParam(format!(
                "{} is not an archive status",
                final_status
            )));
        }
        self.pool
            .transact(move |conn| archive_subrequest_in(conn, subreq_id, final_status))
            .await
    }

    /// Runs a claimed request-level Request against each of its SubRequests.
    pub async fn process_request(&self, request: &StageRequest) -> StagerResult<RequestOutcome> {
        let request_id = request.header().id;
        let subrequests = self
            .pool
            .transact(move |conn| subrequests_of_request(conn, request_id))
            .await?;

        let mut outcome = RequestOutcome::default();
        for sr in subrequests {
            let done = match request {
                StageRequest::Rm(_) => self.disk_copies.stage_rm(sr.id).await,
                StageRequest::SetFileGcWeight { weight, .. } => {
                    self.disk_copies.set_file_gc_weight(sr.id, *weight).await
                }
                StageRequest::PutDone(_) => self.disk_copies.put_done_start(sr.id).await.map(|_| true),
                other => Err(StagerError::InvalidParam(format!(
                    "{} is not a request-level type",
                    other.request_type()
                ))),
            };
            match done {
                Ok(true) => outcome.succeeded += 1,
                Ok(false) => outcome.failed += 1,
                Err(e) => {
                    outcome.failed += 1;
                    warn!(
                        "process_request: subrequest failed, request_id={}, subreq_id={}, err_code={}, err={}",
                        request_id,
                        sr.id,
                        e.errno(),
                        e
                    );
                }
            }
        }
        info!(
            "request processed: request_id={}, type={}, succeeded={}, failed={}",
            request_id,
            request.request_type(),
            outcome.succeeded,
            outcome.failed
        );
        Ok(outcome)
    }
}

fn load_stage_request(conn: &Connection, id: CatalogId) -> StagerResult<RequestClaim> {
    let row = conn
        .query_row(
            "SELECT req_type, svc_class_name, euid, egid, client_host, client_port, user_tag,
                gc_weight, creation_time
             FROM request WHERE id = ?1",
            params![id],
            |row| {
                let req_type: i64 = row.get(0)?;
                let header = RequestHeader {
                    id,
                    svc_class_name: row.get(1)?,
                    euid: row.get(2)?,
                    egid: row.get(3)?,
                    client_host: row.get(4)?,
                    client_port: row.get(5)?,
                    user_tag: row.get(6)?,
                    creation_time: row.get(8)?,
                };
                let gc_weight: Option<f64> = row.get(7)?;
                Ok((req_type, header, gc_weight))
            },
        )
        .optional()
        .map_err(map_db_err)?;
    let Some((code, header, gc_weight)) = row else {
        return Ok(RequestClaim::Malformed { id, req_type: None });
    };
    match RequestType::from_code(code) {
        Some(req_type) => Ok(RequestClaim::Claimed(StageRequest::from_parts(
            req_type, header, gc_weight,
        ))),
        None => Ok(RequestClaim::Malformed {
            id,
            req_type: Some(code),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{create_test_catalog, insert_request, insert_subrequest, subrequest_status};

    #[test]
    fn test_active_statuses_follow_status_enum() {
        let list = active_subrequest_statuses();
        let codes: Vec<i64> = list.split(", ").map(|c| c.parse().unwrap()).collect();
        assert_eq!(codes.len(), 6);
        for st in SubRequestStatus::ALL {
            assert_eq!(codes.contains(&st.code()), st.is_active(), "{}", st);
        }
        assert!(!codes.contains(&SubRequestStatus::Ready.code()));
        assert!(!codes.contains(&SubRequestStatus::Failed.code()));
    }

    #[tokio::test]
    async fn test_claim_flips_to_waitsched_once() {
        let (svc, _dir) = create_test_catalog().await;
        let req = insert_request(svc.pool(), RequestType::Get).await;
        let sr = insert_subrequest(svc.pool(), req, None, "/data/x", SubRequestStatus::Start).await;

        let claimed = svc
            .dispatcher()
            .claim_subrequest(&[RequestType::Get])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, sr);
        assert_eq!(claimed.status, SubRequestStatus::WaitSched);
        assert_eq!(claimed.request_type, RequestType::Get);
        assert!(svc
            .dispatcher()
            .claim_subrequest(&[RequestType::Get])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_claim_filters_types_and_statuses() {
        let (svc, _dir) = create_test_catalog().await;
        let put = insert_request(svc.pool(), RequestType::Put).await;
        insert_subrequest(svc.pool(), put, None, "/data/p", SubRequestStatus::Start).await;
        let get = insert_request(svc.pool(), RequestType::Get).await;
        insert_subrequest(svc.pool(), get, None, "/data/ready", SubRequestStatus::Ready).await;
        let retry = insert_subrequest(svc.pool(), get, None, "/data/retry", SubRequestStatus::Retry).await;

        let dispatcher = svc.dispatcher();
        assert!(dispatcher.claim_subrequest(&[]).await.unwrap().is_none());
        let claimed = dispatcher
            .claim_subrequest(&[RequestType::Get, RequestType::Update])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, retry);
        assert!(dispatcher
            .claim_subrequest(&[RequestType::Get])
            .await
            .unwrap()
            .is_none());
        let claimed_put = dispatcher
            .claim_subrequest(&[RequestType::Put])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed_put.request_type, RequestType::Put);
    }

    #[tokio::test]
    async fn test_concurrent_claims_return_the_row_once() {
        let (svc, _dir) = create_test_catalog().await;
        let req = insert_request(svc.pool(), RequestType::Get).await;
        let sr = insert_subrequest(svc.pool(), req, None, "/data/x", SubRequestStatus::Start).await;

        let dispatcher = svc.dispatcher().clone();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let dispatcher = dispatcher.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.claim_subrequest(&[RequestType::Get]).await
            }));
        }
        let mut winners = Vec::new();
        for h in handles {
            if let Some(claimed) = h.await.unwrap().unwrap() {
                winners.push(claimed.id);
            }
        }
        assert_eq!(winners, vec![sr]);
    }

    #[tokio::test]
    async fn test_claim_request_resolves_tagged_type() {
        let (svc, _dir) = create_test_catalog().await;
        let rm = insert_request(svc.pool(), RequestType::Rm).await;
        let weight = insert_request(svc.pool(), RequestType::SetFileGcWeight).await;
        svc.pool()
            .transact(move |conn| {
                conn.execute("UPDATE request SET gc_weight = 3.5 WHERE id = ?1", params![weight])
                    .map_err(map_db_err)
            })
            .await
            .unwrap();

        let dispatcher = svc.dispatcher();
        let first = dispatcher
            .claim_request(&[RequestType::SetFileGcWeight])
            .await
            .unwrap()
            .unwrap();
        match first {
            StageRequest::SetFileGcWeight { header, weight: w } => {
                assert_eq!(header.id, weight);
                assert_eq!(w, 3.5);
            }
            other => panic!("unexpected {:?}", other),
        }
        let second = dispatcher
            .claim_request(&[RequestType::Rm, RequestType::PutDone])
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(second, StageRequest::Rm(ref h) if h.id == rm));
        assert!(dispatcher
            .claim_request(&[RequestType::Rm])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_malformed_request_is_reported_and_skipped() {
        let (svc, _dir) = create_test_catalog().await;
        svc.pool()
            .transact(|conn| {
                conn.execute(
                    "INSERT INTO request (id, req_type, creation_time) VALUES (500, 99, 0)",
                    [],
                )
                .map_err(map_db_err)?;
                conn.execute("INSERT INTO new_request (id, req_type) VALUES (500, 7)", [])
                    .map_err(map_db_err)
            })
            .await
            .unwrap();
        let err = svc
            .dispatcher()
            .claim_request(&[RequestType::Rm])
            .await
            .unwrap_err();
        assert!(matches!(err, StagerError::Internal(_)));
        assert!(svc
            .dispatcher()
            .claim_request(&[RequestType::Rm])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_requeue_counts_retries_then_fails() {
        let (svc, _dir) = create_test_catalog().await;
        let req = insert_request(svc.pool(), RequestType::Get).await;
        let sr = insert_subrequest(svc.pool(), req, None, "/data/x", SubRequestStatus::Start).await;
        let dispatcher = svc.dispatcher();

        for _ in 0..2 {
            dispatcher.claim_subrequest(&[RequestType::Get]).await.unwrap().unwrap();
            let st = dispatcher.requeue_subrequest(sr, 2).await.unwrap();
            assert_eq!(st, Some(SubRequestStatus::Retry));
        }
        dispatcher.claim_subrequest(&[RequestType::Get]).await.unwrap().unwrap();
        let st = dispatcher.requeue_subrequest(sr, 2).await.unwrap();
        assert_eq!(st, Some(SubRequestStatus::Failed));
        assert_eq!(subrequest_status(svc.pool(), sr).await, Some(SubRequestStatus::Failed));
        assert_eq!(dispatcher.requeue_subrequest(999, 2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_and_check_reports_last_active() {
        let (svc, _dir) = create_test_catalog().await;
        let req = insert_request(svc.pool(), RequestType::Get).await;
        let a = insert_subrequest(svc.pool(), req, None, "/data/a", SubRequestStatus::WaitSched).await;
        let b = insert_subrequest(svc.pool(), req, None, "/data/b", SubRequestStatus::WaitSched).await;
        let dispatcher = svc.dispatcher();
        assert!(!dispatcher
            .update_and_check_subrequest(a, SubRequestStatus::Ready)
            .await
            .unwrap());
        assert!(dispatcher
            .update_and_check_subrequest(b, SubRequestStatus::Ready)
            .await
            .unwrap());
        assert!(dispatcher
            .update_and_check_subrequest(12345, SubRequestStatus::Ready)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_archive_drops_request_with_last_subrequest() {
        let (svc, _dir) = create_test_catalog().await;
        let req = insert_request(svc.pool(), RequestType::Get).await;
        let a = insert_subrequest(svc.pool(), req, None, "/data/a", SubRequestStatus::Ready).await;
        let b = insert_subrequest(svc.pool(), req, None, "/data/b", SubRequestStatus::Ready).await;
        let dispatcher = svc.dispatcher();

        assert!(dispatcher.archive_subrequest(a, SubRequestStatus::Finished).await.unwrap());
        assert_eq!(subrequest_status(svc.pool(), a).await, Some(SubRequestStatus::Finished));
        assert!(dispatcher
            .archive_subrequest(b, SubRequestStatus::FailedFinished)
            .await
            .unwrap());
        assert_eq!(subrequest_status(svc.pool(), a).await, None);
        assert_eq!(subrequest_status(svc.pool(), b).await, None);
        assert!(!dispatcher.archive_subrequest(b, SubRequestStatus::Finished).await.unwrap());
        assert!(dispatcher
            .archive_subrequest(b, SubRequestStatus::Ready)
            .await
            .is_err());
    }
}
