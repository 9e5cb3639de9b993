use rusqlite::{Connection, ErrorCode, OpenFlags};
use stager_lib::{StagerError, StagerResult};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) fn map_db_err(err: rusqlite::Error) -> StagerError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            StagerError::Conflict(err.to_string())
        }
        _ => StagerError::DbError(err.to_string()),
    }
}

pub(crate) fn unix_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Owns the catalog connections. Built once at startup and shared by every component.
pub struct CatalogPool {
    db_path: PathBuf,
    busy_timeout: Duration,
    max_idle: usize,
    idle: Mutex<Vec<Connection>>,
}

impl CatalogPool {
    pub fn open(
        db_path: impl AsRef<Path>,
        busy_timeout: Duration,
        max_idle: usize,
    ) -> StagerResult<Arc<Self>> {
        let pool = Self {
            db_path: db_path.as_ref().to_path_buf(),
            busy_timeout,
            max_idle: max_idle.max(1),
            idle: Mutex::new(Vec::new()),
        };
        let conn = pool.open_connection()?;
        create_schema(&conn)?;
        pool.release(conn);
        info!(
            "catalog pool opened: path={}, busy_timeout={:?}, max_idle={}",
            pool.db_path.display(),
            pool.busy_timeout,
            pool.max_idle
        );
        Ok(Arc::new(pool))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_connection(&self) -> StagerResult<Connection> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .map_err(|e| StagerError::DbError(format!("open catalog db failed: {}", e)))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = OFF;",
        )
        .map_err(|e| StagerError::DbError(format!("pragma failed: {}", e)))?;
        conn.busy_timeout(self.busy_timeout).map_err(map_db_err)?;
        Ok(conn)
    }

    fn acquire(&self) -> StagerResult<Connection> {
        let reused = match self.idle.lock() {
            Ok(mut idle) => idle.pop(),
            Err(e) => {
                warn!("catalog pool: idle lock poisoned: {}", e);
                None
            }
        };
        match reused {
            Some(conn) => Ok(conn),
            None => self.open_connection(),
        }
    }

    fn release(&self, conn: Connection) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.max_idle {
                idle.push(conn);
            }
        }
    }

    /// Starts a write transaction; the catalog write lock is taken immediately.
    pub async fn begin(self: &Arc<Self>) -> StagerResult<CatalogTxn> {
        let pool = self.clone();
        let conn = tokio::task::spawn_blocking(move || {
            let conn = pool.acquire()?;
            conn.execute_batch("BEGIN IMMEDIATE")
                .map_err(|e| StagerError::DbError(format!("begin txn failed: {}", e)))?;
            Ok::<_, StagerError>(conn)
        })
        .await
        .map_err(|e| StagerError::Internal(format!("begin txn task failed: {}", e)))??;

        Ok(CatalogTxn {
            pool: self.clone(),
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Runs `f` in its own transaction and commits it.
    pub async fn transact<T, F>(self: &Arc<Self>, f: F) -> StagerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StagerResult<T> + Send + 'static,
    {
        let txn = self.begin().await?;
        let result = txn.run(f).await?;
        txn.commit().await?;
        Ok(result)
    }

    /// `transact` for records that must not be lost: a busy or locked catalog is retried
    /// up to `attempts` times, waiting `backoff` times the attempt number in between.
    pub async fn transact_retrying<T, F>(
        self: &Arc<Self>,
        attempts: u32,
        backoff: Duration,
        f: F,
    ) -> StagerResult<T>
    where
        T: Send + 'static,
        F: Fn(&Connection) -> StagerResult<T> + Clone + Send + 'static,
    {
        let mut attempt = 1;
        loop {
            match self.transact(f.clone()).await {
                Err(StagerError::DbError(msg)) if attempt < attempts => {
                    warn!("catalog txn failed, retrying: attempt={}, err={}", attempt, msg);
                    tokio::time::sleep(backoff * attempt).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

/// An open catalog transaction. Rolled back on drop unless committed.
pub struct CatalogTxn {
    pool: Arc<CatalogPool>,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl CatalogTxn {
    pub async fn run<T, F>(&self, f: F) -> StagerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StagerResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| StagerError::Internal(format!("conn lock poisoned: {}", e)))?;
            let conn = guard
                .as_ref()
                .ok_or_else(|| StagerError::Internal("transaction already closed".to_string()))?;
            f(conn)
        })
        .await
        .map_err(|e| StagerError::Internal(format!("db task join failed: {}", e)))?
    }

    pub async fn commit(self) -> StagerResult<()> {
        self.finish("COMMIT").await
    }

    pub async fn rollback(self) -> StagerResult<()> {
        self.finish("ROLLBACK").await
    }

    async fn finish(&self, stmt: &'static str) -> StagerResult<()> {
        let conn = self.conn.clone();
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StagerError::Internal(format!("conn lock poisoned: {}", e)))?;
            let Some(conn) = guard.take() else {
                return Err(StagerError::Internal("transaction already closed".to_string()));
            };
            match conn.execute_batch(stmt) {
                Ok(()) => {
                    pool.release(conn);
                    Ok(())
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(StagerError::DbError(format!("{} failed: {}", stmt, e)))
                }
            }
        })
        .await
        .map_err(|e| StagerError::Internal(format!("{} task join failed: {}", stmt, e)))?
    }
}

impl Drop for CatalogTxn {
    fn drop(&mut self) {
        let taken = match self.conn.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => return,
        };
        let Some(conn) = taken else {
            return;
        };
        let pool = self.pool.clone();
        let rollback = move || match conn.execute_batch("ROLLBACK") {
            Ok(()) => {
                debug!("catalog txn rolled back on drop");
                pool.release(conn);
            }
            Err(e) => warn!("catalog txn rollback on drop failed: {}", e),
        };
        // Outside a runtime there is no blocking pool to hand the rollback to.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(rollback);
            }
            Err(_) => rollback(),
        }
    }
}

fn create_schema(conn: &Connection) -> StagerResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS svc_class (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            nb_drives INTEGER NOT NULL DEFAULT 1,
            default_file_size INTEGER NOT NULL DEFAULT 0,
            max_replica_nb INTEGER NOT NULL DEFAULT 1,
            replication_policy TEXT NOT NULL DEFAULT '',
            gc_policy TEXT NOT NULL DEFAULT '',
            migrator_policy TEXT NOT NULL DEFAULT '',
            recaller_policy TEXT NOT NULL DEFAULT ''
        );
        CREATE TABLE IF NOT EXISTS file_class (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            min_file_size INTEGER NOT NULL DEFAULT 0,
            max_file_size INTEGER NOT NULL DEFAULT 0,
            nb_copies INTEGER NOT NULL DEFAULT 1
        );
        CREATE TABLE IF NOT EXISTS disk_pool (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        );
        CREATE TABLE IF NOT EXISTS tape_pool (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        );
        CREATE TABLE IF NOT EXISTS svc_class_disk_pool (
            svc_class INTEGER NOT NULL,
            disk_pool INTEGER NOT NULL,
            PRIMARY KEY (svc_class, disk_pool)
        ) WITHOUT ROWID;
        CREATE TABLE IF NOT EXISTS svc_class_tape_pool (
            svc_class INTEGER NOT NULL,
            tape_pool INTEGER NOT NULL,
            PRIMARY KEY (svc_class, tape_pool)
        ) WITHOUT ROWID;
        CREATE TABLE IF NOT EXISTS disk_server (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            status INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS file_system (
            id INTEGER PRIMARY KEY,
            disk_server INTEGER NOT NULL,
            disk_pool INTEGER,
            mount_point TEXT NOT NULL,
            free_space INTEGER NOT NULL DEFAULT 0,
            weight REAL NOT NULL DEFAULT 0,
            fs_deviation REAL NOT NULL DEFAULT 0,
            status INTEGER NOT NULL DEFAULT 0,
            UNIQUE (disk_server, mount_point)
        );
        CREATE TABLE IF NOT EXISTS castor_file (
            id INTEGER PRIMARY KEY,
            file_id INTEGER NOT NULL,
            ns_host TEXT NOT NULL,
            file_size INTEGER NOT NULL DEFAULT 0,
            svc_class INTEGER,
            file_class INTEGER,
            UNIQUE (file_id, ns_host)
        );
        CREATE TABLE IF NOT EXISTS disk_copy (
            id INTEGER PRIMARY KEY,
            path TEXT NOT NULL DEFAULT '',
            status INTEGER NOT NULL,
            file_system INTEGER,
            castor_file INTEGER NOT NULL,
            gc_weight REAL NOT NULL DEFAULT 0,
            creation_time INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_disk_copy_castor_file ON disk_copy(castor_file);
        CREATE INDEX IF NOT EXISTS idx_disk_copy_status_fs ON disk_copy(status, file_system);
        CREATE TABLE IF NOT EXISTS tape_copy (
            id INTEGER PRIMARY KEY,
            copy_nb INTEGER NOT NULL,
            status INTEGER NOT NULL,
            castor_file INTEGER NOT NULL,
            nb_retried INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_tape_copy_castor_file ON tape_copy(castor_file);
        CREATE INDEX IF NOT EXISTS idx_tape_copy_status ON tape_copy(status);
        CREATE TABLE IF NOT EXISTS tape (
            id INTEGER PRIMARY KEY,
            vid TEXT NOT NULL,
            side INTEGER NOT NULL,
            tpmode INTEGER NOT NULL,
            status INTEGER NOT NULL,
            error_code INTEGER NOT NULL DEFAULT 0,
            err_msg TEXT,
            UNIQUE (vid, side, tpmode)
        );
        CREATE TABLE IF NOT EXISTS segment (
            id INTEGER PRIMARY KEY,
            tape_copy INTEGER NOT NULL,
            tape INTEGER NOT NULL,
            fseq INTEGER NOT NULL,
            seg_offset INTEGER NOT NULL,
            bytes_in INTEGER NOT NULL,
            block_id BLOB NOT NULL,
            status INTEGER NOT NULL,
            error_code INTEGER NOT NULL DEFAULT 0,
            err_msg TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_segment_tape_status ON segment(tape, status);
        CREATE INDEX IF NOT EXISTS idx_segment_tape_copy ON segment(tape_copy);
        CREATE TABLE IF NOT EXISTS stream (
            id INTEGER PRIMARY KEY,
            tape_pool INTEGER NOT NULL,
            tape INTEGER,
            initial_size_to_transfer INTEGER NOT NULL DEFAULT 0,
            status INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS stream_tape_copy (
            stream INTEGER NOT NULL,
            tape_copy INTEGER NOT NULL,
            PRIMARY KEY (stream, tape_copy)
        ) WITHOUT ROWID;
        CREATE INDEX IF NOT EXISTS idx_stream_tape_copy_tc ON stream_tape_copy(tape_copy);
        CREATE TABLE IF NOT EXISTS request (
            id INTEGER PRIMARY KEY,
            req_type INTEGER NOT NULL,
            svc_class_name TEXT NOT NULL DEFAULT '',
            euid INTEGER NOT NULL DEFAULT 0,
            egid INTEGER NOT NULL DEFAULT 0,
            client_host TEXT NOT NULL DEFAULT '',
            client_port INTEGER NOT NULL DEFAULT 0,
            user_tag TEXT,
            gc_weight REAL,
            creation_time INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS new_request (
            id INTEGER PRIMARY KEY,
            req_type INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS sub_request (
            id INTEGER PRIMARY KEY,
            request INTEGER NOT NULL,
            castor_file INTEGER,
            disk_copy INTEGER,
            parent INTEGER,
            file_name TEXT NOT NULL,
            protocol TEXT NOT NULL DEFAULT '',
            xsize INTEGER NOT NULL DEFAULT 0,
            priority INTEGER NOT NULL DEFAULT 0,
            status INTEGER NOT NULL,
            retry_counter INTEGER NOT NULL DEFAULT 0,
            error_code INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            last_modification_time INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sub_request_status ON sub_request(status);
        CREATE INDEX IF NOT EXISTS idx_sub_request_request ON sub_request(request);
        CREATE INDEX IF NOT EXISTS idx_sub_request_disk_copy ON sub_request(disk_copy);
        CREATE INDEX IF NOT EXISTS idx_sub_request_parent ON sub_request(parent);",
    )
    .map_err(|e| StagerError::DbError(format!("create schema failed: {}", e)))?;
    Ok(())
}
