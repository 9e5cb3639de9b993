use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;
use stager_lib::NsFileId;
use std::fmt;

pub type CatalogId = u64;

macro_rules! catalog_status {
    ($name:ident { $($variant:ident = $code:literal => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn code(&self) -> i64 {
                match self {
                    $($name::$variant => $code),+
                }
            }

            pub fn from_code(code: i64) -> Option<Self> {
                match code {
                    $($code => Some($name::$variant),)+
                    _ => None,
                }
            }

            pub fn to_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.to_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.code()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let code = value.as_i64()?;
                $name::from_code(code).ok_or(FromSqlError::OutOfRange(code))
            }
        }
    };
}

catalog_status!(SubRequestStatus {
    Start = 0 => "START",
    Restart = 1 => "RESTART",
    Retry = 2 => "RETRY",
    WaitSched = 3 => "WAITSCHED",
    WaitTapeRecall = 4 => "WAITTAPERECALL",
    WaitSubReq = 5 => "WAITSUBREQ",
    Ready = 6 => "READY",
    Failed = 7 => "FAILED",
    Finished = 8 => "FINISHED",
    FailedFinished = 9 => "FAILED_FINISHED",
});

impl SubRequestStatus {
    pub fn is_claimable(&self) -> bool {
        matches!(
            self,
            SubRequestStatus::Start | SubRequestStatus::Restart | SubRequestStatus::Retry
        )
    }

    pub fn is_archived(&self) -> bool {
        matches!(
            self,
            SubRequestStatus::Finished | SubRequestStatus::FailedFinished
        )
    }

    /// Not yet answered: still queued, scheduled or parked on another replica.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SubRequestStatus::Start
                | SubRequestStatus::Restart
                | SubRequestStatus::Retry
                | SubRequestStatus::WaitSched
                | SubRequestStatus::WaitTapeRecall
                | SubRequestStatus::WaitSubReq
        )
    }
}

catalog_status!(DiskCopyStatus {
    Staged = 0 => "STAGED",
    WaitDisk2DiskCopy = 1 => "WAITDISK2DISKCOPY",
    WaitTapeRecall = 2 => "WAITTAPERECALL",
    Deleted = 3 => "DELETED",
    Failed = 4 => "FAILED",
    WaitFs = 5 => "WAITFS",
    StageOut = 6 => "STAGEOUT",
    Invalid = 7 => "INVALID",
    GcCandidate = 8 => "GCCANDIDATE",
    BeingDeleted = 9 => "BEINGDELETED",
    CanBeMigr = 10 => "CANBEMIGR",
});

impl DiskCopyStatus {
    /// Holds a complete replica that can be read.
    pub fn is_readable(&self) -> bool {
        matches!(
            self,
            DiskCopyStatus::Staged | DiskCopyStatus::CanBeMigr | DiskCopyStatus::StageOut
        )
    }

    /// A replica is being produced for this file.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            DiskCopyStatus::WaitTapeRecall
                | DiskCopyStatus::WaitFs
                | DiskCopyStatus::WaitDisk2DiskCopy
        )
    }
}

catalog_status!(TapeCopyStatus {
    Created = 0 => "CREATED",
    ToBeMigrated = 1 => "TOBEMIGRATED",
    WaitInStreams = 2 => "WAITINSTREAMS",
    Selected = 3 => "SELECTED",
    ToBeRecalled = 4 => "TOBERECALLED",
    Staged = 5 => "STAGED",
    Failed = 6 => "FAILED",
});

catalog_status!(SegmentStatus {
    Unprocessed = 0 => "UNPROCESSED",
    FileCopied = 1 => "FILECOPIED",
    Failed = 2 => "FAILED",
    Selected = 3 => "SELECTED",
    Invalid = 4 => "INVALID",
});

catalog_status!(TapeStatus {
    Unused = 0 => "UNUSED",
    Pending = 1 => "PENDING",
    WaitVdqm = 2 => "WAITVDQM",
    WaitMount = 3 => "WAITMOUNT",
    Mounted = 4 => "MOUNTED",
    Finished = 5 => "FINISHED",
    Failed = 6 => "FAILED",
    Unknown = 7 => "UNKNOWN",
});

impl TapeStatus {
    /// Not part of any mount cycle; a new recall moves it to PENDING.
    pub fn is_idle(&self) -> bool {
        matches!(
            self,
            TapeStatus::Unused | TapeStatus::Finished | TapeStatus::Failed | TapeStatus::Unknown
        )
    }
}

catalog_status!(StreamStatus {
    Pending = 0 => "PENDING",
    WaitDrive = 1 => "WAITDRIVE",
    WaitMount = 2 => "WAITMOUNT",
    Running = 3 => "RUNNING",
});

catalog_status!(TapeMode {
    WriteDisable = 0 => "WRITE_DISABLE",
    WriteEnable = 1 => "WRITE_ENABLE",
});

catalog_status!(DiskServerStatus {
    Production = 0 => "PRODUCTION",
    Draining = 1 => "DRAINING",
    Disabled = 2 => "DISABLED",
});

catalog_status!(FileSystemStatus {
    Production = 0 => "PRODUCTION",
    Draining = 1 => "DRAINING",
    Disabled = 2 => "DISABLED",
});

catalog_status!(RequestType {
    Get = 1 => "Get",
    PrepareToGet = 2 => "PrepareToGet",
    Put = 3 => "Put",
    PrepareToPut = 4 => "PrepareToPut",
    Update = 5 => "Update",
    PrepareToUpdate = 6 => "PrepareToUpdate",
    Rm = 7 => "Rm",
    PutDone = 8 => "PutDone",
    SetFileGcWeight = 9 => "SetFileGcWeight",
});

impl RequestType {
    /// Scheduled through getUpdateStart.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            RequestType::Get
                | RequestType::PrepareToGet
                | RequestType::Update
                | RequestType::PrepareToUpdate
        )
    }

    pub fn is_write(&self) -> bool {
        matches!(self, RequestType::Put | RequestType::PrepareToPut)
    }

    /// Handled as a whole request through the request backlog.
    pub fn is_request_level(&self) -> bool {
        matches!(
            self,
            RequestType::Rm | RequestType::PutDone | RequestType::SetFileGcWeight
        )
    }
}

fn block_id_from_blob(blob: Vec<u8>, idx: usize) -> rusqlite::Result<[u8; 4]> {
    <[u8; 4]>::try_from(blob.as_slice()).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Blob,
            format!("block id must be 4 bytes, got {}", blob.len()).into(),
        )
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct SvcClass {
    pub id: CatalogId,
    pub name: String,
    pub nb_drives: u32,
    pub default_file_size: u64,
    pub max_replica_nb: u32,
    pub replication_policy: String,
    pub gc_policy: String,
    pub migrator_policy: String,
    pub recaller_policy: String,
    pub disk_pools: Vec<CatalogId>,
    pub tape_pools: Vec<CatalogId>,
}

impl SvcClass {
    pub(crate) const COLUMNS: &'static str = "id, name, nb_drives, default_file_size, \
        max_replica_nb, replication_policy, gc_policy, migrator_policy, recaller_policy";

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            nb_drives: row.get(2)?,
            default_file_size: row.get(3)?,
            max_replica_nb: row.get(4)?,
            replication_policy: row.get(5)?,
            gc_policy: row.get(6)?,
            migrator_policy: row.get(7)?,
            recaller_policy: row.get(8)?,
            disk_pools: Vec::new(),
            tape_pools: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileClass {
    pub id: CatalogId,
    pub name: String,
    pub min_file_size: u64,
    pub max_file_size: u64,
    pub nb_copies: u32,
}

impl FileClass {
    pub(crate) const COLUMNS: &'static str = "id, name, min_file_size, max_file_size, nb_copies";

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            min_file_size: row.get(2)?,
            max_file_size: row.get(3)?,
            nb_copies: row.get(4)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskPool {
    pub id: CatalogId,
    pub name: String,
    pub file_systems: Vec<CatalogId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapePool {
    pub id: CatalogId,
    pub name: String,
    pub streams: Vec<Stream>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskServer {
    pub id: CatalogId,
    pub name: String,
    pub status: DiskServerStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileSystem {
    pub id: CatalogId,
    pub mount_point: String,
    pub disk_server: CatalogId,
    pub disk_server_name: String,
    pub disk_pool: Option<CatalogId>,
    pub free: u64,
    pub weight: f64,
    pub fs_deviation: f64,
    pub status: FileSystemStatus,
}

impl FileSystem {
    /// Columns of `file_system fs JOIN disk_server ds`.
    pub(crate) const JOINED_COLUMNS: &'static str = "fs.id, fs.mount_point, fs.disk_server, \
        ds.name, fs.disk_pool, fs.free_space, fs.weight, fs.fs_deviation, fs.status";

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            mount_point: row.get(1)?,
            disk_server: row.get(2)?,
            disk_server_name: row.get(3)?,
            disk_pool: row.get(4)?,
            free: row.get(5)?,
            weight: row.get(6)?,
            fs_deviation: row.get(7)?,
            status: row.get(8)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastorFile {
    pub id: CatalogId,
    pub file_id: u64,
    pub ns_host: String,
    pub size: u64,
    pub svc_class: Option<CatalogId>,
    pub file_class: Option<CatalogId>,
}

impl CastorFile {
    pub(crate) const COLUMNS: &'static str =
        "id, file_id, ns_host, file_size, svc_class, file_class";

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            file_id: row.get(1)?,
            ns_host: row.get(2)?,
            size: row.get(3)?,
            svc_class: row.get(4)?,
            file_class: row.get(5)?,
        })
    }

    pub fn ns_file_id(&self) -> NsFileId {
        NsFileId::new(self.file_id, self.ns_host.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiskCopy {
    pub id: CatalogId,
    pub path: String,
    pub status: DiskCopyStatus,
    pub file_system: Option<CatalogId>,
    pub castor_file: CatalogId,
    pub gc_weight: f64,
    pub creation_time: i64,
}

impl DiskCopy {
    pub(crate) const COLUMNS: &'static str =
        "id, path, status, file_system, castor_file, gc_weight, creation_time";

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            path: row.get(1)?,
            status: row.get(2)?,
            file_system: row.get(3)?,
            castor_file: row.get(4)?,
            gc_weight: row.get(5)?,
            creation_time: row.get(6)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapeCopy {
    pub id: CatalogId,
    pub copy_nb: u32,
    pub status: TapeCopyStatus,
    pub castor_file: CatalogId,
}

impl TapeCopy {
    pub(crate) const COLUMNS: &'static str = "id, copy_nb, status, castor_file";

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            copy_nb: row.get(1)?,
            status: row.get(2)?,
            castor_file: row.get(3)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub id: CatalogId,
    pub tape_copy: CatalogId,
    pub tape: CatalogId,
    pub fseq: u32,
    pub offset: u64,
    pub bytes_in: u64,
    pub block_id: [u8; 4],
    pub status: SegmentStatus,
    pub error_code: i32,
}

impl Segment {
    pub(crate) const COLUMNS: &'static str =
        "id, tape_copy, tape, fseq, seg_offset, bytes_in, block_id, status, error_code";

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tape_copy: row.get(1)?,
            tape: row.get(2)?,
            fseq: row.get(3)?,
            offset: row.get(4)?,
            bytes_in: row.get(5)?,
            block_id: block_id_from_blob(row.get(6)?, 6)?,
            status: row.get(7)?,
            error_code: row.get(8)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tape {
    pub id: CatalogId,
    pub vid: String,
    pub side: i32,
    pub tpmode: TapeMode,
    pub status: TapeStatus,
    pub error_code: i32,
    pub err_msg: Option<String>,
}

impl Tape {
    pub(crate) const COLUMNS: &'static str = "id, vid, side, tpmode, status, error_code, err_msg";

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            vid: row.get(1)?,
            side: row.get(2)?,
            tpmode: row.get(3)?,
            status: row.get(4)?,
            error_code: row.get(5)?,
            err_msg: row.get(6)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stream {
    pub id: CatalogId,
    pub tape_pool: CatalogId,
    pub tape_pool_name: String,
    pub tape: Option<CatalogId>,
    pub initial_size_to_transfer: u64,
    pub status: StreamStatus,
}

impl Stream {
    /// Columns of `stream s JOIN tape_pool tp`.
    pub(crate) const JOINED_COLUMNS: &'static str =
        "s.id, s.tape_pool, tp.name, s.tape, s.initial_size_to_transfer, s.status";

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tape_pool: row.get(1)?,
            tape_pool_name: row.get(2)?,
            tape: row.get(3)?,
            initial_size_to_transfer: row.get(4)?,
            status: row.get(5)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestHeader {
    pub id: CatalogId,
    pub svc_class_name: String,
    pub euid: u32,
    pub egid: u32,
    pub client_host: String,
    pub client_port: u16,
    pub user_tag: Option<String>,
    pub creation_time: i64,
}

/// A claimed request resolved by its stored type discriminant.
#[derive(Debug, Clone, PartialEq)]
pub enum StageRequest {
    Get(RequestHeader),
    PrepareToGet(RequestHeader),
    Put(RequestHeader),
    PrepareToPut(RequestHeader),
    Update(RequestHeader),
    PrepareToUpdate(RequestHeader),
    Rm(RequestHeader),
    PutDone(RequestHeader),
    SetFileGcWeight { header: RequestHeader, weight: f64 },
}

impl StageRequest {
    pub fn from_parts(req_type: RequestType, header: RequestHeader, gc_weight: Option<f64>) -> Self {
        match req_type {
            RequestType::Get => StageRequest::Get(header),
            RequestType::PrepareToGet => StageRequest::PrepareToGet(header),
            RequestType::Put => StageRequest::Put(header),
            RequestType::PrepareToPut => StageRequest::PrepareToPut(header),
            RequestType::Update => StageRequest::Update(header),
            RequestType::PrepareToUpdate => StageRequest::PrepareToUpdate(header),
            RequestType::Rm => StageRequest::Rm(header),
            RequestType::PutDone => StageRequest::PutDone(header),
            RequestType::SetFileGcWeight => StageRequest::SetFileGcWeight {
                header,
                weight: gc_weight.unwrap_or(0.0),
            },
        }
    }

    pub fn header(&self) -> &RequestHeader {
        match self {
            StageRequest::Get(h)
            | StageRequest::PrepareToGet(h)
            | StageRequest::Put(h)
            | StageRequest::PrepareToPut(h)
            | StageRequest::Update(h)
            | StageRequest::PrepareToUpdate(h)
            | StageRequest::Rm(h)
            | StageRequest::PutDone(h) => h,
            StageRequest::SetFileGcWeight { header, .. } => header,
        }
    }

    pub fn request_type(&self) -> RequestType {
        match self {
            StageRequest::Get(_) => RequestType::Get,
            StageRequest::PrepareToGet(_) => RequestType::PrepareToGet,
            StageRequest::Put(_) => RequestType::Put,
            StageRequest::PrepareToPut(_) => RequestType::PrepareToPut,
            StageRequest::Update(_) => RequestType::Update,
            StageRequest::PrepareToUpdate(_) => RequestType::PrepareToUpdate,
            StageRequest::Rm(_) => RequestType::Rm,
            StageRequest::PutDone(_) => RequestType::PutDone,
            StageRequest::SetFileGcWeight { .. } => RequestType::SetFileGcWeight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubRequest {
    pub id: CatalogId,
    pub request: CatalogId,
    pub request_type: RequestType,
    pub castor_file: Option<CatalogId>,
    pub disk_copy: Option<CatalogId>,
    pub parent: Option<CatalogId>,
    pub file_name: String,
    pub protocol: String,
    pub xsize: u64,
    pub priority: i32,
    pub status: SubRequestStatus,
    pub retry_counter: u32,
    pub error_code: i32,
    pub error_message: Option<String>,
}

impl SubRequest {
    /// Columns of `sub_request sr JOIN request r`.
    pub(crate) const JOINED_COLUMNS: &'static str = "sr.id, sr.request, r.req_type, \
        sr.castor_file, sr.disk_copy, sr.parent, sr.file_name, sr.protocol, sr.xsize, \
        sr.priority, sr.status, sr.retry_counter, sr.error_code, sr.error_message";

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            request: row.get(1)?,
            request_type: row.get(2)?,
            castor_file: row.get(3)?,
            disk_copy: row.get(4)?,
            parent: row.get(5)?,
            file_name: row.get(6)?,
            protocol: row.get(7)?,
            xsize: row.get(8)?,
            priority: row.get(9)?,
            status: row.get(10)?,
            retry_counter: row.get(11)?,
            error_code: row.get(12)?,
            error_message: row.get(13)?,
        })
    }
}

/// A disk copy with the placement data a mover needs.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskCopyForRecall {
    pub disk_copy: DiskCopy,
    pub fs_weight: f64,
    pub mount_point: String,
    pub disk_server: String,
}

impl DiskCopyForRecall {
    pub fn full_path(&self) -> String {
        format!("{}/{}", self.mount_point.trim_end_matches('/'), self.disk_copy.path)
    }
}

/// Everything a migrator needs to start copying one tape copy.
#[derive(Debug, Clone, PartialEq)]
pub struct TapeCopyForMigration {
    pub tape_copy: TapeCopy,
    pub disk_copy_id: CatalogId,
    pub disk_copy_path: String,
    pub disk_server: String,
    pub mount_point: String,
    pub castor_file: CastorFile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcLocalFile {
    pub file_name: String,
    pub disk_copy_id: CatalogId,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetUpdateStartResult {
    pub disk_copy: Option<DiskCopy>,
    pub sources: Vec<DiskCopyForRecall>,
    pub empty_file: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecallCopy {
    pub tape_copy: TapeCopy,
    pub segments: Vec<Segment>,
}
