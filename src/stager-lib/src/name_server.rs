use crate::StagerResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a file in the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NsFileId {
    pub file_id: u64,
    pub ns_host: String,
}

impl NsFileId {
    pub fn new(file_id: u64, ns_host: impl Into<String>) -> Self {
        Self {
            file_id,
            ns_host: ns_host.into(),
        }
    }
}

impl fmt::Display for NsFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.file_id, self.ns_host)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NsSegmentStatus {
    Ok,
    NotOk,
}

/// Tape segment metadata as stored by the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NsSegment {
    pub vid: String,
    pub side: i32,
    pub copy_nb: u32,
    pub fseq: u32,
    pub block_id: [u8; 4],
    pub seg_size: u64,
    pub status: NsSegmentStatus,
}

impl NsSegment {
    pub fn is_ok(&self) -> bool {
        self.status == NsSegmentStatus::Ok && !self.vid.is_empty()
    }
}

#[async_trait]
pub trait NameServer: Send + Sync {
    async fn get_segments(&self, file: &NsFileId) -> StagerResult<Vec<NsSegment>>;
    async fn set_file_size(&self, file: &NsFileId, size: u64) -> StagerResult<()>;
    async fn delete_file(&self, file: &NsFileId) -> StagerResult<()>;
    async fn resolve_path(&self, file: &NsFileId) -> StagerResult<String>;
}
