use crate::StagerResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const TAPE_DISABLED: u32 = 0x01;
pub const TAPE_EXPORTED: u32 = 0x02;
pub const TAPE_BUSY: u32 = 0x04;
pub const TAPE_FULL: u32 = 0x08;
pub const TAPE_RDONLY: u32 = 0x10;
pub const TAPE_ARCHIVED: u32 = 0x20;

/// Tape attributes returned by the volume manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapeInfo {
    pub status: u32,
    pub label: String,
    pub density: String,
    pub dgn: String,
}

impl TapeInfo {
    pub fn is_disabled(&self) -> bool {
        self.status & TAPE_DISABLED != 0
    }

    pub fn is_archived(&self) -> bool {
        self.status & TAPE_ARCHIVED != 0
    }

    pub fn is_exported(&self) -> bool {
        self.status & TAPE_EXPORTED != 0
    }

    /// Full, read-only and busy tapes can still be read.
    pub fn can_recall(&self) -> bool {
        !self.is_disabled() && !self.is_archived() && !self.is_exported()
    }
}

#[async_trait]
pub trait VolumeManager: Send + Sync {
    async fn query_tape(&self, vid: &str, side: i32) -> StagerResult<TapeInfo>;
}
