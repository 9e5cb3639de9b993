mod name_server;
mod remote_client;
mod volume_manager;

pub use name_server::*;
pub use remote_client::*;
pub use volume_manager::*;

use reqwest::StatusCode;
use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug)]
pub enum StagerError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("no valid tape copy: {0}")]
    NoValidCopy(String),
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),
    #[error("name server error {code}: {message}")]
    NameServer { code: i32, message: String },
    #[error("volume manager error {code}: {message}")]
    VolumeManager { code: i32, message: String },
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl StagerError {
    pub fn name_server(code: i32, message: impl Into<String>) -> Self {
        StagerError::NameServer {
            code,
            message: message.into(),
        }
    }

    pub fn volume_manager(code: i32, message: impl Into<String>) -> Self {
        StagerError::VolumeManager {
            code,
            message: message.into(),
        }
    }

    pub fn from_name_server_status(code: StatusCode, info: String) -> Self {
        StagerError::name_server(http_status_to_errno(code), format!("HTTP {} for {}", code, info))
    }

    pub fn from_volume_manager_status(code: StatusCode, info: String) -> Self {
        StagerError::volume_manager(
            http_status_to_errno(code),
            format!("HTTP {} for {}", code, info),
        )
    }

    /// errno recorded on a failed SubRequest.
    pub fn errno(&self) -> i32 {
        match self {
            StagerError::Internal(_) => libc::EFAULT,
            StagerError::DbError(_) => libc::EAGAIN,
            StagerError::Conflict(_) => libc::EEXIST,
            StagerError::NoValidCopy(_) => libc::ENODATA,
            StagerError::ResourceUnavailable(_) => libc::ENOSPC,
            StagerError::NameServer { code, .. } => *code,
            StagerError::VolumeManager { code, .. } => *code,
            StagerError::Timeout(_) => libc::ETIMEDOUT,
            StagerError::IoError(_) => libc::EIO,
            StagerError::InvalidParam(_) => libc::EINVAL,
            StagerError::InvalidState(_) => libc::EBUSY,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StagerError::DbError(_)
                | StagerError::Timeout(_)
                | StagerError::NameServer { .. }
                | StagerError::VolumeManager { .. }
        )
    }

    pub fn is_external(&self) -> bool {
        matches!(
            self,
            StagerError::NameServer { .. }
                | StagerError::VolumeManager { .. }
                | StagerError::Timeout(_)
        )
    }

    pub fn is_resource_unavailable(&self) -> bool {
        matches!(
            self,
            StagerError::NoValidCopy(_) | StagerError::ResourceUnavailable(_)
        )
    }

    /// The namespace no longer knows the entry.
    pub fn is_entry_vanished(&self) -> bool {
        matches!(self, StagerError::NameServer { code, .. } if *code == libc::ENOENT)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StagerError::Conflict(_))
    }
}

pub type StagerResult<T> = std::result::Result<T, StagerError>;

impl From<std::io::Error> for StagerError {
    fn from(err: std::io::Error) -> Self {
        StagerError::IoError(err.to_string())
    }
}

fn http_status_to_errno(code: StatusCode) -> i32 {
    match code {
        StatusCode::NOT_FOUND => libc::ENOENT,
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => libc::EACCES,
        StatusCode::BAD_REQUEST => libc::EINVAL,
        StatusCode::CONFLICT => libc::EEXIST,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => libc::ETIMEDOUT,
        StatusCode::SERVICE_UNAVAILABLE => libc::EAGAIN,
        _ => libc::EIO,
    }
}
