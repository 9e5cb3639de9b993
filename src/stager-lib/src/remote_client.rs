use crate::{NameServer, NsFileId, NsSegment, StagerError, StagerResult, TapeInfo, VolumeManager};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn build_client(timeout: Duration) -> StagerResult<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| StagerError::Internal(format!("failed to create http client: {}", e)))
}

fn join_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}

#[derive(Debug, Serialize, Deserialize)]
struct FileSizeBody {
    size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct FilePathBody {
    path: String,
}

/// Namespace service reached over HTTP/JSON.
///
/// Routes are relative to `base_url`:
/// `GET files/{ns_host}/{file_id}/segments`, `PUT files/{ns_host}/{file_id}/size`,
/// `DELETE files/{ns_host}/{file_id}` and `GET files/{ns_host}/{file_id}/path`.
pub struct HttpNameServer {
    base_url: String,
    client: Client,
}

impl HttpNameServer {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> StagerResult<Self> {
        Ok(Self {
            base_url: base_url.into(),
            client: build_client(timeout)?,
        })
    }

    fn file_url(&self, file: &NsFileId, suffix: Option<&str>) -> String {
        let path = match suffix {
            Some(suffix) => format!("files/{}/{}/{}", file.ns_host, file.file_id, suffix),
            None => format!("files/{}/{}", file.ns_host, file.file_id),
        };
        join_url(&self.base_url, &path)
    }

    fn send_failed(url: &str, e: reqwest::Error) -> StagerError {
        if e.is_timeout() {
            return StagerError::Timeout(format!("name server request {} timed out", url));
        }
        StagerError::name_server(libc::EIO, format!("request {} failed: {}", url, e))
    }
}

#[async_trait]
impl NameServer for HttpNameServer {
    async fn get_segments(&self, file: &NsFileId) -> StagerResult<Vec<NsSegment>> {
        let url = self.file_url(file, Some("segments"));
        let res = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::send_failed(&url, e))?;
        if !res.status().is_success() {
            return Err(StagerError::from_name_server_status(res.status(), url));
        }
        res.json::<Vec<NsSegment>>().await.map_err(|e| {
            StagerError::name_server(libc::EPROTO, format!("decode segments of {} failed: {}", file, e))
        })
    }

    async fn set_file_size(&self, file: &NsFileId, size: u64) -> StagerResult<()> {
        let url = self.file_url(file, Some("size"));
        let res = self
            .client
            .put(&url)
            .json(&FileSizeBody { size })
            .send()
            .await
            .map_err(|e| Self::send_failed(&url, e))?;
        if !res.status().is_success() {
            return Err(StagerError::from_name_server_status(res.status(), url));
        }
        debug!("set_file_size: file={}, size={}", file, size);
        Ok(())
    }

    async fn delete_file(&self, file: &NsFileId) -> StagerResult<()> {
        let url = self.file_url(file, None);
        let res = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| Self::send_failed(&url, e))?;
        match res.status() {
            StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::ACCEPTED => Ok(()),
            status => Err(StagerError::from_name_server_status(status, url)),
        }
    }

    async fn resolve_path(&self, file: &NsFileId) -> StagerResult<String> {
        let url = self.file_url(file, Some("path"));
        let res = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::send_failed(&url, e))?;
        if !res.status().is_success() {
            return Err(StagerError::from_name_server_status(res.status(), url));
        }
        let body = res.json::<FilePathBody>().await.map_err(|e| {
            StagerError::name_server(libc::EPROTO, format!("decode path of {} failed: {}", file, e))
        })?;
        Ok(body.path)
    }
}

/// Tape volume catalog reached over HTTP/JSON: `GET tapes/{vid}/{side}`.
pub struct HttpVolumeManager {
    base_url: String,
    client: Client,
}

impl HttpVolumeManager {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> StagerResult<Self> {
        Ok(Self {
            base_url: base_url.into(),
            client: build_client(timeout)?,
        })
    }
}

#[async_trait]
impl VolumeManager for HttpVolumeManager {
    async fn query_tape(&self, vid: &str, side: i32) -> StagerResult<TapeInfo> {
        let url = join_url(&self.base_url, &format!("tapes/{}/{}", vid, side));
        let res = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                StagerError::Timeout(format!("volume manager request {} timed out", url))
            } else {
                StagerError::volume_manager(libc::EIO, format!("request {} failed: {}", url, e))
            }
        })?;
        if !res.status().is_success() {
            return Err(StagerError::from_volume_manager_status(res.status(), url));
        }
        res.json::<TapeInfo>().await.map_err(|e| {
            StagerError::volume_manager(libc::EPROTO, format!("decode tape {} failed: {}", vid, e))
        })
    }
}
