//! HTTP client for the NAS File Station web API.
//!
//! Every call goes to `webapi/entry.cgi` (login to `webapi/auth.cgi`) and
//! answers with the same envelope: `{"success": bool, "data": .., "error":
//! {"code": n}}`. Long-running operations (copy/move, MD5) are started and
//! then polled by task id.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::StreamExt;
use reqwest::{header, Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use crate::remote::{
    file_name, parent_path, ByteStream, ChecksumStatus, MoveStart,
    RemoteFileDescriptor, RemoteStore, TaskHandle, TaskStatus,
};
use crate::{BackupError, Result};

const ENTRY: &str = "webapi/entry.cgi";
const AUTH: &str = "webapi/auth.cgi";
const LIST_PAGE: u64 = 1000;

// File Station error codes the engine reacts to.
const ERR_PERMISSION: i64 = 105;
const ERR_NO_SESSION: i64 = 119;
const ERR_NOT_PERMITTED: i64 = 407;
const ERR_NO_SUCH_FILE: i64 = 408;
const ERR_ALREADY_EXISTS: i64 = 414;

// --- STRUCTS ---

#[derive(Deserialize, Debug)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default = "Option::default")]
    data: Option<T>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorBody {
    code: i64,
}

#[derive(Deserialize, Debug)]
struct LoginData {
    sid: String,
}

#[derive(Deserialize, Debug)]
struct ListData {
    #[serde(default)]
    files: Vec<ListEntry>,
    #[serde(default)]
    total: u64,
}

#[derive(Deserialize, Debug)]
struct ListEntry {
    name: String,
    path: String,
    #[serde(default)]
    isdir: bool,
    #[serde(default)]
    additional: Option<ListAdditional>,
}

#[derive(Deserialize, Debug, Default)]
struct ListAdditional {
    #[serde(default)]
    size: u64,
    #[serde(default)]
    time: Option<ListTimes>,
}

#[derive(Deserialize, Debug)]
struct ListTimes {
    #[serde(default)]
    mtime: Option<i64>,
}

#[derive(Deserialize, Debug)]
struct TaskStarted {
    #[serde(default)]
    taskid: Option<String>,
}

#[derive(Deserialize, Debug)]
struct CopyMoveStatus {
    #[serde(default)]
    finished: bool,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct Md5Status {
    #[serde(default)]
    finished: bool,
    #[serde(default)]
    md5: Option<String>,
}

impl From<ListEntry> for RemoteFileDescriptor {
    fn from(entry: ListEntry) -> Self {
        let additional = entry.additional.unwrap_or_default();
        RemoteFileDescriptor {
            path: entry.path,
            name: entry.name,
            is_directory: entry.isdir,
            size: if entry.isdir { 0 } else { additional.size },
            modified_at_epoch_seconds: additional.time.and_then(|t| t.mtime),
        }
    }
}

// --- THE CLIENT ---

#[derive(Clone)]
pub struct FileStationClient {
    client: Client,
    base_url: String,
    sid: Option<String>,
}

impl FileStationClient {
    pub fn new(base_url: impl Into<String>, sid: Option<String>) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .connect_timeout(Duration::from_secs(15))
            .read_timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            sid,
        }
    }

    pub fn set_sid(&mut self, sid: String) {
        self.sid = Some(sid);
    }

    fn url(&self, cgi: &str) -> String {
        format!("{}/{}", self.base_url, cgi)
    }

    fn sid(&self) -> Result<&str> {
        self.sid.as_deref().ok_or(BackupError::NotAuthenticated)
    }

    fn map_error(code: i64, context: &str) -> BackupError {
        match code {
            ERR_NO_SUCH_FILE => BackupError::NotFound(context.to_string()),
            ERR_PERMISSION | ERR_NOT_PERMITTED => BackupError::PermissionDenied(context.to_string()),
            ERR_NO_SESSION => BackupError::NotAuthenticated,
            _ => BackupError::Api { code, message: context.to_string() },
        }
    }

    fn ensure_success<T>(response: ApiResponse<T>, context: &str) -> Result<Option<T>> {
        if response.success {
            Ok(response.data)
        } else {
            let code = response.error.map(|e| e.code).unwrap_or(-1);
            Err(Self::map_error(code, context))
        }
    }

    /// Calls one File Station method and decodes its `data` payload.
    async fn call<T: DeserializeOwned>(
        &self,
        api: &str,
        version: &str,
        method: &str,
        params: &[(&str, &str)],
        context: &str,
    ) -> Result<Option<T>> {
        let sid = self.sid()?;
        let mut query: Vec<(&str, &str)> =
            vec![("api", api), ("version", version), ("method", method), ("_sid", sid)];
        query.extend_from_slice(params);

        tracing::debug!("{api}.{method} {context}");
        let response = self.client.get(self.url(ENTRY)).query(&query).send().await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(BackupError::Transient(format!("{api}.{method}: HTTP {status}")));
        }
        let body: ApiResponse<T> = response.json().await?;
        Self::ensure_success(body, context)
    }

    // --- Authentication ---

    pub async fn login(&mut self, account: &str, password: &str) -> Result<String> {
        let params = [
            ("api", "SYNO.API.Auth"),
            ("version", "3"),
            ("method", "login"),
            ("account", account),
            ("passwd", password),
            ("session", "FileStation"),
            ("format", "sid"),
        ];

        let response = self.client.get(self.url(AUTH)).query(&params).send().await?;
        let api_resp: ApiResponse<LoginData> = response.json().await?;
        let data = Self::ensure_success(api_resp, "login")?
            .ok_or_else(|| BackupError::Api { code: -1, message: "No sid in login response".into() })?;

        self.sid = Some(data.sid.clone());
        Ok(data.sid)
    }

    async fn list_page(&self, path: &str, offset: u64) -> Result<ListData> {
        let offset = offset.to_string();
        let limit = LIST_PAGE.to_string();
        let data: Option<ListData> = self
            .call(
                "SYNO.FileStation.List",
                "2",
                "list",
                &[
                    ("folder_path", path),
                    ("additional", r#"["size","time"]"#),
                    ("offset", offset.as_str()),
                    ("limit", limit.as_str()),
                ],
                path,
            )
            .await?;
        Ok(data.unwrap_or(ListData { files: Vec::new(), total: 0 }))
    }
}

#[async_trait]
impl RemoteStore for FileStationClient {
    async fn list(&self, path: &str) -> Result<Vec<RemoteFileDescriptor>> {
        let mut items = Vec::new();
        loop {
            let page = self.list_page(path, items.len() as u64).await?;
            let received = page.files.len();
            items.extend(page.files.into_iter().map(RemoteFileDescriptor::from));
            if received == 0 || items.len() as u64 >= page.total {
                break;
            }
        }
        tracing::debug!("Listed {} entries in {path}", items.len());
        Ok(items)
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        let parent = parent_path(path);
        let name = file_name(path);
        let result: Result<Option<serde_json::Value>> = self
            .call(
                "SYNO.FileStation.CreateFolder",
                "2",
                "create",
                &[("folder_path", parent), ("name", name), ("force_parent", "true")],
                path,
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            // Already there is what we wanted.
            Err(BackupError::Api { code: ERR_ALREADY_EXISTS, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn move_or_copy(&self, src: &str, dest_dir: &str) -> Result<MoveStart> {
        let started: Option<TaskStarted> = self
            .call(
                "SYNO.FileStation.CopyMove",
                "3",
                "start",
                &[
                    ("path", src),
                    ("dest_folder_path", dest_dir),
                    ("overwrite", "false"),
                    ("remove_src", "true"),
                ],
                src,
            )
            .await?;

        Ok(match started.and_then(|s| s.taskid) {
            Some(id) => MoveStart::Pending(TaskHandle(id)),
            None => MoveStart::Completed,
        })
    }

    async fn poll_task(&self, handle: &TaskHandle) -> Result<TaskStatus> {
        let status: Option<CopyMoveStatus> = self
            .call(
                "SYNO.FileStation.CopyMove",
                "3",
                "status",
                &[("taskid", handle.0.as_str())],
                &handle.0,
            )
            .await?;
        let status = status.unwrap_or(CopyMoveStatus { finished: false, error: None });
        Ok(TaskStatus {
            finished: status.finished,
            success: status.finished && status.error.is_none(),
        })
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let _: Option<serde_json::Value> = self
            .call(
                "SYNO.FileStation.Delete",
                "2",
                "delete",
                &[("path", path), ("recursive", "true")],
                path,
            )
            .await?;
        Ok(())
    }

    async fn start_checksum(&self, path: &str) -> Result<TaskHandle> {
        let started: Option<TaskStarted> = self
            .call("SYNO.FileStation.MD5", "2", "start", &[("file_path", path)], path)
            .await?;
        started
            .and_then(|s| s.taskid)
            .map(TaskHandle)
            .ok_or_else(|| BackupError::Api { code: -1, message: format!("No task id for MD5 of {path}") })
    }

    async fn poll_checksum(&self, handle: &TaskHandle) -> Result<ChecksumStatus> {
        let status: Option<Md5Status> = self
            .call("SYNO.FileStation.MD5", "2", "status", &[("taskid", handle.0.as_str())], &handle.0)
            .await?;
        let status = status.unwrap_or(Md5Status { finished: false, md5: None });
        Ok(ChecksumStatus { finished: status.finished, digest: status.md5 })
    }

    async fn download_full(&self, path: &str) -> Result<ByteStream> {
        let response = self.download_request(path, None).await?;
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(BackupError::from));
        Ok(stream.boxed())
    }

    async fn download_range(&self, path: &str, start: u64, end: u64) -> Result<Bytes> {
        if end <= start {
            return Ok(Bytes::new());
        }
        let response = self.download_request(path, Some((start, end))).await?;
        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(BackupError::Api {
                code: i64::from(response.status().as_u16()),
                message: format!("range request not honoured for {path}"),
            });
        }
        Ok(response.bytes().await?)
    }
}

impl FileStationClient {
    async fn download_request(&self, path: &str, range: Option<(u64, u64)>) -> Result<reqwest::Response> {
        let sid = self.sid()?;
        let params = [
            ("api", "SYNO.FileStation.Download"),
            ("version", "2"),
            ("method", "download"),
            ("path", path),
            ("mode", "download"),
            ("_sid", sid),
        ];

        let mut request = self.client.get(self.url(ENTRY)).query(&params);
        if let Some((start, end)) = range {
            // HTTP ranges are inclusive.
            request = request.header(header::RANGE, format!("bytes={}-{}", start, end - 1));
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(BackupError::NotFound(path.to_string()));
        }
        if status.is_server_error() {
            return Err(BackupError::Transient(format!("download {path}: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(BackupError::Api {
                code: i64::from(status.as_u16()),
                message: format!("download {path}"),
            });
        }
        // Failed downloads come back as a JSON error envelope with 200.
        let is_json = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));
        if is_json {
            let body: ApiResponse<serde_json::Value> = response.json().await?;
            Self::ensure_success(body, path)?;
            return Err(BackupError::Api { code: -1, message: format!("unexpected JSON body for {path}") });
        }
        Ok(response)
    }
}
