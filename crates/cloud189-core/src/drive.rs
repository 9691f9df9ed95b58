//! The `Drive` capability and its cloud.189.cn implementation.
//!
//! Front ends only see `Drive`; every call goes through the signed
//! [`ApiClient`], so an expired session is renewed transparently.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use md5::{Digest, Md5};
use reqwest::Url;
use tracing::{debug, info};

use crate::api::{ApiClient, ApiError};
use crate::auth::{Credential, PasswordLogin, PortalLogin, SessionRefresher, Signer};
use crate::config::{Config, ConfigStore};
use crate::models::file::{
    BatchTaskResponse, BatchTaskStatus, DownloadUrlResponse, FileInfoResponse, FolderItem,
    ListFilesResponse,
};
use crate::models::upload::{CommitUploadResponse, InitUploadResponse, UploadUrlsResponse};
use crate::models::{FileEntry, Space};

/// Base URL of the PC API
pub const API_BASE_URL: &str = "https://api.cloud.189.cn";

/// Base URL of the upload service
pub const UPLOAD_BASE_URL: &str = "https://upload.cloud.189.cn";

/// Entries requested per `listFiles.action` page.
const PAGE_SIZE: &str = "1000";

/// Batch tasks report status 4 once finished.
const BATCH_TASK_DONE: i64 = 4;

const BATCH_POLL_INTERVAL_MS: u64 = 200;
const BATCH_POLL_ATTEMPTS: u32 = 30;

/// Largest file sent as a single part (10 MiB).
pub const UPLOAD_SLICE_SIZE: usize = 10 * 1024 * 1024;

/// Operations a front end can run against the drive.
///
/// Calls renew an expired session on their own. If the renewed session could
/// not be written to disk the call still succeeds; [`Drive::is_dirty`]
/// reports that state and [`Drive::flush`] retries the write.
#[async_trait]
pub trait Drive: Send + Sync {
    /// Password login; stores the credential and the new session.
    async fn login(&self, username: &str, password: &str) -> Result<(), ApiError>;

    /// Forget credential and session, persisting the cleared state.
    fn logout(&self) -> Result<(), ApiError>;

    /// True when the session in memory is newer than the one on disk.
    fn is_dirty(&self) -> bool;

    /// Write the config again if an earlier save failed.
    fn flush(&self) -> Result<(), ApiError>;

    async fn space(&self) -> Result<Space, ApiError>;

    /// Look up an entry by id, or by path when `target` starts with `/`.
    async fn stat(&self, target: &str) -> Result<FileEntry, ApiError>;

    async fn list(&self, folder_id: &str) -> Result<Vec<FileEntry>, ApiError>;

    async fn mkdir(&self, parent_id: &str, name: &str) -> Result<FileEntry, ApiError>;

    async fn delete(&self, entry: &FileEntry) -> Result<(), ApiError>;

    /// Move `entry` into the folder `target_folder_id`.
    async fn move_entry(&self, entry: &FileEntry, target_folder_id: &str) -> Result<(), ApiError>;

    /// Upload `data` as `name` into `parent_id`. Files up to
    /// [`UPLOAD_SLICE_SIZE`] are accepted.
    async fn upload(&self, parent_id: &str, name: &str, data: Vec<u8>)
        -> Result<FileEntry, ApiError>;

    async fn download_url(&self, file_id: &str) -> Result<String, ApiError>;
}

/// Drive client bound to one config record.
pub struct Cloud189 {
    store: Arc<ConfigStore>,
    client: ApiClient,
    login: Arc<dyn PasswordLogin>,
    upload_url: String,
}

impl Cloud189 {
    /// Client backed by the config file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ApiError> {
        let store = Arc::new(ConfigStore::open(path));
        Self::with_store(store, API_BASE_URL, Arc::new(PortalLogin::new()?))
    }

    /// Client whose credential lives only in memory; nothing is persisted.
    pub fn in_memory(username: &str, password: &str) -> Result<Self, ApiError> {
        let config = Config {
            user: Credential::new(username, password),
            ..Default::default()
        };
        let store = Arc::new(ConfigStore::in_memory(config));
        Self::with_store(store, API_BASE_URL, Arc::new(PortalLogin::new()?))
    }

    /// Wire a client from its parts, uploading to the public upload service.
    pub fn with_store(
        store: Arc<ConfigStore>,
        base_url: &str,
        login: Arc<dyn PasswordLogin>,
    ) -> Result<Self, ApiError> {
        let signer = Arc::new(Signer::new(Arc::clone(&store)));
        let refresher = Arc::new(SessionRefresher::new(Arc::clone(&store), Arc::clone(&login)));
        let client = ApiClient::new(base_url, signer, refresher)?;
        Ok(Self {
            store,
            client,
            login,
            upload_url: UPLOAD_BASE_URL.to_string(),
        })
    }

    /// Like [`Cloud189::with_store`] with a custom upload service.
    pub fn with_urls(
        store: Arc<ConfigStore>,
        base_url: &str,
        upload_url: &str,
        login: Arc<dyn PasswordLogin>,
    ) -> Result<Self, ApiError> {
        let parsed = Url::parse(upload_url)
            .map_err(|e| ApiError::InvalidInput(format!("upload URL {}: {}", upload_url, e)))?;
        let signer = Arc::new(Signer::with_upload_url(Arc::clone(&store), &parsed));
        let refresher = Arc::new(SessionRefresher::new(Arc::clone(&store), Arc::clone(&login)));
        let client = ApiClient::new(base_url, signer, refresher)?;
        Ok(Self {
            store,
            client,
            login,
            upload_url: upload_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    fn upload_endpoint(&self, path: &str) -> String {
        format!("{}{}", self.upload_url, path)
    }

    /// Walk `path` from the root one folder listing at a time.
    async fn resolve(&self, path: &str) -> Result<FileEntry, ApiError> {
        let mut current = FileEntry::root();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if !current.is_folder {
                return Err(ApiError::NotFound(path.to_string()));
            }
            current = self
                .list(&current.id)
                .await?
                .into_iter()
                .find(|e| e.name == segment)
                .ok_or_else(|| ApiError::NotFound(path.to_string()))?;
        }
        Ok(current)
    }

    /// Create a batch task for `entry` and wait for it to finish.
    async fn run_batch_task(
        &self,
        kind: &str,
        entry: &FileEntry,
        target_folder_id: &str,
    ) -> Result<(), ApiError> {
        let task_infos = serde_json::json!([{
            "fileId": entry.id,
            "fileName": entry.name,
            "isFolder": if entry.is_folder { 1 } else { 0 },
        }])
        .to_string();

        let task: BatchTaskResponse = self
            .client
            .post(
                "/batch/createBatchTask.action",
                &[
                    ("type", kind),
                    ("taskInfos", task_infos.as_str()),
                    ("targetFolderId", target_folder_id),
                ],
            )
            .await?;

        for _ in 0..BATCH_POLL_ATTEMPTS {
            let status: BatchTaskStatus = self
                .client
                .post(
                    "/batch/checkBatchTask.action",
                    &[("type", kind), ("taskId", task.task_id.as_str())],
                )
                .await?;
            if status.task_status == BATCH_TASK_DONE {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(BATCH_POLL_INTERVAL_MS)).await;
        }

        Err(ApiError::Service {
            code: "BatchTaskTimeout".to_string(),
            message: format!("{} task {} did not finish", kind, task.task_id),
        })
    }
}

#[async_trait]
impl Drive for Cloud189 {
    async fn login(&self, username: &str, password: &str) -> Result<(), ApiError> {
        let credential = Credential::new(username, password);
        let grant = self.login.login(&self.client, &credential).await?;

        self.store.update(|config| {
            config.user = credential;
            config.session = grant.session;
            if let Some(sson) = grant.sson {
                config.sson = sson;
            }
        })?;
        info!(user = %username, "Logged in");
        Ok(())
    }

    fn logout(&self) -> Result<(), ApiError> {
        self.store.logout()?;
        info!("Logged out");
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        self.store.is_dirty()
    }

    fn flush(&self) -> Result<(), ApiError> {
        if self.store.is_dirty() {
            self.store.save()?;
            info!("Unsaved session written");
        }
        Ok(())
    }

    async fn space(&self) -> Result<Space, ApiError> {
        self.client.get("/getUserInfo.action", &[]).await
    }

    async fn stat(&self, target: &str) -> Result<FileEntry, ApiError> {
        if target.starts_with('/') {
            return self.resolve(target).await;
        }
        let info: FileInfoResponse = self
            .client
            .get("/getFileInfo.action", &[("fileId", target)])
            .await?;
        Ok(info.into())
    }

    async fn list(&self, folder_id: &str) -> Result<Vec<FileEntry>, ApiError> {
        let mut entries = Vec::new();
        let mut page = 1u32;

        loop {
            let page_num = page.to_string();
            let resp: ListFilesResponse = self
                .client
                .get(
                    "/listFiles.action",
                    &[
                        ("folderId", folder_id),
                        ("fileType", "0"),
                        ("mediaAttr", "0"),
                        ("iconOption", "5"),
                        ("orderBy", "filename"),
                        ("descending", "false"),
                        ("pageNum", page_num.as_str()),
                        ("pageSize", PAGE_SIZE),
                    ],
                )
                .await?;

            let listing = resp.file_list_ao;
            let total = listing.count;
            let received = listing.len();
            entries.extend(listing.into_entries());
            debug!(folder_id, page, received, total, "Listed page");

            if received == 0 || entries.len() >= total {
                break;
            }
            page += 1;
        }

        Ok(entries)
    }

    async fn mkdir(&self, parent_id: &str, name: &str) -> Result<FileEntry, ApiError> {
        let folder: FolderItem = self
            .client
            .post(
                "/createFolder.action",
                &[
                    ("parentFolderId", parent_id),
                    ("folderName", name),
                    ("relativePath", ""),
                ],
            )
            .await?;
        Ok(folder.into())
    }

    async fn delete(&self, entry: &FileEntry) -> Result<(), ApiError> {
        self.run_batch_task("DELETE", entry, "").await?;
        info!(id = %entry.id, name = %entry.name, "Deleted");
        Ok(())
    }

    async fn move_entry(&self, entry: &FileEntry, target_folder_id: &str) -> Result<(), ApiError> {
        if entry.id == target_folder_id {
            return Err(ApiError::InvalidInput(format!(
                "cannot move {} into itself",
                entry.name
            )));
        }
        self.run_batch_task("MOVE", entry, target_folder_id).await?;
        info!(id = %entry.id, name = %entry.name, target = target_folder_id, "Moved");
        Ok(())
    }

    async fn upload(
        &self,
        parent_id: &str,
        name: &str,
        data: Vec<u8>,
    ) -> Result<FileEntry, ApiError> {
        if data.len() > UPLOAD_SLICE_SIZE {
            return Err(ApiError::InvalidInput(format!(
                "{} is {} bytes, single-part uploads are limited to {} bytes",
                name,
                data.len(),
                UPLOAD_SLICE_SIZE
            )));
        }

        let digest = Md5::digest(&data);
        let file_md5 = hex::encode_upper(&digest[..]);
        let file_size = data.len().to_string();
        let slice_size = UPLOAD_SLICE_SIZE.to_string();

        let init: InitUploadResponse = self
            .client
            .get(
                &self.upload_endpoint("/person/initMultiUpload"),
                &[
                    ("parentFolderId", parent_id),
                    ("fileName", name),
                    ("fileSize", file_size.as_str()),
                    ("sliceSize", slice_size.as_str()),
                    ("fileMd5", file_md5.as_str()),
                    ("sliceMd5", file_md5.as_str()),
                ],
            )
            .await?;
        let upload_id = init.data.upload_file_id.clone();

        if init.data.already_stored() {
            debug!(name, "Content already stored, skipping transfer");
        } else {
            let part_info = format!(
                "1-{}",
                base64::engine::general_purpose::STANDARD.encode(&digest[..])
            );
            let urls: UploadUrlsResponse = self
                .client
                .get(
                    &self.upload_endpoint("/person/getMultiUploadUrls"),
                    &[
                        ("uploadFileId", upload_id.as_str()),
                        ("partInfo", part_info.as_str()),
                    ],
                )
                .await?;
            let part = urls.part(1).ok_or_else(|| {
                ApiError::InvalidResponse("no upload URL for part 1".to_string())
            })?;
            self.client
                .put_part(&part.request_url, &part.headers(), data)
                .await?;
        }

        let commit: CommitUploadResponse = self
            .client
            .get(
                &self.upload_endpoint("/person/commitMultiUploadFile"),
                &[
                    ("uploadFileId", upload_id.as_str()),
                    ("fileMd5", file_md5.as_str()),
                    ("sliceMd5", file_md5.as_str()),
                    ("lazyCheck", "1"),
                ],
            )
            .await?;

        info!(name, parent_id, "Uploaded");
        Ok(commit.file.into())
    }

    async fn download_url(&self, file_id: &str) -> Result<String, ApiError> {
        let resp: DownloadUrlResponse = self
            .client
            .get(
                "/getFileDownloadUrl.action",
                &[("fileId", file_id), ("dt", "3"), ("flag", "1")],
            )
            .await?;
        Ok(resp.file_download_url.replace("&amp;", "&"))
    }
}
