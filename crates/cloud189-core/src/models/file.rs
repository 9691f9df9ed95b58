use serde::{Deserialize, Deserializer, Serialize};

/// Folder id of the drive root.
pub const ROOT_FOLDER_ID: &str = "-11";

/// A file or folder inside a drive folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub is_folder: bool,
    /// Last modification as reported by the service, `YYYY-MM-DD HH:MM:SS`.
    pub modified: String,
}

impl FileEntry {
    /// The drive root, which the service never lists itself.
    pub fn root() -> Self {
        Self {
            id: ROOT_FOLDER_ID.to_string(),
            name: "/".to_string(),
            size: 0,
            is_folder: true,
            modified: String::new(),
        }
    }

    pub fn display_name(&self) -> String {
        if self.id == ROOT_FOLDER_ID {
            return self.name.clone();
        }
        if self.is_folder {
            format!("{}/", self.name)
        } else {
            self.name.clone()
        }
    }
}

/// Response of `listFiles.action`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListFilesResponse {
    #[serde(rename = "fileListAO")]
    pub file_list_ao: FileListAo,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FileListAo {
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub file_list: Vec<FileItem>,
    #[serde(default)]
    pub folder_list: Vec<FolderItem>,
}

impl FileListAo {
    pub fn len(&self) -> usize {
        self.file_list.len() + self.folder_list.len()
    }

    /// Folders first, then files, as the service lists them.
    pub fn into_entries(self) -> impl Iterator<Item = FileEntry> {
        self.folder_list
            .into_iter()
            .map(FileEntry::from)
            .chain(self.file_list.into_iter().map(FileEntry::from))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FileItem {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub last_op_time: String,
}

/// Folder payload, also returned by `createFolder.action`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FolderItem {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub last_op_time: String,
}

impl From<FileItem> for FileEntry {
    fn from(item: FileItem) -> Self {
        Self {
            id: item.id,
            name: item.name,
            size: item.size,
            is_folder: false,
            modified: item.last_op_time,
        }
    }
}

impl From<FolderItem> for FileEntry {
    fn from(item: FolderItem) -> Self {
        Self {
            id: item.id,
            name: item.name,
            size: 0,
            is_folder: true,
            modified: item.last_op_time,
        }
    }
}

/// Response of `getFileInfo.action`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FileInfoResponse {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, deserialize_with = "flag")]
    pub is_folder: bool,
    #[serde(default)]
    pub last_op_time: String,
}

impl From<FileInfoResponse> for FileEntry {
    fn from(info: FileInfoResponse) -> Self {
        Self {
            id: info.id,
            name: info.name,
            size: info.size,
            is_folder: info.is_folder,
            modified: info.last_op_time,
        }
    }
}

/// Response of `batch/createBatchTask.action`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BatchTaskResponse {
    #[serde(deserialize_with = "string_or_number")]
    pub task_id: String,
}

/// Response of `batch/checkBatchTask.action`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BatchTaskStatus {
    #[serde(default)]
    pub task_status: i64,
}

/// Response of `getFileDownloadUrl.action`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DownloadUrlResponse {
    pub file_download_url: String,
}

/// Ids come back as JSON numbers from some endpoints and strings from others.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

/// Flags come back as `true`/`false` or as `1`/`0`.
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Number(i64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Number(n) => n != 0,
    })
}
