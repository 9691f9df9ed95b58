use std::collections::HashMap;

use serde::Deserialize;

use super::file::string_or_number;
use super::FileEntry;

/// Response of `person/initMultiUpload`
#[derive(Debug, Deserialize)]
pub(crate) struct InitUploadResponse {
    pub data: InitUploadData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InitUploadData {
    #[serde(deserialize_with = "string_or_number")]
    pub upload_file_id: String,
    /// 1 when the service already holds content with this checksum.
    #[serde(default)]
    pub file_data_exists: i64,
}

impl InitUploadData {
    pub fn already_stored(&self) -> bool {
        self.file_data_exists == 1
    }
}

/// Response of `person/getMultiUploadUrls`, keyed by `partNumber_<n>`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadUrlsResponse {
    #[serde(default)]
    pub upload_urls: HashMap<String, PartUploadUrl>,
}

impl UploadUrlsResponse {
    pub fn part(&self, number: usize) -> Option<&PartUploadUrl> {
        self.upload_urls.get(&format!("partNumber_{}", number))
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct PartUploadUrl {
    #[serde(rename = "requestURL")]
    pub request_url: String,
    /// Headers to send with the part, as `name=value&name=value`.
    #[serde(rename = "requestHeader", default)]
    pub request_header: String,
}

impl PartUploadUrl {
    pub fn headers(&self) -> Vec<(String, String)> {
        self.request_header
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }
}

/// Response of `person/commitMultiUploadFile`
#[derive(Debug, Deserialize)]
pub(crate) struct CommitUploadResponse {
    pub file: CommittedFile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CommittedFile {
    #[serde(deserialize_with = "string_or_number")]
    pub user_file_id: String,
    pub file_name: String,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub create_date: String,
}

impl From<CommittedFile> for FileEntry {
    fn from(file: CommittedFile) -> Self {
        Self {
            id: file.user_file_id,
            name: file.file_name,
            size: file.file_size,
            is_folder: false,
            modified: file.create_date,
        }
    }
}
