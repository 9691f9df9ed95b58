//! Core library for the cloud.189.cn drive client.
//!
//! This crate contains the request signer, the refreshing API invoker, the
//! persisted session store and the drive operations, shared by any front end.

pub mod api;
pub mod auth;
pub mod config;
pub mod drive;
pub mod models;
pub mod utils;

pub use api::{ApiClient, ApiError, ApiRequest};
pub use auth::{Credential, Session, SessionRefresher, Signer};
pub use config::{Config, ConfigError, ConfigStore};
pub use drive::{Cloud189, Drive, API_BASE_URL};
pub use models::{FileEntry, Space, ROOT_FOLDER_ID};
