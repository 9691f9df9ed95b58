//! Data models for cloud.189.cn API responses.
//!
//! Only the fields the drive operations need are decoded; everything else in
//! the payloads is ignored.

pub mod file;
pub mod space;
pub mod upload;

pub use file::{FileEntry, ROOT_FOLDER_ID};
pub use space::Space;
