//! REST API invoker for the cloud.189.cn services.
//!
//! This module provides the `ApiClient`, which signs every outbound call,
//! classifies the reply, and renews an expired session through a pluggable
//! `Refresh` hook before retrying once.

pub mod client;
pub mod error;

pub use client::{ApiClient, ApiRequest, NoopPrepare, Prepare, Refresh};
pub use error::ApiError;
