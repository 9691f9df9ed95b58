//! Authentication module for signing requests and keeping the session alive.
//!
//! This module provides:
//! - `Session` / `Credential`: the renewable session and the stored login
//! - `Signer`: per-request HMAC signature headers
//! - `SessionRefresher`: token exchange or password re-login on expiry
//! - `PortalLogin`: the password login flow of the PC login portal

pub mod login;
pub mod refresh;
pub mod session;
pub mod sign;

pub use login::{LoginGrant, PasswordLogin, PortalLogin};
pub use refresh::SessionRefresher;
pub use session::{Credential, Session};
pub use sign::Signer;
