//! Persisted credential and session record.
//!
//! The whole record lives in one JSON file, by default at
//! `~/.config/cloud189/config.json`. Every mutation is written back
//! immediately through a temp file and a rename, so a crash mid-write leaves
//! the previous file intact.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::{Credential, Session};

/// Application name used for the config directory
const APP_NAME: &str = "cloud189";

/// Config file name
const CONFIG_FILE: &str = "config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Could not find config directory")]
    NoConfigDir,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub user: Credential,
    #[serde(default)]
    pub session: Session,
    /// `SSON` cookie issued by the login portal.
    #[serde(default)]
    pub sson: String,
    #[serde(default)]
    pub auth: String,
}

impl Config {
    /// Read a config file. A missing file is an empty config.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    fn clear(&mut self) {
        self.user = Credential::default();
        self.session = Session::default();
        self.sson.clear();
        self.auth.clear();
    }
}

/// Owner of one [`Config`], shared by every request of a client handle.
///
/// Reads hand out snapshots so the signer never sees a half-updated
/// session. Writers serialize on `write_lock`, which is only held for the
/// local serialize-and-write, never across a network call.
#[derive(Debug)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    config: RwLock<Config>,
    write_lock: Mutex<()>,
    dirty: AtomicBool,
}

impl ConfigStore {
    /// Open the store at `path`. A missing or corrupt file yields an empty
    /// config so that a fresh login can proceed.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let config = match Config::load(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Failed to load config, starting empty");
                Config::default()
            }
        };
        debug!(path = %path.display(), has_session = !config.session.is_empty(), "Config opened");
        Self::with_path(Some(path), config)
    }

    /// A store that never touches the disk.
    pub fn in_memory(config: Config) -> Self {
        Self::with_path(None, config)
    }

    fn with_path(path: Option<PathBuf>, config: Config) -> Self {
        Self {
            path,
            config: RwLock::new(config),
            write_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn snapshot(&self) -> Config {
        self.config.read().clone()
    }

    pub fn session(&self) -> Session {
        self.config.read().session.clone()
    }

    pub fn credential(&self) -> Credential {
        self.config.read().user.clone()
    }

    /// True when the last save failed and memory is ahead of the file.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Apply `mutate` and persist the result.
    ///
    /// The in-memory config is updated even when the write fails; the error
    /// is returned and the store stays dirty until a later save succeeds.
    pub fn update<F>(&self, mutate: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut Config),
    {
        let _guard = self.write_lock.lock();
        let snapshot = {
            let mut config = self.config.write();
            mutate(&mut config);
            config.clone()
        };
        self.persist(&snapshot)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let _guard = self.write_lock.lock();
        let snapshot = self.snapshot();
        self.persist(&snapshot)
    }

    /// Clear credential, session and auxiliary tokens, then persist. The
    /// file ends up in the same state as a fresh install.
    pub fn logout(&self) -> Result<(), ConfigError> {
        self.update(Config::clear)
    }

    fn persist(&self, config: &Config) -> Result<(), ConfigError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        match write_atomic(path, config) {
            Ok(()) => {
                self.dirty.store(false, Ordering::Release);
                debug!(path = %path.display(), "Config saved atomically");
                Ok(())
            }
            Err(e) => {
                self.dirty.store(true, Ordering::Release);
                Err(e)
            }
        }
    }
}

/// Write `config` to a sibling temp file, fsync it, then rename over `path`.
fn write_atomic(path: &Path, config: &Config) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }

    let contents = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    let result = (|| {
        let mut file = create_private(&temp_path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result.map_err(io_err)
}

#[cfg(unix)]
fn create_private(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_private(path: &Path) -> std::io::Result<File> {
    File::create(path)
}
