//! cloud189 - command-line client for 天翼云盘 (cloud.189.cn).
//!
//! The login is kept in a config file between runs; expired sessions are
//! renewed on the fly, so only the first `cloud189 login` asks for a password.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cloud189_core::utils::{format_size, truncate_string};
use cloud189_core::{ApiError, Cloud189, Config, Drive, ROOT_FOLDER_ID};

/// Log file name inside `--log-dir`
const LOG_FILE_PREFIX: &str = "cloud189.log";

/// Password source checked before prompting
const PASSWORD_ENV: &str = "CLOUD189_PASSWORD";

/// Longest file name printed by `ls`
const MAX_NAME_WIDTH: usize = 60;

#[derive(Debug, Parser)]
#[command(name = "cloud189", version, about = "天翼云盘 command-line client")]
struct Cli {
    /// Config file holding the login (default: <config dir>/cloud189/config.json)
    #[arg(long, global = true, env = "CLOUD189_CONFIG")]
    config: Option<PathBuf>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Log in with user name and password
    Login {
        #[arg(env = "CLOUD189_USERNAME")]
        username: Option<String>,
    },
    /// Forget the stored login
    Logout,
    /// Show used and available space
    Space,
    /// Show one file or folder (id, or path starting with `/`)
    Stat { target: String },
    /// List a folder (id, or path starting with `/`)
    Ls {
        #[arg(default_value = ROOT_FOLDER_ID)]
        folder: String,
    },
    /// Create a folder
    Mkdir { parent_id: String, name: String },
    /// Delete a file or folder by name
    Rm { folder_id: String, name: String },
    /// Move a file or folder into another folder (ids or paths)
    Mv { source: String, target: String },
    /// Upload a local file (up to 10 MiB)
    Upload {
        file: PathBuf,
        /// Destination folder (id, or path starting with `/`)
        #[arg(default_value = ROOT_FOLDER_ID)]
        parent: String,
    },
    /// Print a download URL for a file
    Url { file_id: String },
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_ref());

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_path().context("Could not determine config location")?,
    };
    info!(config = %config_path.display(), "cloud189 starting");

    let drive = Cloud189::open(&config_path).context("Failed to create API client")?;

    let result = run(&drive, cli.command).await;
    let flushed = flush(&drive);

    if let Err(e) = &result {
        if e.downcast_ref::<ApiError>().is_some_and(ApiError::requires_login) {
            eprintln!("Not logged in. Please run `cloud189 login` first.");
        }
    }
    result?;
    flushed
}

async fn run(drive: &Cloud189, command: Command) -> Result<()> {
    match command {
        Command::Login { username } => {
            let Some(username) = username else {
                bail!("a user name is required: cloud189 login <USERNAME>");
            };
            let password = match std::env::var(PASSWORD_ENV) {
                Ok(p) if !p.is_empty() => p,
                _ => rpassword::prompt_password("Password: ").context("Failed to read password")?,
            };
            drive.login(&username, &password).await?;
            println!("Logged in as {}", username);
        }
        Command::Logout => {
            drive.logout()?;
            println!("Logged out");
        }
        Command::Space => {
            let space = drive.space().await?;
            println!(
                "Used {} of {} ({} available)",
                format_size(space.used()),
                format_size(space.capacity),
                format_size(space.available)
            );
        }
        Command::Stat { target } => {
            let entry = drive.stat(&target).await?;
            println!("id:       {}", entry.id);
            println!("name:     {}", entry.display_name());
            if !entry.is_folder {
                println!("size:     {}", format_size(entry.size));
            }
            println!("modified: {}", entry.modified);
        }
        Command::Ls { folder } => {
            let folder_id = folder_id(drive, &folder).await?;
            for entry in drive.list(&folder_id).await? {
                let size = if entry.is_folder {
                    "-".to_string()
                } else {
                    format_size(entry.size)
                };
                println!(
                    "{:>20}  {:>10}  {:19}  {}",
                    entry.id,
                    size,
                    entry.modified,
                    truncate_string(&entry.display_name(), MAX_NAME_WIDTH)
                );
            }
        }
        Command::Mkdir { parent_id, name } => {
            let folder = drive.mkdir(&parent_id, &name).await?;
            println!("{}", folder.id);
        }
        Command::Rm { folder_id, name } => {
            let entries = drive.list(&folder_id).await?;
            let Some(entry) = entries.iter().find(|e| e.name == name) else {
                bail!("{} not found in folder {}", name, folder_id);
            };
            drive.delete(entry).await?;
            println!("Deleted {}", entry.display_name());
        }
        Command::Mv { source, target } => {
            let entry = drive.stat(&source).await?;
            let target_id = folder_id(drive, &target).await?;
            drive.move_entry(&entry, &target_id).await?;
            println!("Moved {} to {}", entry.display_name(), target);
        }
        Command::Upload { file, parent } => {
            let name = upload_name(&file)?;
            let data = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let parent_id = folder_id(drive, &parent).await?;
            let entry = drive.upload(&parent_id, &name, data).await?;
            println!("{}", entry.id);
        }
        Command::Url { file_id } => {
            println!("{}", drive.download_url(&file_id).await?);
        }
    }
    Ok(())
}

/// Folder id for `folder`, resolving paths through the drive.
async fn folder_id(drive: &Cloud189, folder: &str) -> Result<String> {
    if !folder.starts_with('/') {
        return Ok(folder.to_string());
    }
    let entry = drive.stat(folder).await?;
    if !entry.is_folder {
        bail!("{} is not a folder", folder);
    }
    Ok(entry.id)
}

fn upload_name(file: &Path) -> Result<String> {
    file.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("{} has no usable file name", file.display()))
}

/// Retry a save that failed earlier in this run, so a renewed session is
/// not lost on exit.
fn flush(drive: &Cloud189) -> Result<()> {
    if !drive.is_dirty() {
        return Ok(());
    }
    warn!("Config has unsaved changes, retrying save");
    drive.flush().context("Failed to save config")
}
