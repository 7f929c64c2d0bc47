//! The "lock the device now" capability.

use std::path::Path;
use std::time::Duration;

use log::{error, info};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::LockConfig;
use crate::core::error::LockError;

/// Locks within this window of a successful lock are absorbed.
pub const LOCK_DEBOUNCE: Duration = Duration::from_secs(2);

/// Platform lock primitive.
///
/// `lock_now` must be idempotent: locking an already locked device, or
/// calling it in rapid succession, is not an error.
#[async_trait::async_trait]
pub trait LockGate: Send + Sync {
    async fn lock_now(&self) -> Result<(), LockError>;

    /// Whether the capability is currently granted.
    async fn is_authorized(&self) -> bool;
}

/// Locks the session by running a platform command.
pub struct CommandLockGate {
    config: LockConfig,
    last_lock: Mutex<Option<Instant>>,
}

impl CommandLockGate {
    pub fn new(config: LockConfig) -> Self {
        Self {
            config,
            last_lock: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl LockGate for CommandLockGate {
    async fn lock_now(&self) -> Result<(), LockError> {
        let mut last_lock = self.last_lock.lock().await;
        if matches!(*last_lock, Some(at) if at.elapsed() < LOCK_DEBOUNCE) {
            info!("Lock requested again within {:?}, already locked", LOCK_DEBOUNCE);
            return Ok(());
        }

        info!("Locking device");
        let status = Command::new(&self.config.program)
            .args(&self.config.args)
            .status()
            .await
            .map_err(|e| {
                error!("ERROR LOCKING DEVICE: cannot run {}: {}", self.config.program, e);
                LockError::NotAuthorized(format!("{}: {}", self.config.program, e))
            })?;

        if !status.success() {
            error!("ERROR LOCKING DEVICE: {} exited with {}", self.config.program, status);
            return Err(LockError::NotAuthorized(format!(
                "{} exited with {}",
                self.config.program, status
            )));
        }

        *last_lock = Some(Instant::now());
        Ok(())
    }

    async fn is_authorized(&self) -> bool {
        resolves_on_path(&self.config.program)
    }
}

fn resolves_on_path(program: &str) -> bool {
    let path = Path::new(program);
    if path.components().count() > 1 {
        return path.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| {
                let candidate = dir.join(program);
                candidate.is_file() || candidate.with_extension("exe").is_file()
            })
        })
        .unwrap_or(false)
}
