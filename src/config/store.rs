use std::path::{Path, PathBuf};

use anyhow::Result;
use log::{error, info, warn};
use tokio::fs;
use tokio::sync::{Mutex, watch};

use crate::config::settings::Settings;
use crate::config::{AppConfig, SavedKey};

pub const CONFIG_FILE_NAME: &str = "proximity_lock.json";

/// Live source of settings plus the persisted armed flag.
#[async_trait::async_trait]
pub trait SettingsStore: Send + Sync {
    /// Settings as they change; readers see the newest value on their next read.
    fn subscribe(&self) -> watch::Receiver<Settings>;

    /// Records whether the lock policy is active, so a restart can resume it.
    async fn persist_armed(&self, armed: bool) -> Result<()>;
}

/// JSON file backed store.
pub struct FileSettingsStore {
    path: PathBuf,
    config: Mutex<AppConfig>,
    settings: watch::Sender<Settings>,
}

impl FileSettingsStore {
    /// Loads the config from `path`, using defaults if the file does not exist.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config = Self::load_config(&path).await?;
        let (settings, _) = watch::channel(config.settings);
        Ok(Self {
            path,
            config: Mutex::new(config),
            settings,
        })
    }

    async fn load_config(file_path: &Path) -> Result<AppConfig> {
        if !file_path.exists() {
            warn!("Config file not found at {:?}, using default.", file_path);
            return Ok(AppConfig::default());
        }

        let config_json = fs::read_to_string(file_path).await?;
        let mut config: AppConfig = serde_json::from_str(&config_json)?;
        config.settings = config.settings.clamped();

        info!("Config loaded from {:?}", file_path);
        Ok(config)
    }

    async fn write(&self, config: &AppConfig) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }

        let config_json = match serde_json::to_string_pretty(config) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(&self.path, config_json).await?;
        info!("Config saved to {:?}.", self.path);
        Ok(())
    }

    pub async fn config(&self) -> AppConfig {
        self.config.lock().await.clone()
    }

    /// Applies `f` to the settings, clamps, publishes and saves them.
    pub async fn update_settings(&self, f: impl FnOnce(&mut Settings)) -> Result<Settings> {
        let mut config = self.config.lock().await;
        let mut settings = config.settings;
        f(&mut settings);
        let settings = settings.clamped();

        config.settings = settings;
        self.settings.send_replace(settings);
        info!("Settings updated: {:?}", settings);
        self.write(&config).await?;
        Ok(settings)
    }

    pub async fn set_last_key(&self, key: Option<SavedKey>) -> Result<()> {
        let mut config = self.config.lock().await;
        if config.last_key == key {
            return Ok(());
        }
        config.last_key = key;
        self.write(&config).await
    }
}

#[async_trait::async_trait]
impl SettingsStore for FileSettingsStore {
    fn subscribe(&self) -> watch::Receiver<Settings> {
        self.settings.subscribe()
    }

    async fn persist_armed(&self, armed: bool) -> Result<()> {
        let mut config = self.config.lock().await;
        if config.armed == armed {
            return Ok(());
        }
        config.armed = armed;
        self.write(&config).await
    }
}
