pub mod settings;
pub mod store;

use serde::{Deserialize, Serialize};

use crate::config::settings::Settings;
pub use store::{FileSettingsStore, SettingsStore};

/// The key selected last, so a restarted process can relink it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedKey {
    pub id: String,
    pub name: Option<String>,
}

/// The command that locks the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for LockConfig {
    fn default() -> Self {
        let (program, args): (&str, &[&str]) = if cfg!(target_os = "windows") {
            ("rundll32.exe", &["user32.dll,LockWorkStation"])
        } else if cfg!(target_os = "macos") {
            ("pmset", &["displaysleepnow"])
        } else {
            ("loginctl", &["lock-session"])
        };
        LockConfig {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub settings: Settings,
    /// Whether the lock policy was active when the process last ran
    pub armed: bool,
    pub last_key: Option<SavedKey>,
    pub lock: LockConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(!config.lock.program.is_empty());
    }

    #[test]
    fn config_survives_json() {
        let config = AppConfig {
            armed: true,
            last_key: Some(SavedKey { id: "tag".into(), name: Some("Tag".into()) }),
            ..AppConfig::default()
        };
        let json = serde_json::to_string_pretty(&config).unwrap();
        let back: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
