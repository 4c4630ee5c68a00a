use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use super::confirm::DEFAULT_CONFIRM_EXPIRY;
use super::title::DEFAULT_TITLE_MAX_CHARS;
use super::types::DEFAULT_SESSION_TITLE;

pub const SETTINGS_DIRECTORY_NAME: &str = "parley";
pub const SETTINGS_FILE_NAME: &str = "sync.json";
/// Environment variables with this prefix override the settings file.
pub const SETTINGS_ENV_PREFIX: &str = "PARLEY_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_confirm_expiry_ms")]
    pub confirm_expiry_ms: u64,
    #[serde(default = "default_title_max_chars")]
    pub title_max_chars: usize,
    #[serde(default = "default_session_title")]
    pub default_session_title: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            confirm_expiry_ms: default_confirm_expiry_ms(),
            title_max_chars: default_title_max_chars(),
            default_session_title: default_session_title(),
        }
    }
}

impl SyncSettings {
    pub fn confirm_expiry(&self) -> Duration {
        Duration::from_millis(self.confirm_expiry_ms)
    }

    /// Replaces zero or blank values with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.confirm_expiry_ms == 0 {
            self.confirm_expiry_ms = default_confirm_expiry_ms();
        }
        if self.title_max_chars == 0 {
            self.title_max_chars = default_title_max_chars();
        }
        self.default_session_title = if self.default_session_title.trim().is_empty() {
            default_session_title()
        } else {
            self.default_session_title.trim().to_string()
        };

        self
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<SyncSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<SyncSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: SyncSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> SyncSettings {
        if !path.exists() {
            tracing::info!(?path, "sync settings file not found, using defaults");
        }

        let figment = Figment::from(Serialized::defaults(SyncSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(SETTINGS_ENV_PREFIX));

        match figment.extract::<SyncSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(?path, %error, "failed to parse sync settings, using defaults");
                SyncSettings::default()
            }
        }
    }

    fn persist(&self, settings: &SyncSettings) -> Result<(), SettingsError> {
        write_settings_atomically(&self.config_path, settings)?;
        tracing::info!(path = ?self.config_path, "saved sync settings");
        Ok(())
    }
}

/// Writes `settings` beside `path` and renames over it, so readers never see a torn file.
fn write_settings_atomically(path: &Path, settings: &SyncSettings) -> Result<(), SettingsError> {
    if let Some(directory) = path.parent() {
        std::fs::create_dir_all(directory).context(CreateDirSnafu {
            stage: "sync-settings-create-dir",
            path: directory,
        })?;
    }

    let json = serde_json::to_vec_pretty(settings).context(SerializeConfigSnafu {
        stage: "sync-settings-serialize",
    })?;

    let staging_path = path.with_extension("json.tmp");
    std::fs::write(&staging_path, json).context(WriteFileSnafu {
        stage: "sync-settings-write-staging",
        path: &staging_path,
    })?;

    std::fs::rename(&staging_path, path).context(RenameTempFileSnafu {
        stage: "sync-settings-replace",
        from: &staging_path,
        to: path,
    })
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("cannot create sync settings directory {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot encode sync settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("cannot write sync settings to {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "cannot move staged sync settings {from:?} over {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_confirm_expiry_ms() -> u64 {
    DEFAULT_CONFIRM_EXPIRY.as_millis() as u64
}

fn default_title_max_chars() -> usize {
    DEFAULT_TITLE_MAX_CHARS
}

fn default_session_title() -> String {
    DEFAULT_SESSION_TITLE.to_string()
}
