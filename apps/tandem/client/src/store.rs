use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use directories::BaseDirs;
use tandem_core::{ConfigPatch, ConfigStore, SessionConfig, SyncError, SyncResult};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unable to determine home directory")]
    NoHome,
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("serialization error: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for StoreError {
    fn from(value: toml::de::Error) -> Self {
        StoreError::Toml(value.to_string())
    }
}

impl From<toml::ser::Error> for StoreError {
    fn from(value: toml::ser::Error) -> Self {
        StoreError::Toml(value.to_string())
    }
}

impl From<StoreError> for SyncError {
    fn from(value: StoreError) -> Self {
        SyncError::Config(value.to_string())
    }
}

/// Session config persisted as TOML, by default at `~/.tandem/session.toml`.
/// The file is read once and cached; every `set` rewrites it.
#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
    cache: Mutex<Option<SessionConfig>>,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn default_path() -> Result<PathBuf, StoreError> {
        let base = BaseDirs::new().ok_or(StoreError::NoHome)?;
        Ok(base.home_dir().join(".tandem").join("session.toml"))
    }

    pub fn open_default() -> Result<Self, StoreError> {
        Ok(Self::new(Self::default_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<SessionConfig, StoreError> {
        if !self.path.exists() {
            return Ok(SessionConfig::default());
        }
        let raw = fs::read_to_string(&self.path).map_err(|source| self.io_error(source))?;
        Ok(toml::from_str(&raw)?)
    }

    fn save(&self, config: &SessionConfig) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }

        let serialized = toml::to_string_pretty(config)?;
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&self.path)
            .map_err(|source| self.io_error(source))?;
        file.write_all(serialized.as_bytes())
            .map_err(|source| self.io_error(source))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))
                .map_err(|source| self.io_error(source))?;
        }
        debug!(target: "tandem::store", path = %self.path.display(), "saved session config");
        Ok(())
    }

    fn io_error(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn get(&self) -> SyncResult<SessionConfig> {
        let mut cache = self.cache.lock().await;
        if let Some(config) = cache.as_ref() {
            return Ok(config.clone());
        }
        let config = self.load()?;
        *cache = Some(config.clone());
        Ok(config)
    }

    async fn set(&self, patch: ConfigPatch) -> SyncResult<SessionConfig> {
        let mut cache = self.cache.lock().await;
        let mut config = match cache.take() {
            Some(config) => config,
            None => self.load()?,
        };
        config.merge(patch);
        let saved = self.save(&config);
        *cache = Some(config.clone());
        saved?;
        Ok(config)
    }
}
