//! Configuration surface consumed by the core.
//!
//! Property loading proper belongs to the application; the core only needs a
//! snapshot of a handful of values and a way to ask for a reload after a
//! restore has replaced `application.properties`.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::ErrorClass;

pub const DEFAULT_KEEP_LAST: usize = 7;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ConfigError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Configuration
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub backup_enabled: bool,
    pub backup_keep_last: usize,
    pub store_enabled: bool,
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    #[serde(default)]
    pub projects_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backup_enabled: true,
            backup_keep_last: DEFAULT_KEEP_LAST,
            store_enabled: true,
            store_path: None,
            projects_dir: None,
        }
    }
}

impl Settings {
    /// Build settings from parsed properties; unknown keys are ignored and
    /// malformed values keep their defaults.
    pub fn from_properties(props: &HashMap<String, String>) -> Self {
        let mut settings = Settings::default();
        if let Some(v) = props.get("backup.enabled") {
            settings.backup_enabled = parse_bool("backup.enabled", v, settings.backup_enabled);
        }
        if let Some(v) = props.get("backup.keep_last") {
            match v.parse::<usize>() {
                Ok(n) if n > 0 => settings.backup_keep_last = n,
                _ => warn!(key = "backup.keep_last", value = %v, "invalid value; using default"),
            }
        }
        if let Some(v) = props.get("database.enabled") {
            settings.store_enabled = parse_bool("database.enabled", v, settings.store_enabled);
        }
        if let Some(v) = props.get("database.path").filter(|v| !v.is_empty()) {
            settings.store_path = Some(PathBuf::from(v));
        }
        if let Some(v) = props.get("workspace.projects_dir").filter(|v| !v.is_empty()) {
            settings.projects_dir = Some(PathBuf::from(v));
        }
        settings
    }
}

fn parse_bool(key: &str, value: &str, default: bool) -> bool {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => true,
        "false" | "no" | "0" | "off" => false,
        _ => {
            warn!(key, value, "invalid boolean; using default");
            default
        }
    }
}

/// Parse `key=value` (or `key: value`) lines. `#` and `!` start comments.
pub fn parse_properties(text: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let split = line.find(&['=', ':'][..]);
        let (key, value) = match split {
            Some(idx) => (&line[..idx], &line[idx + 1..]),
            None => (line, ""),
        };
        out.insert(key.trim().to_string(), value.trim().to_string());
    }
    out
}

/// The external configuration collaborator.
pub trait ConfigSource: Send + Sync {
    fn settings(&self) -> Settings;
    fn reload(&self) -> Result<(), ConfigError>;
}

/// Fixed settings; `reload` is a no-op.
#[derive(Debug, Default)]
pub struct StaticConfig {
    settings: RwLock<Settings>,
}

impl StaticConfig {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    pub fn set(&self, settings: Settings) {
        *self.settings.write() = settings;
    }
}

impl ConfigSource for StaticConfig {
    fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    fn reload(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

/// Settings backed by `application.properties`.
pub struct PropertiesConfig {
    path: PathBuf,
    settings: RwLock<Settings>,
}

impl PropertiesConfig {
    /// Load from `path`. A missing file yields defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let settings = Self::read(&path)?;
        Ok(Self {
            path,
            settings: RwLock::new(settings),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(path: &Path) -> Result<Settings, ConfigError> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Settings::from_properties(&parse_properties(&text))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

impl ConfigSource for PropertiesConfig {
    fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    fn reload(&self) -> Result<(), ConfigError> {
        let fresh = Self::read(&self.path)?;
        info!(path = %self.path.display(), "configuration reloaded");
        *self.settings.write() = fresh;
        Ok(())
    }
}
