use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_SQL_PORT: u16 = 3306;
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Keys recognised in a saved connection group.
pub mod keys {
    pub const HOST: &str = "host";
    pub const PORT: &str = "port";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
    pub const DRIVER_NAME: &str = "driverName";
    pub const DATABASE_NAME: &str = "databaseName";
    pub const USE_SSH_TUNNEL: &str = "useSshTunnel";
    pub const SSH_HOST: &str = "sshHost";
    pub const SSH_PORT: &str = "sshPort";
    pub const SSH_USERNAME: &str = "sshUsername";
    pub const SSH_KEY_PATH: &str = "sshKeyPath";
    pub const SSH_PASSWORD: &str = "sshPassword";
}

/// Opaque key/value group describing one saved connection.
pub trait ConfigSource {
    fn get(&self, key: &str) -> Option<String>;

    fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

impl<T: ConfigSource + ?Sized> ConfigSource for &T {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }
}

impl ConfigSource for BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        BTreeMap::get(self, key).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshAuth {
    Key(PathBuf),
    Password(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub driver_name: String,
    pub database_name: String,
    pub ssh: Option<SshConfig>,
}

impl ConnectionConfig {
    /// Direct (untunneled) configuration with the default SQL port.
    #[must_use]
    pub fn new(
        driver_name: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SQL_PORT,
            username: username.into(),
            password: String::new(),
            driver_name: driver_name.into(),
            database_name: String::new(),
            ssh: None,
        }
    }

    #[must_use]
    pub fn from_source(source: &impl ConfigSource) -> Self {
        let text = |key: &str| source.get(key).unwrap_or_default();

        let ssh = parse_bool(source.get(keys::USE_SSH_TUNNEL).as_deref()).then(|| {
            let auth = if source.contains(keys::SSH_KEY_PATH) {
                SshAuth::Key(PathBuf::from(text(keys::SSH_KEY_PATH)))
            } else {
                SshAuth::Password(text(keys::SSH_PASSWORD))
            };
            SshConfig {
                host: text(keys::SSH_HOST),
                port: parse_port(source.get(keys::SSH_PORT).as_deref(), DEFAULT_SSH_PORT),
                username: text(keys::SSH_USERNAME),
                auth,
            }
        });

        Self {
            host: text(keys::HOST),
            port: parse_port(source.get(keys::PORT).as_deref(), DEFAULT_SQL_PORT),
            username: text(keys::USERNAME),
            password: text(keys::PASSWORD),
            driver_name: text(keys::DRIVER_NAME),
            database_name: text(keys::DATABASE_NAME),
            ssh,
        }
    }

    #[must_use]
    pub fn use_ssh_tunnel(&self) -> bool {
        self.ssh.is_some()
    }
}

fn parse_port(raw: Option<&str>, default: u16) -> u16 {
    match raw.and_then(|value| value.trim().parse::<u16>().ok()) {
        Some(0) | None => default,
        Some(port) => port,
    }
}

fn parse_bool(raw: Option<&str>) -> bool {
    match raw.map(str::trim) {
        None | Some("") => false,
        Some(value) => !(value == "0" || value.eq_ignore_ascii_case("false")),
    }
}

/// One `[connections.<name>]` table of a profiles file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileGroup {
    entries: BTreeMap<String, toml::Value>,
}

impl ProfileGroup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<toml::Value>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }
}

impl ConfigSource for ProfileGroup {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|value| match value {
            toml::Value::String(text) => text.clone(),
            other => other.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum ProfilesError {
    #[error("config directory is unavailable for this platform")]
    ConfigDirUnavailable,
    #[error("failed to read profiles file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse profiles file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to create config directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize profiles: {source}")]
    Serialize {
        #[source]
        source: toml::ser::Error,
    },
    #[error("failed to write profiles file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProfilesDocument {
    #[serde(default)]
    connections: BTreeMap<String, ProfileGroup>,
}

#[derive(Debug, Clone)]
pub struct FileProfilesStore {
    path: PathBuf,
    connections: BTreeMap<String, ProfileGroup>,
}

impl FileProfilesStore {
    pub fn load_default() -> Result<Self, ProfilesError> {
        let path = default_profiles_path()?;
        Self::load_from_path(path)
    }

    pub fn load_from_path(path: impl Into<PathBuf>) -> Result<Self, ProfilesError> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self {
                path,
                connections: BTreeMap::new(),
            });
        }

        let raw = fs::read_to_string(&path).map_err(|source| ProfilesError::Read {
            path: path.clone(),
            source,
        })?;

        if raw.trim().is_empty() {
            return Ok(Self {
                path,
                connections: BTreeMap::new(),
            });
        }

        let doc: ProfilesDocument =
            toml::from_str(&raw).map_err(|source| ProfilesError::Parse {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            connections: doc.connections,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.connections.keys().map(String::as_str)
    }

    #[must_use]
    pub fn profile(&self, name: &str) -> Option<&ProfileGroup> {
        self.connections.get(name)
    }

    pub fn upsert_profile(&mut self, name: impl Into<String>, group: ProfileGroup) {
        self.connections.insert(name.into(), group);
    }

    #[must_use]
    pub fn delete_profile(&mut self, name: &str) -> bool {
        self.connections.remove(name).is_some()
    }

    pub fn persist(&self) -> Result<(), ProfilesError> {
        if let Some(parent_dir) = self.path.parent() {
            fs::create_dir_all(parent_dir).map_err(|source| ProfilesError::CreateDir {
                path: parent_dir.to_path_buf(),
                source,
            })?;
        }

        let doc = ProfilesDocument {
            connections: self.connections.clone(),
        };
        let rendered =
            toml::to_string_pretty(&doc).map_err(|source| ProfilesError::Serialize { source })?;

        fs::write(&self.path, rendered).map_err(|source| ProfilesError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

pub fn default_profiles_path() -> Result<PathBuf, ProfilesError> {
    let base_dir = if let Some(custom) = env::var_os("SQLPANE_CONFIG_DIR") {
        PathBuf::from(custom)
    } else if cfg!(target_os = "windows") {
        env::var_os("APPDATA")
            .map(PathBuf::from)
            .ok_or(ProfilesError::ConfigDirUnavailable)?
    } else if let Some(xdg_config_home) = env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config_home)
    } else {
        let home = env::var_os("HOME").ok_or(ProfilesError::ConfigDirUnavailable)?;
        PathBuf::from(home).join(".config")
    };

    Ok(base_dir.join("sqlpane").join("profiles.toml"))
}
