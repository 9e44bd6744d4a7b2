//! `ship.toml`: what to build and where to run it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

pub const DEFAULT_PATH: &str = "ship.toml";
pub const DEFAULT_BOOTSTRAP_SCRIPT: &str = "scripts/setup.sh";
const DEFAULT_CONTAINER_PORT: u16 = 3000;
const DEFAULT_SSH_PORT: u16 = 22;
// Installing docker and using its socket straight after needs root.
const DEFAULT_SSH_USER: &str = "root";

const TEMPLATE: &str = r#"# Image name, without registry or tag. The tag is the git commit hash.
image = "myapp"

# Docker build context, relative to this file.
context = "."

# Container name on the server.
service = "myapp"

# Port the container listens on. Published on the same host port.
port = 3000

# Only the first server is used.
servers = ["203.0.113.10"]

# Installs docker on a server that doesn't have it. Must be idempotent.
bootstrap_script = "scripts/setup.sh"

# Deployed versions are appended here.
ledger = "ship.lock"

[registry]
server = "docker.io/myname"
# username = "myname"
# password = "..."

[ssh]
port = 22
# Must be root: the provisioning script refuses anyone else.
user = "root"
"#;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file {} not found. Run `ship init` first.", .0.display())]
    NotFound(PathBuf),

    #[error("could not read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not parse {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{}: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },

    #[error("{} already exists", .0.display())]
    AlreadyExists(PathBuf),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub image: String,
    #[serde(default = "default_context")]
    pub context: PathBuf,
    pub service: String,
    #[serde(default = "default_container_port")]
    pub port: u16,
    pub servers: Vec<String>,
    #[serde(default = "default_bootstrap_script")]
    pub bootstrap_script: PathBuf,
    #[serde(default = "default_ledger")]
    pub ledger: PathBuf,
    pub registry: Registry,
    #[serde(default)]
    pub ssh: Ssh,

    // directory holding the config file, relative paths hang off this
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Registry {
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Ssh {
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: Option<String>,
}

impl Default for Ssh {
    fn default() -> Self {
        Ssh {
            port: DEFAULT_SSH_PORT,
            user: None,
        }
    }
}

fn default_context() -> PathBuf {
    PathBuf::from(".")
}

fn default_container_port() -> u16 {
    DEFAULT_CONTAINER_PORT
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_bootstrap_script() -> PathBuf {
    PathBuf::from(DEFAULT_BOOTSTRAP_SCRIPT)
}

fn default_ledger() -> PathBuf {
    PathBuf::from("ship.lock")
}

pub fn exists(path: &Path) -> bool {
    path.is_file()
}

pub fn read(path: &Path) -> Result<Config, ConfigError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(ConfigError::NotFound(path.to_path_buf()))
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let mut config: Config = toml::from_str(&content).map_err(|source| ConfigError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;
    config.base_dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    config.validate(path)?;
    Ok(config)
}

// Refuses to overwrite.
pub fn write_template(path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        return Err(ConfigError::AlreadyExists(path.to_path_buf()));
    }
    fs::write(path, TEMPLATE).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

impl Config {
    fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        if self.image.trim().is_empty() {
            return Err(invalid("image must not be empty"));
        }
        if self.service.trim().is_empty() {
            return Err(invalid("service must not be empty"));
        }
        if self.registry.server.trim().is_empty() {
            return Err(invalid("registry.server must not be empty"));
        }
        if self.servers.first().map_or(true, |s| s.trim().is_empty()) {
            return Err(invalid("servers needs at least one host"));
        }
        if self.port == 0 || self.ssh.port == 0 {
            return Err(invalid("ports must be non-zero"));
        }
        Ok(())
    }

    pub fn server(&self) -> &str {
        // validate guarantees one
        self.servers.first().map(String::as_str).unwrap_or_default()
    }

    pub fn ssh_user(&self) -> &str {
        self.ssh.user.as_deref().unwrap_or(DEFAULT_SSH_USER)
    }

    // Both halves, or nothing.
    pub fn registry_credentials(&self) -> Option<(&str, &str)> {
        match (&self.registry.username, &self.registry.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }

    pub fn context_path(&self) -> PathBuf {
        self.base_dir.join(&self.context)
    }

    pub fn bootstrap_script_path(&self) -> PathBuf {
        self.base_dir.join(&self.bootstrap_script)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.base_dir.join(&self.ledger)
    }
}
