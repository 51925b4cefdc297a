//! Layered configuration for the jobforge server.
//!
//! Sources, lowest precedence first:
//! 1. `jobforge.toml` (or the file named by `--config`)
//! 2. `.env` / `.env.<JOBFORGE_ENV>` and the process environment
//! 3. CLI flags, applied by the binary
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//! keepalive_secs = 30
//!
//! [database]
//! path = "jobforge.db"
//!
//! [workspace]
//! root = "/tmp/jobforge/jobs"
//! template_zip = "templates/project.zip"
//!
//! [tool]
//! command = "claude"
//! default_model = "sonnet"
//!
//! [storage]
//! backend = "s3"
//! endpoint = "localhost:9000"
//! bucket = "jobforge"
//!
//! [logging]
//! json = false
//! filter = "info,jobforge=debug"
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::errors::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "jobforge.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub workspace: WorkspaceConfig,
    pub tool: ToolConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Seconds of silence before an SSE stream sends `keepalive`.
    pub keepalive_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            keepalive_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("jobforge.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Parent of every per-job working directory.
    pub root: PathBuf,
    /// Archive unpacked into a scope's first working directory.
    pub template_zip: Option<PathBuf>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("jobforge").join("jobs"),
            template_zip: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub command: String,
    pub default_model: String,
    /// Tool configuration file checked for MCP servers.
    pub config_path: Option<PathBuf>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            default_model: "sonnet".to_string(),
            config_path: None,
        }
    }
}

impl ToolConfig {
    /// `config_path`, falling back to `~/.claude.json`.
    pub fn resolved_config_path(&self) -> Option<PathBuf> {
        self.config_path
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.join(".claude.json")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Local,
    S3,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "s3" | "minio" => Ok(Self::S3),
            _ => Err(format!("unknown storage backend '{}'", s)),
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::S3 => write!(f, "s3"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// `host:port` of the S3-compatible endpoint.
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub use_ssl: bool,
    pub bucket: String,
    pub region: String,
    /// Root directory of the local backend.
    pub local_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            endpoint: "localhost:9000".to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            use_ssl: false,
            bucket: "jobforge".to_string(),
            region: "us-east-1".to_string(),
            local_root: PathBuf::from("workspaces"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            filter: "info,jobforge=debug".to_string(),
        }
    }
}

impl Config {
    /// Parse configuration from a TOML string.
    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    /// File layer plus environment layer. An explicit `path` must exist;
    /// the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        load_dotenv();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("PORT") {
            self.server.port = parse_env("PORT", &v)?;
        }
        if let Some(v) = get("JOBFORGE_HOST") {
            self.server.host = v;
        }
        if let Some(v) = get("JOBFORGE_DB_PATH") {
            self.database.path = PathBuf::from(v);
        }
        if let Some(v) = get("JOBFORGE_WORKSPACE_ROOT") {
            self.workspace.root = PathBuf::from(v);
        }
        if let Some(v) = get("PROJECT_TEMPLATE_ZIP") {
            self.workspace.template_zip = Some(PathBuf::from(v));
        }
        if let Some(v) = get("CLAUDE_CLI_PATH") {
            self.tool.command = v;
        }
        if let Some(v) = get("JOBFORGE_DEFAULT_MODEL") {
            self.tool.default_model = v;
        }
        if let Some(v) = get("JOBFORGE_STORAGE_BACKEND") {
            self.storage.backend = parse_env("JOBFORGE_STORAGE_BACKEND", &v)?;
        }
        if let Some(v) = get("MINIO_ENDPOINT") {
            self.storage.endpoint = v;
        }
        if let Some(v) = get("MINIO_ACCESS_KEY") {
            self.storage.access_key = v;
        }
        if let Some(v) = get("MINIO_SECRET_KEY") {
            self.storage.secret_key = v;
        }
        if let Some(v) = get("MINIO_USE_SSL") {
            self.storage.use_ssl = parse_bool("MINIO_USE_SSL", &v)?;
        }
        if let Some(v) = get("MINIO_BUCKET_NAME") {
            self.storage.bucket = v;
        }
        if let Some(v) = get("MINIO_REGION") {
            self.storage.region = v;
        }
        if let Some(v) = get("LOCAL_STORAGE_PATH") {
            self.storage.local_root = PathBuf::from(v);
        }
        if let Some(v) = get("JOBFORGE_LOG_JSON") {
            self.logging.json = parse_bool("JOBFORGE_LOG_JSON", &v)?;
        }
        Ok(())
    }
}

/// Load `.env`, then `.env.<JOBFORGE_ENV>` when set. Existing variables
/// are never overwritten.
fn load_dotenv() {
    if let Err(e) = dotenvy::dotenv()
        && !e.not_found()
    {
        tracing::warn!(error = %e, "failed to load .env");
    }
    if let Ok(env) = std::env::var("JOBFORGE_ENV") {
        let file = format!(".env.{}", env);
        if let Err(e) = dotenvy::from_filename(&file)
            && !e.not_found()
        {
            tracing::warn!(file = %file, error = %e, "failed to load env file");
        }
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// `****` followed by the last four characters.
pub fn redact(secret: &str) -> String {
    let count = secret.chars().count();
    if count <= 4 {
        return "****".to_string();
    }
    let tail: String = secret.chars().skip(count - 4).collect();
    format!("****{}", tail)
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let opt = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(none)".to_string())
        };
        writeln!(f, "[server]")?;
        writeln!(f, "  host = {}", self.server.host)?;
        writeln!(f, "  port = {}", self.server.port)?;
        writeln!(f, "  keepalive_secs = {}", self.server.keepalive_secs)?;
        writeln!(f, "[database]")?;
        writeln!(f, "  path = {}", self.database.path.display())?;
        writeln!(f, "[workspace]")?;
        writeln!(f, "  root = {}", self.workspace.root.display())?;
        writeln!(f, "  template_zip = {}", opt(&self.workspace.template_zip))?;
        writeln!(f, "[tool]")?;
        writeln!(f, "  command = {}", self.tool.command)?;
        writeln!(f, "  default_model = {}", self.tool.default_model)?;
        writeln!(f, "  config_path = {}", opt(&self.tool.config_path))?;
        writeln!(f, "[storage]")?;
        writeln!(f, "  backend = {}", self.storage.backend)?;
        writeln!(f, "  endpoint = {}", self.storage.endpoint)?;
        writeln!(f, "  access_key = {}", redact(&self.storage.access_key))?;
        writeln!(f, "  secret_key = {}", redact(&self.storage.secret_key))?;
        writeln!(f, "  use_ssl = {}", self.storage.use_ssl)?;
        writeln!(f, "  bucket = {}", self.storage.bucket)?;
        writeln!(f, "  region = {}", self.storage.region)?;
        writeln!(f, "  local_root = {}", self.storage.local_root.display())?;
        writeln!(f, "[logging]")?;
        writeln!(f, "  json = {}", self.logging.json)?;
        write!(f, "  filter = {}", self.logging.filter)
    }
}
