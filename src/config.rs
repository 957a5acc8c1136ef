//! Process-wide configuration: defaults, optional TOML file, `OMNI_`-prefixed
//! env overrides, and `OMNI_*_FILE` secret indirection.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: i64,
    #[serde(default)]
    pub include_sensitive: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: default_retention_days(),
            max_payload_bytes: default_max_payload_bytes(),
            include_sensitive: false,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_retention_days() -> i64 {
    30
}
fn default_max_payload_bytes() -> i64 {
    1_048_576
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CorsConfig {
    #[serde(default)]
    pub origins: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub credentials: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Master API key for admin calls and the legacy webhook (spec.md §6).
    pub api_key: String,
    pub database_url: Option<String>,
    pub data_dir: PathBuf,
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub cors: CorsConfig,
    /// Directory holding `sockets/core-{instance}.sock` and
    /// `sockets/discord-{instance}.sock` (spec.md §6 Filesystem).
    pub run_dir: PathBuf,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Config {
    /// Loads config from (ascending priority) built-in defaults, an optional
    /// TOML file, then `OMNI_`-prefixed environment variables, resolving any
    /// `OMNI_*_FILE` indirection for secret fields last so a file always wins
    /// over a plaintext value of the same key (spec.md §6 Configuration
    /// surface, SPEC_FULL.md §6 Configuration loading).
    pub fn load(toml_path: Option<&Path>) -> crate::error::Result<Self> {
        let data_dir = default_data_dir();

        let mut builder = config::Config::builder()
            .set_default("data_dir", data_dir.to_string_lossy().to_string())
            .map_err(|e| ConfigError::Other(e.into()))?
            .set_default("run_dir", data_dir.join("run").to_string_lossy().to_string())
            .map_err(|e| ConfigError::Other(e.into()))?
            .set_default("timezone", default_timezone())
            .map_err(|e| ConfigError::Other(e.into()))?;

        if let Some(path) = toml_path {
            builder = builder.add_source(config::File::from(path).required(false));
        } else {
            let default_path = data_dir.join("config.toml");
            builder = builder.add_source(config::File::from(default_path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("OMNI")
                .separator("__")
                .try_parsing(true),
        );

        let raw: config::Config = builder
            .build()
            .map_err(|e| ConfigError::Load {
                path: toml_path.map(|p| p.display().to_string()).unwrap_or_default(),
                source: std::sync::Arc::new(std::io::Error::other(e.to_string())),
            })?;

        let mut cfg: Config = raw
            .try_deserialize()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        resolve_file_indirection(&mut cfg.api_key, "OMNI_API_KEY_FILE")?;

        cfg.validate()?;
        std::fs::create_dir_all(&cfg.data_dir)
            .map_err(|e| ConfigError::Load { path: cfg.data_dir.display().to_string(), source: std::sync::Arc::new(e) })?;
        std::fs::create_dir_all(cfg.sockets_dir())
            .map_err(|e| ConfigError::Load { path: cfg.run_dir.display().to_string(), source: std::sync::Arc::new(e) })?;

        Ok(cfg)
    }

    fn validate(&self) -> crate::error::Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::MissingKey("api_key".into()).into());
        }
        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(ConfigError::Invalid(format!("unknown timezone: {}", self.timezone)).into());
        }
        Ok(())
    }

    /// Parsed `timezone`, for timestamp rendering only (spec.md §6) — storage
    /// and all internal comparisons stay UTC. Falls back to UTC since
    /// `timezone` is re-validated at load time and this is only reached with
    /// already-validated config in practice.
    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or(chrono_tz::UTC)
    }

    pub fn sqlite_database_path(&self) -> PathBuf {
        self.data_dir.join("omni.db")
    }

    pub fn resolved_database_url(&self) -> String {
        self.database_url
            .clone()
            .unwrap_or_else(|| format!("sqlite://{}", self.sqlite_database_path().display()))
    }

    pub fn sockets_dir(&self) -> PathBuf {
        self.run_dir.join("sockets")
    }

    pub fn core_socket_path(&self, instance: &str) -> PathBuf {
        self.sockets_dir().join(format!("core-{instance}.sock"))
    }

    pub fn discord_socket_path(&self, instance: &str) -> PathBuf {
        self.sockets_dir().join(format!("discord-{instance}.sock"))
    }
}

/// Reads `$OMNI_*_FILE` and, if set, replaces `field` with the file's
/// trimmed contents — lets secrets live outside plaintext config.
fn resolve_file_indirection(field: &mut String, env_var: &str) -> crate::error::Result<()> {
    if let Ok(path) = std::env::var(env_var) {
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Load { path: path.clone(), source: std::sync::Arc::new(e) })?;
        *field = contents.trim().to_string();
    }
    Ok(())
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("automagik-omni")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_api_key() {
        let cfg = Config {
            api_key: "".into(),
            database_url: None,
            data_dir: PathBuf::from("/tmp/omni-test"),
            trace: TraceConfig::default(),
            timezone: default_timezone(),
            cors: CorsConfig::default(),
            run_dir: PathBuf::from("/tmp/omni-test/run"),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn resolved_database_url_falls_back_to_sqlite_path() {
        let cfg = Config {
            api_key: "k".into(),
            database_url: None,
            data_dir: PathBuf::from("/tmp/omni-test"),
            trace: TraceConfig::default(),
            timezone: default_timezone(),
            cors: CorsConfig::default(),
            run_dir: PathBuf::from("/tmp/omni-test/run"),
        };
        assert!(cfg.resolved_database_url().starts_with("sqlite://"));
    }
}
