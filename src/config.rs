use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default stylesheet used for both input and output when nothing is configured.
pub const DEFAULT_STYLESHEET: &str = "app.css";

/// Top-level config file, loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Watcher options (`[tailwindcss]`).
    #[serde(default)]
    pub tailwindcss: WatcherConfig,
    /// HTTP server and process-control options (`[server]`).
    #[serde(default)]
    pub server: ServerConfig,
}

/// Options for the Tailwind CSS watch process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Input stylesheet, relative to the content root.
    pub input_path: String,
    /// Output file name, written under `<content root>/wwwroot`.
    pub output_file_name: String,
    pub enable_in_development: bool,
    pub enable_in_production: bool,
    /// Extra CLI arguments appended verbatim after the generated ones.
    pub additional_arguments: Vec<String>,
    /// Tailwind config file passed through `--config`.
    pub config_path: Option<String>,
    pub enable_minify: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            input_path: DEFAULT_STYLESHEET.to_string(),
            output_file_name: DEFAULT_STYLESHEET.to_string(),
            enable_in_development: true,
            enable_in_production: false,
            additional_arguments: Vec::new(),
            config_path: None,
            enable_minify: false,
        }
    }
}

impl WatcherConfig {
    /// Whether the watcher should run in the given environment.
    pub fn enabled_for(&self, environment: Environment) -> bool {
        match environment {
            Environment::Development => self.enable_in_development,
            Environment::Production => self.enable_in_production,
            Environment::Staging => false,
        }
    }

    /// Output name with the default applied to an empty value.
    pub fn artifact_name(&self) -> &str {
        if self.output_file_name.is_empty() {
            DEFAULT_STYLESHEET
        } else {
            &self.output_file_name
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Package runner used to launch the Tailwind CLI.
    pub runner: String,
    /// How long the watcher gets to exit after SIGTERM before SIGKILL.
    pub grace_period_ms: u64,
    /// Upper bound on closing all client connections at shutdown.
    pub close_timeout_ms: u64,
    /// Upper bound on a single frame send to one client.
    pub send_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 5055)),
            runner: "npx".to_string(),
            grace_period_ms: 3000,
            close_timeout_ms: 5000,
            send_timeout_ms: 5000,
        }
    }
}

impl ServerConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Execution environment of the hosting service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        };
        f.write_str(name)
    }
}

impl Config {
    /// Load config from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        Self::parse(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

/// Errors that can occur when loading config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {}", .0.display(), .1)]
    ReadFailed(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config {}: {}", .0.display(), .1)]
    ParseFailed(PathBuf, #[source] toml::de::Error),
}
