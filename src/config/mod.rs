use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub mod nginx_parser;
pub use nginx_parser::*;

use crate::endpoint::templates::{TemplateError, Templates};
use crate::logs::LogFileConfig;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/core-manager/config.yaml";
const ENV_PREFIX: &str = "CORE_MANAGER_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid template: {0}")]
    Template(#[from] TemplateError),
    #[error("invalid value '{value}' for {name}")]
    Env { name: String, value: String },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub endpoints_conf_path: String,
    /// compose сервис, в контейнере которого работает прокси
    pub gateway_service: String,
    pub compose_file_path: String,
    pub container: ContainerConfig,
    pub reload_cmd: Vec<String>,
    pub templates: Templates,
    pub jobs: JobsConfig,
    pub logs: LogsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,  // error, warn, info, debug, trace
    pub format: String, // json или text
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub runtime: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct JobsConfig {
    pub max_concurrent: usize,
    pub max_age_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogsConfig {
    pub files: Vec<LogFileConfig>,
    pub buffer_size: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            timeout_secs: 10,
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 20,
            max_age_secs: 172800,
        }
    }
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            buffer_size: 32768,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            endpoints_conf_path: "/opt/core/nginx/endpoints.conf".to_string(),
            gateway_service: "core-gateway".to_string(),
            compose_file_path: "/opt/core/docker-compose.yml".to_string(),
            container: ContainerConfig::default(),
            reload_cmd: vec!["nginx".to_string(), "-s".to_string(), "reload".to_string()],
            templates: Templates::default(),
            jobs: JobsConfig::default(),
            logs: LogsConfig::default(),
        }
    }
}

impl ContainerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl JobsConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl Config {
    /// Загружает конфигурацию из YAML файла; отсутствующий файл дает значения по умолчанию.
    /// Переменные окружения `CORE_MANAGER_*` имеют приоритет над файлом.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = match fs::read_to_string(path) {
            Ok(content) => Self::from_yaml(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        config.apply_env(|name| std::env::var(format!("{}{}", ENV_PREFIX, name)).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Config::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Применяет переопределения; `lookup` получает имя без префикса
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("ENDPOINTS_CONF_PATH") {
            self.endpoints_conf_path = v;
        }
        if let Some(v) = lookup("GATEWAY_SERVICE") {
            self.gateway_service = v;
        }
        if let Some(v) = lookup("COMPOSE_FILE_PATH") {
            self.compose_file_path = v;
        }
        if let Some(v) = lookup("CONTAINER_RUNTIME") {
            self.container.runtime = v;
        }
        if let Some(v) = lookup("HTTP_TIMEOUT") {
            self.container.timeout_secs = v.trim().parse().map_err(|_| ConfigError::Env {
                name: format!("{}HTTP_TIMEOUT", ENV_PREFIX),
                value: v.clone(),
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.templates.validate()?;
        if self.endpoints_conf_path.is_empty() {
            return Err(ConfigError::Invalid("endpoints_conf_path is empty".to_string()));
        }
        if self.reload_cmd.is_empty() {
            return Err(ConfigError::Invalid("reload_cmd is empty".to_string()));
        }
        if self.container.timeout_secs == 0 {
            return Err(ConfigError::Invalid("container.timeout_secs must be positive".to_string()));
        }
        Ok(())
    }
}
