use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("unknown log format '{0}' (expected json or text)")]
    Format(String),
    #[error("invalid log level '{0}': {1}")]
    Level(String, String),
    #[error("global logger already set")]
    AlreadySet,
}

/// Фильтр из RUST_LOG, иначе из уровня в конфигурации
fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| LoggingError::Level(config.level.clone(), e.to_string())),
    }
}

/// Инициализирует систему логирования. Сообщения `log` макросов
/// модулей попадают в тот же subscriber.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = env_filter(config)?;

    let result = match config.format.as_str() {
        // JSON формат для production
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .with_target(true)
            .with_writer(std::io::stderr)
            .try_init(),
        // Обычный текстовый формат для разработки
        "text" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .try_init(),
        other => return Err(LoggingError::Format(other.to_string())),
    };
    result.map_err(|_| LoggingError::AlreadySet)?;

    info!("Logging initialized with level: {}, format: {}", config.level, config.format);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_format_rejected() {
        let config = LoggingConfig {
            level: "info".to_string(),
            format: "xml".to_string(),
        };
        assert!(matches!(init_logging(&config), Err(LoggingError::Format(_))));
    }

    #[test]
    fn test_level_filter() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            format: "text".to_string(),
        };
        assert!(env_filter(&config).is_ok());
    }
}
