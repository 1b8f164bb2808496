use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Категория ошибки, видимая вызывающей стороне
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    NotAllowed,
    Internal,
}

/// Ошибки операций менеджера
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not allowed: {0}")]
    NotAllowed(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn not_allowed(msg: impl Into<String>) -> Self {
        Error::NotAllowed(msg.into())
    }

    /// Оборачивает любую ошибку нижнего уровня как Internal
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Error::Internal(err.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::NotAllowed(_) => ErrorKind::NotAllowed,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Сообщение без префикса категории
    pub fn message(&self) -> &str {
        match self {
            Error::InvalidInput(m) | Error::NotFound(m) | Error::NotAllowed(m) | Error::Internal(m) => m,
        }
    }

    /// HTTP статус, в который HTTP слой отображает ошибку
    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::NotAllowed => StatusCode::FORBIDDEN,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<crate::context::ContextError> for Error {
    fn from(err: crate::context::ContextError) -> Self {
        Error::internal(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::invalid_input("x").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::not_found("x").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(Error::not_allowed("x").status_code(), StatusCode::FORBIDDEN);
        assert_eq!(Error::internal("x").status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_message_and_display() {
        let err = Error::not_found("endpoint 'abc' not found");
        assert_eq!(err.message(), "endpoint 'abc' not found");
        assert_eq!(err.to_string(), "not found: endpoint 'abc' not found");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
