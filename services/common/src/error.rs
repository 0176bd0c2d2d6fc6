//! Unified error type for the control plane and the edge node.

use thiserror::Error;

/// Result alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Already exists: {entity} with {field} = {value}")]
    AlreadyExists {
        entity: String,
        field: String,
        value: String,
    },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("External service error: {service} - {message}")]
    ExternalService { service: String, message: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found<E: Into<String>, I: Into<String>>(entity: E, id: I) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn already_exists<E: Into<String>, F: Into<String>, V: Into<String>>(
        entity: E,
        field: F,
        value: V,
    ) -> Self {
        Error::AlreadyExists {
            entity: entity.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        Error::Unauthorized(msg.into())
    }

    pub fn resource_exhausted<S: Into<String>>(msg: S) -> Self {
        Error::ResourceExhausted(msg.into())
    }

    pub fn external_service<S: Into<String>, M: Into<String>>(service: S, message: M) -> Self {
        Error::ExternalService {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Client-caused errors (4xx equivalents).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::NotFound { .. }
                | Error::AlreadyExists { .. }
                | Error::Unauthorized(_)
                | Error::ResourceExhausted(_)
        )
    }

    /// HTTP status code equivalent.
    pub fn http_status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::Unauthorized(_) => 401,
            Error::NotFound { .. } => 404,
            Error::AlreadyExists { .. } => 409,
            Error::ResourceExhausted(_) => 429,
            Error::Config(_) | Error::Database(_) | Error::Io(_) | Error::Internal(_) => 500,
            Error::ExternalService { .. } => 502,
            Error::Timeout(_) => 504,
            Error::Other(_) => 500,
        }
    }

    /// Short code for logs and metrics labels.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound { .. } => "NOT_FOUND",
            Error::AlreadyExists { .. } => "ALREADY_EXISTS",
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            Error::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            Error::Timeout(_) => "TIMEOUT",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "UNKNOWN_ERROR",
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Error::Validation(err.to_string())
    }
}
