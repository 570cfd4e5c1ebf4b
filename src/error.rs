use http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum GriddleError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not acceptable: {0}")]
    NotAcceptable(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Quota exceeded for index {index}: {current} documents, max {max}")]
    QuotaExceeded {
        index: String,
        current: u64,
        max: u64,
    },

    #[error("Replication failed on resource {resource} of index {index}: {message}")]
    Replication {
        resource: String,
        index: String,
        message: String,
    },

    #[error("Interrupted: {0}")]
    Interrupted(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Tantivy error: {0}")]
    Tantivy(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, GriddleError>;

impl From<std::io::Error> for GriddleError {
    fn from(e: std::io::Error) -> Self {
        GriddleError::Io(e.to_string())
    }
}

impl From<tantivy::TantivyError> for GriddleError {
    fn from(e: tantivy::TantivyError) -> Self {
        GriddleError::Tantivy(e.to_string())
    }
}

impl From<tantivy::directory::error::OpenDirectoryError> for GriddleError {
    fn from(e: tantivy::directory::error::OpenDirectoryError) -> Self {
        GriddleError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for GriddleError {
    fn from(e: serde_json::Error) -> Self {
        GriddleError::Json(e.to_string())
    }
}

impl GriddleError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GriddleError::NotFound(_) => StatusCode::NOT_FOUND,
            GriddleError::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
            GriddleError::UnsupportedOperation(_) => StatusCode::METHOD_NOT_ALLOWED,
            GriddleError::InvalidDocument(_) => StatusCode::BAD_REQUEST,
            GriddleError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            GriddleError::InvalidName(_) => StatusCode::BAD_REQUEST,
            GriddleError::QuotaExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
            GriddleError::Replication { .. } => StatusCode::BAD_GATEWAY,
            GriddleError::Interrupted(_) => StatusCode::SERVICE_UNAVAILABLE,
            GriddleError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GriddleError::Tantivy(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GriddleError::Json(_) => StatusCode::BAD_REQUEST,
            GriddleError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GriddleError::NotFound(_))
    }
}
