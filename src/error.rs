use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{context}: received HTML response, likely an error page")]
    UnexpectedContent { context: String },

    #[error("{context}: failed to decode response: {source}")]
    Decode {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}: endpoint not found (404)")]
    NotFound(String),

    #[error("{context}: registry returned status {status}")]
    Status { context: String, status: StatusCode },

    #[error("Invalid regex pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Registry URL is empty")]
    EmptyBaseUrl,

    #[error("Credential error: {0}")]
    Credentials(String),

    #[error("Usage report error: {0}")]
    UsageReport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[cfg(test)]
impl AppError {
    pub fn is_unexpected_content(&self) -> bool {
        matches!(self, AppError::UnexpectedContent { .. })
    }
}
