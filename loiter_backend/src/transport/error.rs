use thiserror::Error;

/// Errors surfaced by a chat platform adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("platform API error {code}: {description}")]
    Api { code: i64, description: String },

    #[error("missing permission: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to decode platform response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Map a platform error code/description pair onto the closest variant.
    pub fn from_api(code: i64, description: impl Into<String>) -> Self {
        let description = description.into();
        match code {
            403 => Self::PermissionDenied(description),
            400 if description.to_ascii_lowercase().contains("not enough rights") => {
                Self::PermissionDenied(description)
            }
            400 if description.to_ascii_lowercase().contains("not found") => {
                Self::NotFound(description)
            }
            404 => Self::NotFound(description),
            _ => Self::Api { code, description },
        }
    }

    pub fn is_permission_error(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;
