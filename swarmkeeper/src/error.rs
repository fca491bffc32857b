//! Error taxonomy shared by every external collaborator.

/// Errors returned by cluster, scale-set, table and queue clients.
///
/// Callers use the variant to tell "not found" from "try again" from "give up".
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource conflict: {0}")]
    Conflict(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Request failed: {0}")]
    Fatal(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Classify an unsuccessful HTTP status code.
    pub fn from_status(status: u16, context: impl Into<String>) -> Self {
        let context = format!("{} (status {})", context.into(), status);
        match status {
            404 => ApiError::NotFound(context),
            409 | 412 => ApiError::Conflict(context),
            408 | 429 | 500..=599 => ApiError::Transient(context),
            _ => ApiError::Fatal(context),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            ApiError::Transient(err.to_string())
        } else if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ApiError::from_status(status.as_u16(), err.to_string())
        } else {
            ApiError::Fatal(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}

/// Treat a `NotFound` as success. Used where the goal is "make sure it is gone".
pub fn ignore_not_found(result: Result<(), ApiError>) -> Result<(), ApiError> {
    match result {
        Err(ApiError::NotFound(what)) => {
            tracing::debug!(what=%what, "Resource already gone");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_status_classification() {
        assert_matches!(ApiError::from_status(404, "node"), ApiError::NotFound(_));
        assert_matches!(ApiError::from_status(409, "table"), ApiError::Conflict(_));
        assert_matches!(ApiError::from_status(503, "arm"), ApiError::Transient(_));
        assert_matches!(ApiError::from_status(429, "arm"), ApiError::Transient(_));
        assert_matches!(ApiError::from_status(403, "arm"), ApiError::Fatal(_));
    }

    #[test]
    fn test_ignore_not_found() {
        assert!(ignore_not_found(Err(ApiError::NotFound("x".into()))).is_ok());
        assert!(ignore_not_found(Err(ApiError::Fatal("x".into()))).is_err());
    }
}
