//! Azure implementations of the collaborator interfaces.
//!
//! - [`ComputeClient`]: scale sets and deployments through Resource Manager.
//! - [`TableClient`]: the key-value table, and the upgrade queue stored as a table.
//!
//! Both authenticate with a service principal through a shared [`TokenSource`].

mod auth;
mod compute;
mod table;

pub use auth::{MANAGEMENT_RESOURCE, STORAGE_RESOURCE, TokenSource};
pub use compute::ComputeClient;
pub use table::TableClient;

use reqwest::Response;
use serde_json::Value;

use crate::error::ApiError;

/// Pass a successful response through, turn anything else into a classified [`ApiError`].
async fn check(response: Response, what: &str) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body);
    tracing::debug!(what=%what, status=%status, message=%message, "Azure request failed");
    Err(ApiError::from_status(
        status.as_u16(),
        format!("{}: {}", what, message),
    ))
}

/// Pull the human readable message out of a Resource Manager or Table service error body.
fn error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return body.trim().to_string();
    };
    let message = value
        .pointer("/error/message")
        .or_else(|| value.pointer("/odata.error/message/value"))
        .and_then(Value::as_str);
    match message {
        Some(message) => message.to_string(),
        None => body.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message() {
        let arm = r#"{"error":{"code":"OperationNotAllowed","message":"Scale set is being deleted"}}"#;
        assert_eq!(error_message(arm), "Scale set is being deleted");

        let table = r#"{"odata.error":{"code":"TableAlreadyExists","message":{"lang":"en-US","value":"The table specified already exists."}}}"#;
        assert_eq!(error_message(table), "The table specified already exists.");

        assert_eq!(error_message("  gateway timeout \n"), "gateway timeout");
    }
}
