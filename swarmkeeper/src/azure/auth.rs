//! Service principal tokens via the OAuth2 client-credentials flow.

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use url::Url;

use crate::config::Secret;
use crate::error::ApiError;

pub const MANAGEMENT_RESOURCE: &str = "https://management.azure.com/";
pub const STORAGE_RESOURCE: &str = "https://storage.azure.com/";

const AUTHORITY: &str = "https://login.microsoftonline.com/";
const REFRESH_MARGIN_SECS: i64 = 300;

/// The token endpoint reports `expires_in` as a number or as a string, depending on the version.
#[derive(Deserialize)]
#[serde(untagged)]
enum Seconds {
    Number(i64),
    Text(String),
}

impl Seconds {
    fn value(&self) -> Result<i64, ApiError> {
        match self {
            Seconds::Number(n) => Ok(*n),
            Seconds::Text(s) => s
                .parse()
                .map_err(|_| ApiError::Decode(format!("bad expires_in '{}'", s))),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Seconds,
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Bearer tokens per resource, cached until shortly before they expire.
pub struct TokenSource {
    client: Client,
    endpoint: Url,
    app_id: String,
    app_secret: Secret,
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl TokenSource {
    pub fn new(
        client: Client,
        tenant_id: &str,
        app_id: impl Into<String>,
        app_secret: Secret,
    ) -> Result<Self, ApiError> {
        let endpoint = Url::parse(AUTHORITY)
            .and_then(|base| base.join(&format!("{}/oauth2/token", tenant_id)))
            .map_err(|e| ApiError::Fatal(format!("bad tenant id '{}': {}", tenant_id, e)))?;
        Ok(TokenSource {
            client,
            endpoint,
            app_id: app_id.into(),
            app_secret,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn cached(&self, resource: &str) -> Option<String> {
        let cache = self.cache.lock();
        cache
            .get(resource)
            .filter(|t| t.expires_at > Utc::now())
            .map(|t| t.token.clone())
    }

    pub async fn token(&self, resource: &str) -> Result<String, ApiError> {
        if let Some(token) = self.cached(resource) {
            return Ok(token);
        }

        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.app_id.as_str()),
            ("client_secret", self.app_secret.expose()),
            ("resource", resource),
        ];
        let response = self
            .client
            .post(self.endpoint.clone())
            .form(&form)
            .send()
            .await?;
        let response = super::check(response, "acquire access token").await?;
        let body: TokenResponse = response.json().await?;

        let lifetime = body.expires_in.value()? - REFRESH_MARGIN_SECS;
        let expires_at = Utc::now() + TimeDelta::seconds(lifetime.max(0));
        tracing::debug!(resource=%resource, expires_at=%expires_at, "Access token acquired");
        self.cache.lock().insert(
            resource.to_string(),
            CachedToken {
                token: body.access_token.clone(),
                expires_at,
            },
        );
        Ok(body.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_response_expiry_formats() {
        let text: TokenResponse =
            serde_json::from_str(r#"{"access_token":"a","expires_in":"3599"}"#).unwrap();
        assert_eq!(text.expires_in.value().unwrap(), 3599);

        let number: TokenResponse =
            serde_json::from_str(r#"{"access_token":"a","expires_in":3599}"#).unwrap();
        assert_eq!(number.expires_in.value().unwrap(), 3599);

        let bad: TokenResponse =
            serde_json::from_str(r#"{"access_token":"a","expires_in":"soon"}"#).unwrap();
        assert!(bad.expires_in.value().is_err());
    }

    #[test]
    fn test_cache_honours_expiry() {
        let source = TokenSource::new(Client::new(), "tenant-1", "app", Secret::new("s")).unwrap();
        assert_eq!(
            source.endpoint.as_str(),
            "https://login.microsoftonline.com/tenant-1/oauth2/token"
        );

        source.cache.lock().insert(
            MANAGEMENT_RESOURCE.to_string(),
            CachedToken {
                token: "fresh".into(),
                expires_at: Utc::now() + TimeDelta::seconds(60),
            },
        );
        source.cache.lock().insert(
            STORAGE_RESOURCE.to_string(),
            CachedToken {
                token: "stale".into(),
                expires_at: Utc::now() - TimeDelta::seconds(1),
            },
        );
        assert_eq!(source.cached(MANAGEMENT_RESOURCE).as_deref(), Some("fresh"));
        assert_eq!(source.cached(STORAGE_RESOURCE), None);
    }
}
