//! Client for the external service that exchanges a public token for the
//! internal bearer token forwarded to upstream channels.

use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;

use crate::error::HubError;

/// Holds only the endpoint and a pooled HTTP client; safe to clone and share.
#[derive(Clone)]
pub struct TokenResolver {
    url: String,
    http: reqwest::Client,
}

impl TokenResolver {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// `POST` the public token as a plain-text body.
    ///
    /// 200 yields the internal token, 404 means the token is unknown and the
    /// client is unauthenticated, anything else is an internal failure. No
    /// timeout is applied here; the caller bounds the call.
    pub async fn resolve_public_token(&self, public_token: &str) -> Result<String, HubError> {
        let resp = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, "text/plain")
            .body(public_token.to_owned())
            .send()
            .await
            .map_err(|e| {
                tracing::error!(?e, url = %self.url, "token resolver request failed");
                HubError::internal("token resolver unreachable")
                    .with_details(serde_json::json!({ "error": e.to_string() }))
            })?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| {
            tracing::error!(?e, %status, "token resolver body unreadable");
            HubError::internal("token resolver response unreadable")
        })?;

        match status {
            StatusCode::OK => Ok(body),
            StatusCode::NOT_FOUND => Err(HubError::unauthorized("public token not recognized")),
            other => {
                tracing::error!(status = %other, "token resolver returned unexpected status");
                Err(HubError::internal("token resolver failed").with_details(
                    serde_json::json!({ "status": other.as_u16(), "body": body }),
                ))
            }
        }
    }
}
