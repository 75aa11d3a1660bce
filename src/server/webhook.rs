//! axum extractor for GitLab webhook events.
use axum::async_trait;
use axum::extract::{FromRequest, Request};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::scm::{CommitSha, MergeRequestNumber};
use crate::server::ServerStateRef;

/// Header carrying the shared webhook secret.
pub const TOKEN_HEADER: &str = "x-gitlab-token";

const MAX_BODY_SIZE: usize = 25 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct WebhookProject {
    path_with_namespace: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WebhookMergeRequest {
    pub iid: u64,
    last_commit: Option<WebhookCommit>,
}

impl WebhookMergeRequest {
    pub fn commit_sha(&self) -> Option<CommitSha> {
        self.last_commit
            .as_ref()
            .map(|commit| commit.id.clone())
            .filter(|sha| !sha.is_empty())
            .map(CommitSha)
    }

    pub fn number(&self) -> MergeRequestNumber {
        MergeRequestNumber(self.iid)
    }
}

#[derive(Clone, Debug, Deserialize)]
struct WebhookCommit {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    event_type: String,
    project: WebhookProject,
    /// Sent with `merge_request` events.
    object_attributes: Option<WebhookMergeRequest>,
    /// Sent with `note` events on merge requests.
    merge_request: Option<WebhookMergeRequest>,
}

/// A decoded GitLab webhook. The full payload is kept so scripts can inspect it.
#[derive(Debug)]
pub struct GitlabWebhook {
    pub event_type: String,
    pub project: String,
    pub object_attributes: Option<WebhookMergeRequest>,
    pub merge_request: Option<WebhookMergeRequest>,
    pub payload: serde_json::Value,
}

#[derive(thiserror::Error, Debug)]
pub enum WebhookError {
    #[error("Missing or invalid X-Gitlab-Token header")]
    InvalidToken,
    #[error("The request is not using Content-Type: application/json")]
    UnsupportedContentType,
    #[error("The POST body is empty; expected a JSON payload")]
    EmptyBody,
    #[error("Could not read the POST body: {0}")]
    Body(String),
    #[error("Could not decode the POST body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl WebhookError {
    fn status(&self) -> StatusCode {
        match self {
            WebhookError::InvalidToken => StatusCode::FORBIDDEN,
            WebhookError::UnsupportedContentType => StatusCode::NOT_ACCEPTABLE,
            WebhookError::EmptyBody | WebhookError::Body(_) | WebhookError::Decode(_) => {
                StatusCode::BAD_REQUEST
            }
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::error!("Rejecting webhook with {status}: {self}");
        (status, self.to_string()).into_response()
    }
}

#[async_trait]
impl FromRequest<ServerStateRef> for GitlabWebhook {
    type Rejection = WebhookError;

    async fn from_request(
        request: Request,
        state: &ServerStateRef,
    ) -> Result<Self, Self::Rejection> {
        let (parts, body) = request.into_parts();

        // Verify that the request is valid
        verify_token(&parts.headers, state.webhook_secret())?;
        if !is_json(&parts.headers) {
            return Err(WebhookError::UnsupportedContentType);
        }

        let body = axum::body::to_bytes(body, MAX_BODY_SIZE)
            .await
            .map_err(|error| WebhookError::Body(error.to_string()))?;
        parse_webhook(&body)
    }
}

fn verify_token(headers: &HeaderMap, secret: Option<&SecretString>) -> Result<(), WebhookError> {
    let Some(secret) = secret else {
        return Ok(());
    };
    let theirs = headers
        .get(TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if theirs == secret.expose_secret().as_str() {
        Ok(())
    } else {
        Err(WebhookError::InvalidToken)
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}

fn parse_webhook(body: &[u8]) -> Result<GitlabWebhook, WebhookError> {
    if body.is_empty() {
        return Err(WebhookError::EmptyBody);
    }
    let payload: serde_json::Value = serde_json::from_slice(body)?;
    let typed: WebhookPayload = serde_json::from_value(payload.clone())?;
    Ok(GitlabWebhook {
        event_type: typed.event_type,
        project: typed.project.path_with_namespace,
        object_attributes: typed.object_attributes,
        merge_request: typed.merge_request,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_merge_request_event() {
        let body = json!({
            "event_type": "merge_request",
            "project": {"path_with_namespace": "group/project"},
            "object_attributes": {"iid": 12, "last_commit": {"id": "abc"}}
        });
        let webhook = parse_webhook(body.to_string().as_bytes()).unwrap();
        assert_eq!(webhook.event_type, "merge_request");
        assert_eq!(webhook.project, "group/project");
        let mr = webhook.object_attributes.unwrap();
        assert_eq!(mr.number(), MergeRequestNumber(12));
        assert_eq!(mr.commit_sha(), Some(CommitSha("abc".to_string())));
        assert_eq!(webhook.payload["object_attributes"]["iid"], 12);
    }

    #[test]
    fn parse_rejects_invalid_payloads() {
        assert!(matches!(parse_webhook(b""), Err(WebhookError::EmptyBody)));
        assert!(matches!(parse_webhook(b"{"), Err(WebhookError::Decode(_))));
        assert!(matches!(
            parse_webhook(br#"{"event_type": "note"}"#),
            Err(WebhookError::Decode(_))
        ));
    }

    #[test]
    fn token_verification() {
        let secret = SecretString::new("s3cret".to_string());
        let mut headers = HeaderMap::new();
        assert!(verify_token(&headers, None).is_ok());
        assert!(matches!(
            verify_token(&headers, Some(&secret)),
            Err(WebhookError::InvalidToken)
        ));
        headers.insert(TOKEN_HEADER, HeaderValue::from_static("s3cret"));
        assert!(verify_token(&headers, Some(&secret)).is_ok());
    }

    #[test]
    fn content_type_parameters_are_ignored() {
        let mut headers = HeaderMap::new();
        assert!(!is_json(&headers));
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        assert!(is_json(&headers));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        assert!(!is_json(&headers));
    }
}
