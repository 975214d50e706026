//! HTTP client for the identity verifier and its user directory.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::ports::{IdentityError, IdentityProvider};

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    subject_id: String,
}

#[derive(Debug, Deserialize)]
struct DirectoryRecord {
    school_domain: Option<String>,
    email: Option<String>,
}

/// HTTP-backed identity provider: token verification plus directory lookups
/// for the same-school affiliation check.
#[derive(Clone)]
pub struct HttpIdentityProvider {
    client: Client,
    base_url: String,
}

impl HttpIdentityProvider {
    pub fn new(base_url: String, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

fn classify(op: &'static str, err: reqwest::Error) -> IdentityError {
    if err.is_timeout() {
        IdentityError::Timeout(op.to_string())
    } else {
        IdentityError::Upstream(err.to_string())
    }
}

/// Directory records may carry an explicit school domain; otherwise the
/// affiliation falls back to the registered email's domain, lowercased.
fn affiliation_of(record: &DirectoryRecord) -> Option<String> {
    if let Some(domain) = &record.school_domain {
        if !domain.is_empty() {
            return Some(domain.to_lowercase());
        }
    }
    record
        .email
        .as_deref()
        .and_then(|email| email.split_once('@'))
        .map(|(_, domain)| domain.to_lowercase())
        .filter(|domain| !domain.is_empty())
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn verify(&self, bearer_token: &str) -> Result<String, IdentityError> {
        let response = self
            .client
            .post(self.url("/verify"))
            .json(&json!({ "token": bearer_token }))
            .send()
            .await
            .map_err(|e| classify("verify token", e))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(
                IdentityError::InvalidCredential("token rejected by verifier".to_string()),
            ),
            status if status.is_success() => {
                let body = response
                    .json::<VerifyResponse>()
                    .await
                    .map_err(|e| classify("verify token", e))?;
                Ok(body.subject_id)
            }
            status => Err(IdentityError::Upstream(format!(
                "verify token failed with status {status}"
            ))),
        }
    }

    async fn affiliation(&self, subject_id: &str) -> Result<Option<String>, IdentityError> {
        let response = self
            .client
            .get(self.url(&format!("/users/{subject_id}")))
            .send()
            .await
            .map_err(|e| classify("directory lookup", e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(IdentityError::UserNotFound(subject_id.to_string())),
            status if status.is_success() => {
                let record = response
                    .json::<DirectoryRecord>()
                    .await
                    .map_err(|e| classify("directory lookup", e))?;
                Ok(affiliation_of(&record))
            }
            status => Err(IdentityError::Upstream(format!(
                "directory lookup failed with status {status}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affiliation_prefers_explicit_domain() {
        let record = DirectoryRecord {
            school_domain: Some("State.EDU".to_string()),
            email: Some("a@other.edu".to_string()),
        };
        assert_eq!(affiliation_of(&record), Some("state.edu".to_string()));
    }

    #[test]
    fn test_affiliation_falls_back_to_email_domain() {
        let record = DirectoryRecord {
            school_domain: None,
            email: Some("alice@State.EDU".to_string()),
        };
        assert_eq!(affiliation_of(&record), Some("state.edu".to_string()));
    }

    #[test]
    fn test_affiliation_none_when_record_is_bare() {
        let record = DirectoryRecord {
            school_domain: None,
            email: None,
        };
        assert_eq!(affiliation_of(&record), None);

        let malformed = DirectoryRecord {
            school_domain: Some(String::new()),
            email: Some("no-at-sign".to_string()),
        };
        assert_eq!(affiliation_of(&malformed), None);
    }

    #[tokio::test]
    async fn test_verify_maps_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/verify")
            .with_status(401)
            .create_async()
            .await;

        let provider = HttpIdentityProvider::new(server.url(), 5);
        let err = provider.verify("bad-token").await.unwrap_err();
        assert!(matches!(err, IdentityError::InvalidCredential(_)));
    }

    #[tokio::test]
    async fn test_verify_returns_subject() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/verify")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"subject_id":"user_1"}"#)
            .create_async()
            .await;

        let provider = HttpIdentityProvider::new(server.url(), 5);
        assert_eq!(provider.verify("good-token").await.unwrap(), "user_1");
    }

    #[tokio::test]
    async fn test_affiliation_maps_missing_user() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/users/user_1")
            .with_status(404)
            .create_async()
            .await;

        let provider = HttpIdentityProvider::new(server.url(), 5);
        let err = provider.affiliation("user_1").await.unwrap_err();
        assert!(matches!(err, IdentityError::UserNotFound(_)));
    }
}
