use axum::{
    Json,
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const IDEMPOTENCY_TTL: Duration = Duration::from_secs(86400); // 24 hours
const PROCESSING_TTL: Duration = Duration::from_secs(300); // 5 minutes
const MAX_CACHED_BODY: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
enum Entry {
    Processing { since: Instant },
    Completed { response: CachedResponse, at: Instant },
}

impl Entry {
    fn is_expired(&self, completed_ttl: Duration, processing_ttl: Duration) -> bool {
        match self {
            Entry::Processing { since } => since.elapsed() >= processing_ttl,
            Entry::Completed { at, .. } => at.elapsed() >= completed_ttl,
        }
    }
}

#[derive(Debug)]
pub enum IdempotencyStatus {
    New,
    Processing,
    Completed(CachedResponse),
}

/// In-process idempotency cache keyed by the caller's `x-idempotency-key`.
///
/// The store behind this service is embedded and single-node, so the cache
/// is too; stale entries are swept whenever a response is stored, so the map
/// stays bounded by the keys seen within one TTL window.
#[derive(Clone)]
pub struct IdempotencyService {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    completed_ttl: Duration,
    processing_ttl: Duration,
}

impl Default for IdempotencyService {
    fn default() -> Self {
        Self {
            entries: Arc::default(),
            completed_ttl: IDEMPOTENCY_TTL,
            processing_ttl: PROCESSING_TTL,
        }
    }
}

impl IdempotencyService {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn with_ttls(completed_ttl: Duration, processing_ttl: Duration) -> Self {
        Self {
            entries: Arc::default(),
            completed_ttl,
            processing_ttl,
        }
    }

    /// Check whether a request with this key is new, in flight, or done.
    /// A new key takes the processing lock.
    pub async fn check_idempotency(&self, idempotency_key: &str) -> IdempotencyStatus {
        let mut entries = self.entries.write().await;
        match entries.get(idempotency_key) {
            Some(Entry::Processing { since }) if since.elapsed() < self.processing_ttl => {
                IdempotencyStatus::Processing
            }
            Some(Entry::Completed { response, at }) if at.elapsed() < self.completed_ttl => {
                IdempotencyStatus::Completed(response.clone())
            }
            _ => {
                entries.insert(
                    idempotency_key.to_string(),
                    Entry::Processing {
                        since: Instant::now(),
                    },
                );
                IdempotencyStatus::New
            }
        }
    }

    /// Store the successful response for future duplicate requests. Entries
    /// past their TTL are dropped here so keys that are never retried do not
    /// accumulate for the life of the process.
    pub async fn store_response(&self, idempotency_key: &str, status: u16, body: Vec<u8>) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| !entry.is_expired(self.completed_ttl, self.processing_ttl));
        entries.insert(
            idempotency_key.to_string(),
            Entry::Completed {
                response: CachedResponse { status, body },
                at: Instant::now(),
            },
        );
    }

    #[cfg(test)]
    async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Release the processing lock if the request failed.
    pub async fn release_lock(&self, idempotency_key: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(idempotency_key);
    }
}

/// Middleware making network retries of the POST operations safe: duplicate
/// keys replay the cached response instead of re-running the operation.
pub async fn idempotency_middleware(
    State(service): State<IdempotencyService>,
    request: Request,
    next: Next,
) -> Response {
    let idempotency_key = match request.headers().get("x-idempotency-key") {
        Some(key) => match key.to_str() {
            Ok(k) => k.to_string(),
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({
                        "error": "Invalid idempotency key format"
                    })),
                )
                    .into_response();
            }
        },
        // No key, no idempotency guarantee; the request runs as-is.
        None => return next.run(request).await,
    };

    match service.check_idempotency(&idempotency_key).await {
        IdempotencyStatus::New => {
            let response = next.run(request).await;

            if response.status().is_success() {
                let status = response.status();
                let (parts, body) = response.into_parts();
                let bytes = match axum::body::to_bytes(body, MAX_CACHED_BODY).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to buffer response for idempotency cache");
                        service.release_lock(&idempotency_key).await;
                        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                    }
                };
                service
                    .store_response(&idempotency_key, status.as_u16(), bytes.to_vec())
                    .await;
                Response::from_parts(parts, Body::from(bytes))
            } else {
                service.release_lock(&idempotency_key).await;
                response
            }
        }
        IdempotencyStatus::Processing => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": "Request is currently being processed",
                "retry_after": 5
            })),
        )
            .into_response(),
        IdempotencyStatus::Completed(cached) => {
            let status = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);
            let mut response = Response::new(Body::from(cached.body));
            *response.status_mut() = status;
            response.headers_mut().insert(
                "x-idempotent-replay",
                axum::http::HeaderValue::from_static("true"),
            );
            response.headers_mut().insert(
                axum::http::header::CONTENT_TYPE,
                axum::http::HeaderValue::from_static("application/json"),
            );
            response
        }
    }
}
