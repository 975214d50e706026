use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::AppState;
use crate::error::AppError;

/// Verified subject id of the caller, injected by [`require_auth`].
#[derive(Debug, Clone)]
pub struct AuthSubject(pub String);

/// Bearer-token authentication for every payment operation. The token is
/// verified against the identity provider, never decoded locally.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::to_string)
        .ok_or_else(|| AppError::InvalidCredential("missing bearer token".to_string()))?;

    let subject_id = state.identity.verify(&token).await?;

    req.extensions_mut().insert(AuthSubject(subject_id));
    Ok(next.run(req).await)
}
