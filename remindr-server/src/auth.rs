use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// The shared secret cron callers must present as `Authorization: Bearer <secret>`.
///
/// Without a secret every request is let through.
#[derive(Debug, Clone, Default)]
pub struct CronAuth {
    secret: Option<Arc<str>>,
}

impl CronAuth {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.map(Arc::from),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    fn allows(&self, header: Option<&str>) -> bool {
        let Some(secret) = &self.secret else {
            return true;
        };
        header
            .and_then(|value| value.strip_prefix("Bearer "))
            .is_some_and(|token| constant_time_eq(token.as_bytes(), secret.as_bytes()))
    }
}

/// Compares every byte regardless of where the first mismatch is.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0, |diff, (x, y)| diff | (x ^ y)) == 0
}

pub async fn require_cron_secret(
    State(auth): State<CronAuth>,
    request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if auth.allows(header) {
        return next.run(request).await;
    }

    tracing::warn!(path = %request.uri().path(), "Rejected unauthorized trigger request");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Unauthorized" })),
    )
        .into_response()
}
