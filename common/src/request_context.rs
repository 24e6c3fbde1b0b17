use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderMap, Request, StatusCode, request::Parts},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    net::{IpAddr, SocketAddr},
    time::SystemTime,
};
use uuid::Uuid;

use crate::response;

/// Attribution recorded on enqueues issued by background loops
/// (cron scheduler, lease reaper) rather than a caller.
pub const SYSTEM_USER: &str = "system";

/// Stored per-request in `request.extensions()`.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct RequestContext {
    pub request_id: Uuid,
    /// Caller identity from `x-atoll-user`, if any. AuthN happens upstream;
    /// this is attribution only.
    pub user: Option<String>,
    pub client_ip: Option<IpAddr>,
    pub received_at: SystemTime,
}

impl RequestContext {
    /// Identity recorded on tasks enqueued for this request.
    pub fn requested_by(&self) -> &str {
        self.user.as_deref().unwrap_or(SYSTEM_USER)
    }
}

/// Axum extractor usage: `RequestContextExtractor(ctx): RequestContextExtractor`
pub struct RequestContextExtractor(pub RequestContext);

impl std::ops::Deref for RequestContextExtractor {
    type Target = RequestContext;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S> FromRequestParts<S> for RequestContextExtractor
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        // Clone what we need *before* the async block to avoid borrowing `parts` across await.
        let ctx = parts.extensions.get::<RequestContext>().cloned();

        async move {
            ctx.map(RequestContextExtractor).ok_or((
                StatusCode::INTERNAL_SERVER_ERROR,
                "RequestContext missing (did you add the middleware?)",
            ))
        }
    }
}

pub mod middleware {
    use super::*;

    pub async fn extract_context(req: Request<Body>, next: Next) -> Response {
        request_context_base(req, next, false).await
    }

    pub async fn create_context(req: Request<Body>, next: Next) -> Response {
        request_context_base(req, next, true).await
    }

    async fn request_context_base(
        mut req: Request<Body>,
        next: Next,
        generate_id: bool,
    ) -> Response {
        let headers = req.headers();
        let request_id = if generate_id {
            Uuid::new_v4()
        } else {
            match extract_or_generate_request_id(headers) {
                Ok(id) => id,
                Err(e) => return response::bad_request(e),
            }
        };
        let user = headers
            .get("x-atoll-user")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let client_ip = crate::get_source_ip(headers).or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        });
        let ctx = RequestContext {
            request_id,
            user,
            client_ip,
            received_at: SystemTime::now(),
        };
        req.extensions_mut().insert(ctx);
        let mut res = next.run(req).await;
        res.headers_mut()
            .insert("x-request-id", request_id.to_string().parse().unwrap());
        res
    }
}

fn extract_or_generate_request_id(headers: &HeaderMap) -> Result<Uuid> {
    Ok(headers
        .get("x-request-id")
        .map(|v| v.to_str())
        .transpose()
        .context("Failed to convert x-request-id header to string")?
        .map(|s| Uuid::parse_str(s.trim()))
        .transpose()
        .context("Failed to parse x-request-id as UUID")?
        .unwrap_or_else(Uuid::new_v4))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(user: Option<&str>) -> RequestContext {
        RequestContext {
            request_id: Uuid::nil(),
            user: user.map(|s| s.to_string()),
            client_ip: None,
            received_at: SystemTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn requested_by_falls_back_to_system() {
        assert_eq!(ctx(None).requested_by(), SYSTEM_USER);
        assert_eq!(ctx(Some("alice")).requested_by(), "alice");
    }
}
