use axum::{extract::Request, http::HeaderMap, middleware::Next, response::Response};

/// API key attached to a request by [`api_key_middleware`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKey(pub String);

/// Attach the caller's API key to the request, if one was presented
///
/// Validation belongs to the gateway's auth stage, which must run first:
/// every distinct key seen here gets its own collector queue for the life of
/// the process. Requests without a key pass through and are not tracked.
pub async fn api_key_middleware(mut req: Request, next: Next) -> Response {
    if let Some(key) = extract_api_key(req.headers()).map(str::to_owned) {
        req.extensions_mut().insert(ApiKey(key));
    }

    next.run(req).await
}

/// Read the key from `X-Api-Key`, falling back to `Authorization: Bearer`
pub fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    const BEARER_PREFIX: &str = "Bearer ";

    if let Some(key) = headers
        .get("X-Api-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
    {
        return Some(key);
    }

    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix(BEARER_PREFIX))
        .map(str::trim)
        .filter(|k| !k.is_empty())
}
