//! Token extraction helpers shared by the gateway handler and the realtime
//! hub's handshake.

/// Bearer token from the `Authorization` header, or (for the persistent
/// message channel, which cannot set headers) a `token` query parameter.
pub fn extract_token(headers: &axum::http::HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(token) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
    {
        return Some(token.to_string());
    }
    query.and_then(|q| {
        q.split('&')
            .find(|pair| pair.starts_with("token="))
            .and_then(|pair| pair.split('=').nth(1))
            .map(|t| t.to_string())
    })
}
