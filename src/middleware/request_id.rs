use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request, Response},
    middleware::Next,
};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Attach a correlation id to every request and echo it on the response.
/// Error bodies reference the same id, so a 500 can be matched to its
/// log lines.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let header_name = HeaderName::from_static(REQUEST_ID_HEADER);

    let id = req
        .headers()
        .get(&header_name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(|v| v.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Ok(value) = HeaderValue::from_str(&id) {
        req.headers_mut().insert(header_name.clone(), value);
    }

    let mut res = next.run(req).await;

    if res.headers().get(&header_name).is_none() {
        if let Ok(value) = HeaderValue::from_str(&id) {
            res.headers_mut().insert(header_name, value);
        }
    }

    res
}
