pub mod agent;
pub mod health;
pub mod jobs;
pub mod patches;
pub mod readiness;
pub mod sites;

use axum::http::HeaderMap;

pub const ACTOR_HEADER: &str = "x-actor";

/// Who is acting, as forwarded by the fronting dashboard. Falls back to `Administrator`.
pub fn actor(headers: &HeaderMap) -> String {
    headers.get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("Administrator")
        .to_string()
}
