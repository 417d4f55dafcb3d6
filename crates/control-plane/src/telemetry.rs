use prometheus::{TextEncoder, Encoder, Registry, IntCounter, IntCounterVec, HistogramVec, HistogramOpts, opts};
use once_cell::sync::Lazy;
use axum::{response::IntoResponse, http::StatusCode};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static HTTP_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("http_requests_total", "HTTP request count"), &["method", "path", "status", "outcome"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    let h = HistogramVec::new(HistogramOpts::new("http_request_duration_seconds", "HTTP request latency"), &["method", "path"]).unwrap();
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});

pub static PATCHES_CREATED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("patches_created_total", "App patches persisted").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static JOBS_DISPATCHED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("jobs_dispatched_total", "Jobs accepted by the execution agent"), &["job_type"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static JOB_DISPATCH_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("job_dispatch_failures_total", "Jobs rejected by the execution agent"), &["job_type"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// Collapse ids and names in a request path so label cardinality stays bounded.
pub fn normalize_path(path: &str) -> String {
    let segs: Vec<&str> = path.trim_end_matches('/').split('/').skip(1).collect();
    match segs.as_slice() {
        ["sites", "options"] => "/sites/options".into(),
        ["sites", "exists", _] => "/sites/exists/:subdomain".into(),
        ["sites", _, rest @ ..] => join("/sites/:name", rest),
        ["patches", _, rest @ ..] => join("/patches/:name", rest),
        ["jobs", _] => "/jobs/:id".into(),
        ["agent", "jobs", _, rest @ ..] => join("/agent/jobs/:id", rest),
        _ => if path.is_empty() { "/".into() } else { path.to_string() },
    }
}

fn join(prefix: &str, rest: &[&str]) -> String {
    rest.iter().fold(prefix.to_string(), |mut acc, s| { acc.push('/'); acc.push_str(s); acc })
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&metric_families, &mut buf).is_err() { return StatusCode::INTERNAL_SERVER_ERROR.into_response(); }
    ([("Content-Type","text/plain; version=0.0.4")], buf).into_response()
}
