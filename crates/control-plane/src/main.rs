//! Binary entrypoint for the Control Plane service.
use control_plane::{agent, build_router, config::Config, services::patches::HttpPatchSource, store, AppState};
use tracing::info;
use axum::{http::{Request, HeaderValue}, middleware::{self, Next}, response::Response, body::Body};
use tower_http::{limit::RequestBodyLimitLayer, cors::CorsLayer};
use control_plane::telemetry::{HTTP_REQUESTS, HTTP_REQUEST_DURATION, normalize_path};
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

async fn track_metrics(mut req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path_label = normalize_path(req.uri().path());
    let req_id = Uuid::new_v4();
    req.extensions_mut().insert(req_id);
    let start = std::time::Instant::now();
    let mut resp = next.run(req).await;
    let status = resp.status();
    let outcome = if status.as_u16() < 400 { "success" } else { "error" };
    HTTP_REQUESTS.with_label_values(&[method.as_str(), path_label.as_str(), status.as_str(), outcome]).inc();
    HTTP_REQUEST_DURATION.with_label_values(&[method.as_str(), path_label.as_str()]).observe(start.elapsed().as_secs_f64());
    if let Ok(v) = HeaderValue::from_str(&req_id.to_string()) { resp.headers_mut().insert("x-request-id", v); }
    resp
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();
    let config = Config::from_env();
    let store = store::from_config(&config).await?;
    let agent = agent::from_config(&config)?;
    let patch_source = Arc::new(HttpPatchSource::new(config.patch_fetch_timeout, config.patch_max_bytes)?);
    let addr = config.listen_addr;
    info!(store=?config.store, agent=?config.agent, domain=%config.domain, site_config_updates=config.site_config_updates, "config.loaded");
    let state = AppState { store, agent, patch_source, config: Arc::new(config) };

    const MAX_BODY_BYTES: usize = 1024 * 1024; // 1MB
    let app = build_router(state)
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(middleware::from_fn(track_metrics));
    info!(%addr, "control-plane listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error=%e, "shutdown.signal_install_failed");
            std::future::pending::<()>().await;
        }
        info!(target: "shutdown.signal", "received Ctrl+C");
        tokio::time::sleep(Duration::from_millis(200)).await; // drain window
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
