//! HTTP listener, request orchestration and the metrics/static routes.

use crate::fpm::{FpmClient, ResponseData};
use crate::static_files;
use anyhow::{Context, Result};
use fpx_core::access_log::AccessLog;
use fpx_core::config::Config;
use fpx_core::observability::{PrometheusHandle, HTTP_DURATION_SECONDS, TYPE_HTTP};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use metrics::histogram;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout, Duration};
use tracing::{error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Response headers received from FPM that never reach the client;
/// `x-app-route` only feeds the metric labels.
fn is_protected_outbound(name: &str) -> bool {
    matches!(name, "x-powered-by" | "x-app-route")
}

pub struct AppState {
    pub config: Arc<Config>,
    pub fpm: Arc<FpmClient>,
    pub metrics: PrometheusHandle,
    pub access_log: AccessLog,
}

/// Binds the listener and serves until SIGINT/SIGTERM, then drains with a
/// bounded grace period and closes the FPM pool.
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let app = state.clone();
    let make = make_service_fn(move |_| {
        let app = app.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(req, app.clone()))) }
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = Server::try_bind(&addr)
        .with_context(|| format!("failed to bind {addr}"))?
        .serve(make)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
    info!(listen = %addr, "server started");
    let driver = tokio::spawn(server);

    shutdown_signal().await?;
    info!("server stopped");
    let _ = shutdown_tx.send(());
    match timeout(SHUTDOWN_GRACE, driver).await {
        Ok(joined) => joined
            .context("server task failed")?
            .context("server failed")?,
        Err(_) => warn!("graceful shutdown timed out, dropping in-flight requests"),
    }

    if timeout(SHUTDOWN_GRACE, state.fpm.close()).await.is_err() {
        warn!("FPM pool drain timed out");
    }
    info!("server exited properly");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let mut interrupt =
        signal(SignalKind::interrupt()).context("could not install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("could not install SIGTERM handler")?;
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    Ok(())
}

pub async fn handle(
    request: Request<Body>,
    state: Arc<AppState>,
) -> Result<Response<Body>, Infallible> {
    let path = request.uri().path();
    if path == "/metrics" {
        return Ok(serve_metrics(&state, request.method()));
    }
    if let Some(mount) = state
        .config
        .static_mounts
        .iter()
        .find(|mount| static_files::matches(mount, path))
    {
        let start = Instant::now();
        let response = static_files::serve(mount, &request).await;
        observe_http(
            &state.config.app,
            request.method().as_str(),
            response.status().as_u16(),
            &format!("{}/<asset>", mount.prefix),
            start.elapsed(),
        );
        return Ok(response);
    }
    Ok(proxy_to_fpm(request, state).await)
}

/// Drives one proxied request: the adapter call runs on its own task and is
/// raced against the configured deadline. A deadline hit answers 408 while
/// the call keeps running; its connection returns to the pool when the
/// exchange finishes.
async fn proxy_to_fpm(request: Request<Body>, state: Arc<AppState>) -> Response<Body> {
    let start = Instant::now();
    let method = request.method().clone();
    let query = request.uri().query().unwrap_or_default().to_string();

    let fpm = state.fpm.clone();
    let mut call = tokio::spawn(async move { fpm.call(request).await });
    let joined = tokio::select! {
        joined = &mut call => joined,
        _ = sleep(state.config.timeout) => {
            observe_http(&state.config.app, method.as_str(), 408, "", start.elapsed());
            return plain_response(StatusCode::REQUEST_TIMEOUT, "timeout");
        }
    };

    let data = match joined {
        Ok(Ok(data)) => data,
        Ok(Err(err)) => {
            error!(error = ?err, "could not call FPM");
            observe_http(&state.config.app, method.as_str(), 500, "", start.elapsed());
            return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
        }
        Err(err) => {
            error!(error = ?err, "FPM call task failed");
            observe_http(&state.config.app, method.as_str(), 500, "", start.elapsed());
            return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
        }
    };

    let Some(response) = build_fpm_response(&data) else {
        error!(status = data.status, "FPM returned an unusable status code");
        observe_http(&state.config.app, method.as_str(), 500, "", start.elapsed());
        return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
    };

    observe_http(
        &state.config.app,
        method.as_str(),
        data.status,
        &data.route,
        start.elapsed(),
    );
    state.access_log.log_fpm(
        method.as_str(),
        &query,
        data.status,
        &data.route,
        data.body.len(),
    );
    response
}

/// Copies everything except the protected headers onto the wire response.
fn build_fpm_response(data: &ResponseData) -> Option<Response<Body>> {
    let status = StatusCode::from_u16(data.status).ok()?;
    let mut response = Response::builder()
        .status(status)
        .body(Body::from(data.body.clone()))
        .expect("fpm response");
    for (name, value) in data.headers.iter() {
        if is_protected_outbound(name.as_str()) {
            continue;
        }
        response.headers_mut().append(name.clone(), value.clone());
    }
    Some(response)
}

fn serve_metrics(state: &AppState, method: &Method) -> Response<Body> {
    let start = Instant::now();
    let response = if *method == Method::GET {
        Response::builder()
            .status(StatusCode::OK)
            .header(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            )
            .body(Body::from(state.metrics.render()))
            .expect("metrics response")
    } else {
        plain_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
    };
    observe_http(
        &state.config.app,
        method.as_str(),
        response.status().as_u16(),
        "/metrics",
        start.elapsed(),
    );
    response
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/plain; charset=utf-8"),
        )
        .body(Body::from(body))
        .expect("plain response")
}

fn observe_http(app: &str, method: &str, code: u16, endpoint: &str, elapsed: Duration) {
    histogram!(
        HTTP_DURATION_SECONDS,
        "app" => app.to_string(),
        "type" => TYPE_HTTP,
        "method" => method.to_string(),
        "http_code" => code.to_string(),
        "endpoint" => endpoint.to_string(),
    )
    .record(elapsed.as_secs_f64());
}
