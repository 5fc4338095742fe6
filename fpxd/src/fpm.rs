//! Translates inbound HTTP requests into FastCGI responder invocations and
//! FPM output back into response data.

use crate::fcgi_client::FcgiClient;
use anyhow::{Context, Result};
use bytes::Bytes;
use fpx_core::config::Config;
use fpx_core::observability::{FPM_DURATION_SECONDS, TYPE_FPM};
use http::header::{CONTENT_TYPE, HOST};
use http::HeaderMap;
use hyper::{Body, Request};
use metrics::histogram;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const SERVER_SOFTWARE: &str = "gophpfpm/1.0.0";

/// Request headers that are never forwarded as `HTTP_*` parameters;
/// `content-type` maps to the CONTENT_TYPE parameter and `content-length`
/// is computed from the buffered body.
fn is_protected_inbound(name: &str) -> bool {
    matches!(name, "content-type" | "content-length")
}

/// The response of one FPM call, decoupled from the wire.
#[derive(Debug, Clone)]
pub struct ResponseData {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Value of the `X-App-Route` response header, kept for metric labels.
    pub route: String,
}

pub struct FpmClient {
    fcgi: FcgiClient,
    config: Arc<Config>,
}

impl FpmClient {
    pub fn new(fcgi: FcgiClient, config: Arc<Config>) -> Self {
        Self { fcgi, config }
    }

    pub async fn call(&self, request: Request<Body>) -> Result<ResponseData> {
        let (parts, body) = request.into_parts();
        let body = hyper::body::to_bytes(body)
            .await
            .context("could not read request body")?;

        let params = build_params(&parts, &self.config);
        let method = parts.method.as_str().to_string();
        let fpm_request = self.fcgi.new_request(params, body);

        let start = Instant::now();
        let response = match self.fcgi.send(fpm_request).await {
            Ok(response) => response,
            Err(err) => {
                observe_fpm(&self.config.app, &method, 0, "", start.elapsed());
                return Err(err).context("could not call FPM");
            }
        };
        let route = header_value(&response.headers, "x-app-route");
        observe_fpm(
            &self.config.app,
            &method,
            response.status,
            &route,
            start.elapsed(),
        );
        debug!(status = %response.status_text, route = %route, "FPM response");

        Ok(ResponseData {
            status: response.status,
            headers: response.headers,
            body: response.body,
            route,
        })
    }

    pub async fn close(&self) {
        self.fcgi.close().await;
    }
}

/// Builds the CGI parameter table for one request. `HTTP_*` names are the
/// uppercased header names with hyphens left untouched; repeated headers
/// keep the last value.
fn build_params(parts: &http::request::Parts, config: &Config) -> HashMap<String, String> {
    let uri = &parts.uri;
    let request_uri = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_else(|| uri.host().unwrap_or_default());
    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default();

    let mut params = HashMap::from([
        (
            "SCRIPT_FILENAME".to_string(),
            config.index_file.display().to_string(),
        ),
        ("SERVER_SOFTWARE".to_string(), SERVER_SOFTWARE.to_string()),
        ("SERVER_NAME".to_string(), host.to_string()),
        ("SERVER_PORT".to_string(), config.port.to_string()),
        ("REQUEST_URI".to_string(), request_uri),
        (
            "QUERY_STRING".to_string(),
            uri.query().unwrap_or_default().to_string(),
        ),
        ("REQUEST_METHOD".to_string(), parts.method.to_string()),
        ("CONTENT_TYPE".to_string(), content_type),
    ]);

    for (name, value) in parts.headers.iter() {
        if is_protected_inbound(name.as_str()) {
            continue;
        }
        params.insert(
            format!("HTTP_{}", name.as_str().to_ascii_uppercase()),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        );
    }

    params
}

fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default()
}

fn observe_fpm(app: &str, method: &str, code: u16, endpoint: &str, elapsed: Duration) {
    histogram!(
        FPM_DURATION_SECONDS,
        "app" => app.to_string(),
        "type" => TYPE_FPM,
        "method" => method.to_string(),
        "fpm_code" => code.to_string(),
        "endpoint" => endpoint.to_string(),
    )
    .record(elapsed.as_secs_f64());
}
