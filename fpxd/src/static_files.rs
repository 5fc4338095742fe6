//! Plain local-filesystem handler for configured `<local_dir>:<prefix>`
//! mounts.

use fpx_core::config::StaticMount;
use hyper::{Body, Method, Request, Response, StatusCode};
use percent_encoding::percent_decode_str;
use std::path::PathBuf;

pub fn matches(mount: &StaticMount, path: &str) -> bool {
    path == mount.prefix || path.starts_with(&format!("{}/", mount.prefix))
}

pub async fn serve(mount: &StaticMount, request: &Request<Body>) -> Response<Body> {
    if !matches!(*request.method(), Method::GET | Method::HEAD) {
        return plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }
    let Some(path) = resolve(mount, request.uri().path()) else {
        return plain(StatusCode::NOT_FOUND, "not found");
    };
    let path = match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_dir() => path.join("index.html"),
        _ => path,
    };
    match tokio::fs::read(&path).await {
        Ok(contents) => {
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            Response::builder()
                .status(StatusCode::OK)
                .header(http::header::CONTENT_TYPE, mime.as_ref())
                .body(Body::from(contents))
                .expect("static response")
        }
        Err(_) => plain(StatusCode::NOT_FOUND, "not found"),
    }
}

/// Maps a request path below the mount prefix onto the local directory,
/// rejecting traversal outside it.
fn resolve(mount: &StaticMount, request_path: &str) -> Option<PathBuf> {
    let rest = request_path.strip_prefix(&mount.prefix).unwrap_or("");
    let decoded = percent_decode_str(rest).decode_utf8().ok()?;
    let mut path = mount.dir.clone();
    for component in decoded.split('/') {
        match component {
            "" | "." => continue,
            ".." => return None,
            _ => path.push(component),
        }
    }
    Some(path)
}

fn plain(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/plain; charset=utf-8"),
        )
        .body(Body::from(body))
        .expect("static response")
}
