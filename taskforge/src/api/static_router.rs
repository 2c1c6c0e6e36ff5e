//! Disk-backed static file serving: `/tasklogs/…` over the run log directory (per-step logs
//! are generated at runtime, so unlike `gofer`'s `RustEmbed`-backed frontend assets these can't
//! be compiled in) and `/…` over the configured static asset directory.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use dropshot::{endpoint, Body, HttpError, Path, RequestContext};
use hyper::{header, Response, StatusCode};
use schemars::JsonSchema;
use serde::Deserialize;

use crate::api::ApiState;

/// Dropshot deserializes a `{path:.*}` capture into this.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct AllPath {
    pub path: Vec<String>,
}

fn not_found() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from("<h1>404</h1><p>Not Found</p>"))
        .unwrap()
}

/// Serves `<root>/<segments joined by '/'>`, falling back to `default_file` when the path is
/// empty. Any `..` segment is rejected outright rather than resolved, since dropshot hands us
/// the raw path components and a naive join would otherwise escape `root`.
async fn serve_from_disk(
    root: &str,
    segments: Vec<String>,
    default_file: Option<&str>,
) -> Result<Response<Body>, HttpError> {
    if segments.iter().any(|segment| segment == "..") {
        return Ok(not_found());
    }

    let mut rel = segments.join("/");
    if rel.is_empty() {
        rel = default_file.unwrap_or("").to_string();
    }
    if rel.is_empty() {
        return Ok(not_found());
    }

    let full: PathBuf = FsPath::new(root).join(&rel);

    match tokio::fs::read(&full).await {
        Ok(content) => {
            let ext = FsPath::new(&rel)
                .extension()
                .and_then(std::ffi::OsStr::to_str)
                .unwrap_or("txt");
            let mime_type = mime_guess::from_ext(ext).first_or_text_plain();

            Ok(Response::builder()
                .header(header::CONTENT_TYPE, mime_type.as_ref())
                .body(Body::from(content))
                .unwrap())
        }
        Err(_) => Ok(not_found()),
    }
}

/// Serves per-step stdout/stderr logs and `task.log` history files out of `<logDir>`.
#[endpoint {
    method = GET,
    path = "/tasklogs/{path:.*}",
    unpublished = true,
}]
pub async fn tasklogs_handler(
    rqctx: RequestContext<Arc<ApiState>>,
    path: Path<AllPath>,
) -> Result<Response<Body>, HttpError> {
    let api_state = rqctx.context();
    let segments = path.into_inner().path;
    let root = api_state.runner.log_dir().to_string_lossy().into_owned();

    serve_from_disk(&root, segments, None).await
}

/// Serves whatever static frontend assets live in `http.static_dir`; falls back to
/// `index.html` for the empty path.
#[endpoint {
    method = GET,
    path = "/{path:.*}",
    unpublished = true,
}]
pub async fn static_handler(
    rqctx: RequestContext<Arc<ApiState>>,
    path: Path<AllPath>,
) -> Result<Response<Body>, HttpError> {
    let api_state = rqctx.context();
    let segments = path.into_inner().path;
    let root = api_state.config.http.static_dir.clone();

    serve_from_disk(&root, segments, Some("index.html")).await
}
