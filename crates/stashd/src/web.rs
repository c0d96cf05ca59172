//! HTTP surface: upload, download, index page and health.

mod error;
mod state;

pub use error::AppError;
pub use state::{Admitted, AppState};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures::TryStreamExt;
use serde::Deserialize;
use stash::{ExpiryPolicy, Extension, Staged};
use tokio_util::io::{ReaderStream, StreamReader};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use error::body_error;

pub fn router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes;

    Router::new()
        .route("/", get(serve_index).post(upload))
        .route("/health", get(health))
        .route("/{locator}", get(download))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Usage page with an upload form.
async fn serve_index(State(state): State<AppState>) -> Html<String> {
    Html(INDEX_HTML.replace("{base_url}", &state.base_url))
}

/// Health check endpoint
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "tracked_clients": state.admission.len(),
        "admission_evictions": state.admission.eviction_passes(),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct UploadQuery {
    expiry: Option<String>,
}

fn resolve_policy(selector: &str) -> Result<ExpiryPolicy, AppError> {
    ExpiryPolicy::from_selector(selector, Utc::now())
        .map_err(|e| AppError::validation(format!("invalid expiry {selector:?}: {e}")))
}

fn is_multipart(request: &Request) -> bool {
    request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("multipart/form-data"))
}

/// Store an upload and answer with its URL.
///
/// Accepts a raw body, or `multipart/form-data` with a `file` field and an
/// optional `expiry` field. The `?expiry=` query parameter wins over the
/// form field; with neither, the configured default applies.
#[tracing::instrument(
    name = "http.upload",
    skip_all,
    fields(client = %admitted.client, stash.locator = tracing::field::Empty)
)]
async fn upload(
    State(state): State<AppState>,
    admitted: Admitted,
    Query(query): Query<UploadQuery>,
    request: Request,
) -> Result<Response, AppError> {
    let (staged, extension, form_expiry) = if is_multipart(&request) {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| AppError::validation(e.body_text()))?;
        read_multipart(&state, multipart).await?
    } else {
        // Fail on a bad selector before reading the body.
        if let Some(selector) = &query.expiry {
            resolve_policy(selector)?;
        }
        let stream = request.into_body().into_data_stream().map_err(body_error);
        let staged = state.store.stage(StreamReader::new(stream)).await?;
        (staged, Extension::text(), None)
    };

    let selector = query
        .expiry
        .or(form_expiry)
        .unwrap_or_else(|| state.default_expiry.to_string());
    let policy = resolve_policy(&selector)?;

    let locator = state.store.commit(staged, &extension, policy).await?;
    tracing::Span::current().record("stash.locator", locator.as_str());

    let url = format!("{}/{}\n", state.base_url, locator);
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], url).into_response())
}

/// Walk the form: stage the first `file` part, collect `expiry`, skip the rest.
async fn read_multipart(
    state: &AppState,
    mut multipart: Multipart,
) -> Result<(Staged, Extension, Option<String>), AppError> {
    let mut staged = None;
    let mut extension = Extension::text();
    let mut expiry = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| stash::StashError::Upload(body_error(e)))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("file") if staged.is_none() => {
                extension = Extension::sanitize(field.file_name());
                let reader = StreamReader::new(field.map_err(body_error));
                staged = Some(state.store.stage(reader).await?);
            }
            Some("expiry") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| stash::StashError::Upload(body_error(e)))?;
                expiry = Some(text.trim().to_string());
            }
            _ => {}
        }
    }

    let staged = staged.ok_or_else(|| AppError::validation("multipart upload has no file field"))?;
    Ok((staged, extension, expiry))
}

/// Serve an object by locator.
///
/// HEAD never consumes a view-once object.
#[tracing::instrument(name = "http.download", skip(state, admitted, method), fields(client = %admitted.client))]
async fn download(
    State(state): State<AppState>,
    admitted: Admitted,
    method: Method,
    Path(locator): Path<String>,
) -> Result<Response, AppError> {
    if method == Method::HEAD {
        let info = state.store.stat(&locator).await?;
        let content_type = crate::mime::content_type(info.locator.extension());
        return Ok(object_response(content_type, info.len, Body::empty()));
    }

    let blob = state.store.get(&locator).await?;
    let content_type = crate::mime::content_type(blob.locator.extension());
    let len = blob.len;
    let body = Body::from_stream(ReaderStream::new(blob.into_reader()));

    Ok(object_response(content_type, len, body))
}

fn object_response(content_type: &'static str, len: u64, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8">
  <title>stash</title>
</head>
<body>
<pre>Welcome to stash!

Upload a file:
  curl -F 'file=@yourfile.txt' -F 'expiry=1h' {base_url}/

Upload from stdin (expire after 5m):
  curl --data-binary @- '{base_url}/?expiry=5m' &lt; yourfile.txt

Upload from stdin and expire on first view:
  cat yourfile.txt | curl --data-binary @- '{base_url}/?expiry=view'

Expiry: 0 (never), view, or a duration like 90s, 5m, 1h30m, 24h.
</pre>
<form enctype="multipart/form-data" method="post">
  <input type="file" name="file">

  <fieldset style="margin-top: 1rem">
    <legend>Expiry:</legend>
    <label><input type="radio" name="expiry" value="0" checked> Never</label>
    <label><input type="radio" name="expiry" value="5m"> 5 minutes</label>
    <label><input type="radio" name="expiry" value="1h"> 1 hour</label>
    <label><input type="radio" name="expiry" value="24h"> 1 day</label>
    <label><input type="radio" name="expiry" value="view"> Expire on first view</label>
  </fieldset><br/>

  <input type="submit" value="Upload">
</form>
</body>
</html>
"##;
