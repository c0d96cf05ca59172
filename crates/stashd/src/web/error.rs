//! Mapping from store failures to HTTP responses.

use axum::extract::multipart::MultipartError;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::error::Error as StdError;
use std::io;

use stash::StashError;

/// Handler error. Storage detail is logged, never sent to the client.
#[derive(Debug)]
pub struct AppError(pub StashError);

impl From<StashError> for AppError {
    fn from(err: StashError) -> Self {
        Self(err)
    }
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self(StashError::Validation(message.into()))
    }

    pub fn status(&self) -> StatusCode {
        match &self.0 {
            StashError::Validation(_) => StatusCode::BAD_REQUEST,
            StashError::NotFound => StatusCode::NOT_FOUND,
            StashError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            StashError::Upload(e) => upload_status(e),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Wrap a body-stream failure so [`upload_status`] can classify it later.
pub fn body_error<E>(err: E) -> io::Error
where
    E: StdError + Send + Sync + 'static,
{
    io::Error::other(err)
}

/// 413 when the body limit tripped mid-stream, 400 for any other broken upload.
fn upload_status(err: &io::Error) -> StatusCode {
    let Some(inner) = err.get_ref() else {
        return StatusCode::BAD_REQUEST;
    };

    if let Some(multipart) = inner.downcast_ref::<MultipartError>() {
        return multipart.status();
    }

    let mut source: Option<&(dyn StdError + 'static)> = Some(inner);
    while let Some(e) = source {
        if e.to_string().contains("length limit exceeded") {
            return StatusCode::PAYLOAD_TOO_LARGE;
        }
        source = e.source();
    }
    StatusCode::BAD_REQUEST
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self.0 {
            StashError::Validation(message) => format!("{message}\n"),
            StashError::NotFound => "Not found\n".to_string(),
            StashError::RateLimited { .. } => "Rate limit exceeded\n".to_string(),
            StashError::Upload(_) if status == StatusCode::PAYLOAD_TOO_LARGE => "Upload too large\n".to_string(),
            StashError::Upload(e) => {
                tracing::info!(error = %e, "Upload aborted");
                "Upload failed\n".to_string()
            }
            other => {
                tracing::error!(error = %other, "Request failed");
                "Server error\n".to_string()
            }
        };

        let mut response = (status, body).into_response();
        if let StashError::RateLimited { retry_after } = &self.0 {
            // Whole seconds, rounded up.
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
