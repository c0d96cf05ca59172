use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use stash::{client_key, AdmissionController, BlobStore, StashError};

use super::error::AppError;

/// Shared state for web handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<BlobStore>,
    pub admission: Arc<AdmissionController>,
    /// `<scheme>://<domain>`, prefixed to every returned locator.
    pub base_url: Arc<str>,
    /// Selector applied when an upload names none.
    pub default_expiry: Arc<str>,
    pub max_upload_bytes: usize,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(store: Arc<BlobStore>, admission: Arc<AdmissionController>, base_url: impl Into<Arc<str>>) -> Self {
        Self {
            store,
            admission,
            base_url: base_url.into(),
            default_expiry: Arc::from(""),
            max_upload_bytes: 64 * 1024 * 1024,
            started_at: Instant::now(),
        }
    }

    pub fn with_default_expiry(mut self, selector: impl Into<Arc<str>>) -> Self {
        self.default_expiry = selector.into();
        self
    }

    pub fn with_max_upload_bytes(mut self, max: usize) -> Self {
        self.max_upload_bytes = max;
        self
    }
}

/// Proof that the caller passed admission control.
///
/// Extracting this spends one token from the client's bucket. Requests
/// without connection info (in-process tests, unix sockets) share one key.
#[derive(Debug, Clone)]
pub struct Admitted {
    pub client: String,
}

impl FromRequestParts<AppState> for Admitted {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let client = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| client_key(addr))
            .unwrap_or_else(|| "unknown".to_string());

        state.admission.check(&client).into_result().map_err(|err| {
            if let StashError::RateLimited { retry_after } = &err {
                tracing::info!(
                    client = %client,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Rate limited"
                );
            }
            AppError::from(err)
        })?;

        Ok(Admitted { client })
    }
}
