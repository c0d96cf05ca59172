//! Ephemeral blob storage.
//!
//! Objects are deposited as byte streams and retrieved by a short random
//! locator. Each object may carry an expiry policy: gone after a fixed
//! instant, or gone after its first complete read.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use stash::{BlobStore, Extension, ExpiryPolicy};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let store = BlobStore::at_path("/var/lib/stash");
//!
//! let locator = store
//!     .put(&b"hello"[..], &Extension::sanitize(Some("note.txt")), ExpiryPolicy::OnView)
//!     .await?;
//!
//! let blob = store.get(locator.as_str()).await?;
//! let data = blob.into_bytes().await?;
//! assert_eq!(data, b"hello");
//!
//! // Second read: the object is gone.
//! assert!(store.get(locator.as_str()).await.is_err());
//! # Ok(())
//! # }
//! ```
//!
//! # Admission
//!
//! [`AdmissionController`] is a per-client token bucket meant to sit in
//! front of every store operation. It lives outside the store so callers
//! choose the client key.

pub mod admission;
pub mod config;
pub mod error;
pub mod locator;
pub mod policy;
pub mod store;

pub use admission::{client_key, spawn_sweeper, Admission, AdmissionConfig, AdmissionController};
pub use config::StoreConfig;
pub use error::{Result, StashError};
pub use locator::{generate_id, Extension, Locator, LocatorError, DEFAULT_ID_LENGTH};
pub use policy::{parse_duration, ExpiryPolicy, PolicyRecord, SelectorError};
pub use store::{
    spawn_janitor, Blob, BlobReader, BlobStore, ObjectInfo, Staged, SweepReport, MAX_ALLOCATION_ATTEMPTS,
};
