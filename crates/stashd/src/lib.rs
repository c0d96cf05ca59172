//! stashd: HTTP front end for the `stash` blob store.
//!
//! `GET /` serves a usage page, `POST /` stores an upload and answers with its
//! URL, `GET /{locator}` streams an object back, `GET /health` reports status.

pub mod mime;
pub mod serve;
pub mod telemetry;
pub mod web;

pub use serve::{run, ServeConfig};
pub use web::{router, AppState};
