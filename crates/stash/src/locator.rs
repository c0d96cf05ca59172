//! Locators: short random ids plus a sanitized extension.
//!
//! A locator is the only handle a client ever holds on a stored object. It is
//! also used verbatim as a filename under the storage root, so parsing is a
//! closed allow-list: `[A-Za-z0-9]{1,64}` optionally followed by one `.` and
//! `[A-Za-z0-9]{1,16}`.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default id length: 62^6 ≈ 5.68e10 distinct values.
pub const DEFAULT_ID_LENGTH: usize = 6;

/// Longest id accepted when parsing a locator.
pub const MAX_ID_LENGTH: usize = 64;

/// Longest extension (excluding the dot).
pub const MAX_EXTENSION_LENGTH: usize = 16;

/// Suffix reserved for sidecar policy records.
pub(crate) const META_SUFFIX: &str = "meta";

/// Generate `length` characters drawn uniformly from `[A-Za-z0-9]`.
///
/// A zero length is clamped to one.
pub fn generate_id(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length.max(1))
        .map(char::from)
        .collect()
}

/// Errors from parsing a locator string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocatorError {
    #[error("empty locator")]
    Empty,

    #[error("locator id must be 1-64 alphanumeric chars")]
    InvalidId,

    #[error("locator extension must be 1-16 alphanumeric chars")]
    InvalidExtension,

    #[error("extension is reserved")]
    Reserved,
}

/// A file extension restricted to a single leading dot and ASCII alphanumerics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Extension(String);

impl Extension {
    /// Fallback used when the caller supplies nothing usable.
    pub fn text() -> Self {
        Self(".txt".to_string())
    }

    /// Clamp an untrusted filename to a safe suffix.
    ///
    /// Takes the text after the last dot of the final path component, drops
    /// everything that is not ASCII alphanumeric, lowercases and
    /// truncates. An empty or reserved result falls back to `.txt`.
    pub fn sanitize(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::text();
        };

        // Strip any directory component a client smuggled into the filename.
        let name = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
        let tail = match name.rfind('.') {
            Some(idx) => &name[idx + 1..],
            None => "",
        };

        let cleaned: String = tail
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .take(MAX_EXTENSION_LENGTH)
            .map(|c| c.to_ascii_lowercase())
            .collect();

        if cleaned.is_empty() || cleaned == META_SUFFIX {
            Self::text()
        } else {
            Self(format!(".{cleaned}"))
        }
    }

    /// The extension including its leading dot.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The extension without the dot.
    pub fn bare(&self) -> &str {
        &self.0[1..]
    }
}

impl Default for Extension {
    fn default() -> Self {
        Self::text()
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle for a stored object: `<id><extension>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Locator {
    raw: String,
    id_len: usize,
}

impl Locator {
    /// Generate a fresh locator with a random id of `id_length` chars.
    pub fn generate(id_length: usize, extension: &Extension) -> Self {
        let id = generate_id(id_length);
        let id_len = id.len();
        Self {
            raw: format!("{id}{extension}"),
            id_len,
        }
    }

    /// Parse and validate a client-supplied locator.
    pub fn parse(s: &str) -> Result<Self, LocatorError> {
        if s.is_empty() {
            return Err(LocatorError::Empty);
        }

        let (id, ext) = match s.split_once('.') {
            Some((id, ext)) => (id, Some(ext)),
            None => (s, None),
        };

        if id.is_empty()
            || id.len() > MAX_ID_LENGTH
            || !id.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            return Err(LocatorError::InvalidId);
        }

        if let Some(ext) = ext {
            if ext.is_empty()
                || ext.len() > MAX_EXTENSION_LENGTH
                || !ext.bytes().all(|b| b.is_ascii_alphanumeric())
            {
                return Err(LocatorError::InvalidExtension);
            }
            if ext.eq_ignore_ascii_case(META_SUFFIX) {
                return Err(LocatorError::Reserved);
            }
        }

        Ok(Self {
            raw: s.to_string(),
            id_len: id.len(),
        })
    }

    /// The random id portion.
    pub fn id(&self) -> &str {
        &self.raw[..self.id_len]
    }

    /// The extension without its dot, if any.
    pub fn extension(&self) -> Option<&str> {
        self.raw[self.id_len..].strip_prefix('.')
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Filename of the sidecar policy record.
    pub(crate) fn meta_name(&self) -> String {
        format!("{}.{META_SUFFIX}", self.raw)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Locator {
    type Err = LocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Locator {
    type Error = LocatorError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Locator> for String {
    fn from(locator: Locator) -> Self {
        locator.raw
    }
}

impl AsRef<str> for Locator {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}
