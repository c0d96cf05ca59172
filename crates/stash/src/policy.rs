//! Expiry policies and their sidecar records.
//!
//! Only non-`Never` policies are persisted. The sidecar is JSON:
//!
//! ```json
//! {"expires_at": "2026-10-16T12:05:00Z", "expire_on_view": false}
//! ```

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Rule governing automatic deletion of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpiryPolicy {
    /// Kept until explicitly deleted. No record is written.
    #[default]
    Never,
    /// Gone for every read at or after `expires_at`.
    Timed { expires_at: DateTime<Utc> },
    /// Served exactly once, then deleted.
    OnView,
}

/// Errors from parsing an expiry selector.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("missing number before unit in {0:?}")]
    MissingNumber(String),

    #[error("missing unit after number in {0:?}; use s, m or h")]
    MissingUnit(String),

    #[error("unknown unit {unit:?} in {selector:?}; use s, m or h")]
    UnknownUnit { selector: String, unit: String },

    #[error("duration {0:?} is out of range")]
    Overflow(String),
}

impl ExpiryPolicy {
    /// Resolve a client selector against `now`.
    ///
    /// - `""` or `"0"`: [`ExpiryPolicy::Never`]
    /// - `"view"`: [`ExpiryPolicy::OnView`]
    /// - `<int><unit>` terms, unit in `s`/`m`/`h` (`5m`, `1h30m`): timed
    ///
    /// A duration summing to zero is `Never`.
    pub fn from_selector(selector: &str, now: DateTime<Utc>) -> Result<Self, SelectorError> {
        let selector = selector.trim();
        match selector {
            "" | "0" => Ok(Self::Never),
            "view" => Ok(Self::OnView),
            other => {
                let ttl = parse_duration(other)?;
                if ttl.is_zero() {
                    return Ok(Self::Never);
                }
                Self::expiring_after(now, ttl).ok_or_else(|| SelectorError::Overflow(other.to_string()))
            }
        }
    }

    /// Timed policy expiring `ttl` after `now`, or `None` on overflow.
    pub fn expiring_after(now: DateTime<Utc>, ttl: Duration) -> Option<Self> {
        let delta = ChronoDuration::from_std(ttl).ok()?;
        now.checked_add_signed(delta)
            .map(|expires_at| Self::Timed { expires_at })
    }

    /// Whether a record must be persisted for this policy.
    pub fn is_persisted(&self) -> bool {
        !matches!(self, Self::Never)
    }

    /// Whether a read at `now` must treat the object as gone.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Timed { expires_at } => now >= *expires_at,
            Self::Never | Self::OnView => false,
        }
    }

    /// The sidecar record for this policy, `None` for `Never`.
    pub fn to_record(&self) -> Option<PolicyRecord> {
        match self {
            Self::Never => None,
            Self::Timed { expires_at } => Some(PolicyRecord {
                expires_at: Some(*expires_at),
                expire_on_view: false,
            }),
            Self::OnView => Some(PolicyRecord {
                expires_at: None,
                expire_on_view: true,
            }),
        }
    }
}

/// Parse one or more `<integer><unit>` terms.
pub fn parse_duration(input: &str) -> Result<Duration, SelectorError> {
    let mut total: u64 = 0;
    let mut rest = input;

    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits_end == 0 {
            return Err(SelectorError::MissingNumber(input.to_string()));
        }
        let (digits, tail) = rest.split_at(digits_end);

        let unit_end = tail.find(|c: char| c.is_ascii_digit()).unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_end);

        let scale: u64 = match unit {
            "" => return Err(SelectorError::MissingUnit(input.to_string())),
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            other => {
                return Err(SelectorError::UnknownUnit {
                    selector: input.to_string(),
                    unit: other.to_string(),
                })
            }
        };

        let value: u64 = digits
            .parse()
            .map_err(|_| SelectorError::Overflow(input.to_string()))?;
        total = value
            .checked_mul(scale)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(|| SelectorError::Overflow(input.to_string()))?;

        rest = next;
    }

    Ok(Duration::from_secs(total))
}

/// On-disk form of a non-`Never` policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PolicyRecord {
    /// Absolute expiry; absent when the policy is not timed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Delete after the first completed read.
    #[serde(default)]
    pub expire_on_view: bool,
}

impl PolicyRecord {
    /// Decode into the policy in force at `now`.
    ///
    /// A record carrying both fields is view-once until `expires_at`, and
    /// expired from then on.
    pub fn policy_at(&self, now: DateTime<Utc>) -> ExpiryPolicy {
        match (self.expires_at, self.expire_on_view) {
            (Some(expires_at), _) if now >= expires_at => ExpiryPolicy::Timed { expires_at },
            (_, true) => ExpiryPolicy::OnView,
            (Some(expires_at), false) => ExpiryPolicy::Timed { expires_at },
            (None, false) => ExpiryPolicy::Never,
        }
    }
}
