//! Store configuration.
//!
//! Layout under `root`:
//! ```text
//! {root}/
//! ├── aB3xY9.txt          # content
//! ├── aB3xY9.txt.meta     # policy record (only for non-Never policies)
//! ├── .staging/           # uploads in flight
//! └── .claimed/           # view-once objects being served
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::locator::DEFAULT_ID_LENGTH;

/// Configuration for [`crate::BlobStore`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory holding content and policy records.
    pub root: PathBuf,

    /// Length of generated ids.
    #[serde(default = "default_id_length")]
    pub id_length: usize,

    /// Fail reads on an undecodable policy record instead of treating the
    /// object as never-expiring.
    #[serde(default)]
    pub strict_metadata: bool,

    /// Age after which leftovers (staging files, abandoned claims, records
    /// without content) are removed by the janitor.
    #[serde(default = "default_orphan_grace", with = "secs")]
    pub orphan_grace: Duration,
}

fn default_id_length() -> usize {
    DEFAULT_ID_LENGTH
}

fn default_orphan_grace() -> Duration {
    Duration::from_secs(3600)
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

impl StoreConfig {
    /// Config rooted at `path` with defaults for everything else.
    pub fn with_root(path: impl Into<PathBuf>) -> Self {
        Self {
            root: path.into(),
            id_length: DEFAULT_ID_LENGTH,
            strict_metadata: false,
            orphan_grace: default_orphan_grace(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for uploads that have not been committed yet.
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(".staging")
    }

    /// Directory for view-once objects claimed by a reader.
    pub fn claimed_dir(&self) -> PathBuf {
        self.root.join(".claimed")
    }
}
