//! BlobStore: filesystem-backed objects with sidecar expiry records.
//!
//! Writes go through a staging file so the content length is known before a
//! locator is allocated. Committing writes the policy record first (with
//! create-new semantics) and then hard-links the staged file into place, so
//! an object is never visible without its expiry being enforceable, and two
//! writers can never overwrite each other.
//!
//! Reads evaluate expiry lazily:
//! - no record: served, never expires
//! - timed and past due: deleted, reported as not found
//! - view-once: the content is claimed by renaming it out of the namespace,
//!   served from the claimed file, and removed once the reader finishes
//! - otherwise: served untouched

use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{IoContext, Result, StashError};
use crate::locator::{Extension, Locator, META_SUFFIX};
use crate::policy::{ExpiryPolicy, PolicyRecord};

/// How many fresh locators `commit` tries before giving up.
pub const MAX_ALLOCATION_ATTEMPTS: usize = 8;

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Filesystem-backed blob store.
#[derive(Debug, Clone)]
pub struct BlobStore {
    config: StoreConfig,
}

impl BlobStore {
    /// Create a store. Directories are created on first write.
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    /// Create a store rooted at `path` with default settings.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self::new(StoreConfig::with_root(path))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn content_path(&self, locator: &Locator) -> PathBuf {
        self.config.root.join(locator.as_str())
    }

    fn meta_path(&self, locator: &Locator) -> PathBuf {
        self.config.root.join(locator.meta_name())
    }

    /// Persist a content stream under a fresh locator.
    ///
    /// Fails with [`StashError::Validation`] if the stream is empty; nothing is
    /// left behind in that case.
    pub async fn put<R>(&self, reader: R, extension: &Extension, policy: ExpiryPolicy) -> Result<Locator>
    where
        R: AsyncRead,
    {
        let staged = self.stage(reader).await?;
        self.commit(staged, extension, policy).await
    }

    /// Stream content into the staging area.
    ///
    /// The returned handle removes its file when dropped uncommitted.
    #[tracing::instrument(name = "stash.stage", skip_all, fields(stash.size = tracing::field::Empty))]
    pub async fn stage<R>(&self, reader: R) -> Result<Staged>
    where
        R: AsyncRead,
    {
        let mut reader = std::pin::pin!(reader);
        let staging_dir = self.config.staging_dir();
        fs::create_dir_all(&staging_dir)
            .await
            .storage("failed to create staging directory", &staging_dir)?;

        let path = staging_dir.join(Uuid::new_v4().simple().to_string());
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .storage("failed to create staging file", &path)?;

        let mut staged = Staged {
            path,
            size: 0,
            armed: true,
        };

        let copied = async {
            let mut buf = vec![0u8; COPY_BUF_SIZE];
            loop {
                let n = reader.as_mut().read(&mut buf).await.map_err(StashError::Upload)?;
                if n == 0 {
                    break;
                }
                file.write_all(&buf[..n])
                    .await
                    .storage("failed to write staging file", &staged.path)?;
                staged.size += n as u64;
            }
            if staged.size > 0 {
                file.sync_all()
                    .await
                    .storage("failed to sync staging file", &staged.path)?;
            }
            Ok::<_, StashError>(())
        }
        .await;
        drop(file);

        if let Err(e) = copied {
            staged.discard().await;
            return Err(e);
        }
        if staged.size == 0 {
            staged.discard().await;
            return Err(StashError::Validation("empty upload".to_string()));
        }

        tracing::Span::current().record("stash.size", staged.size);
        Ok(staged)
    }

    /// Allocate a locator and move a staged upload into place.
    #[tracing::instrument(
        name = "stash.commit",
        skip_all,
        fields(stash.size = staged.size, stash.locator = tracing::field::Empty)
    )]
    pub async fn commit(&self, mut staged: Staged, extension: &Extension, policy: ExpiryPolicy) -> Result<Locator> {
        let linked = self.link_staged(&staged, extension, &policy).await;
        staged.discard().await;
        linked
    }

    async fn link_staged(&self, staged: &Staged, extension: &Extension, policy: &ExpiryPolicy) -> Result<Locator> {
        let record = policy.to_record().map(|r| serde_json::to_vec(&r)).transpose()?;

        for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
            let locator = Locator::generate(self.config.id_length, extension);
            let content_path = self.content_path(&locator);
            let meta_path = self.meta_path(&locator);

            // The record goes down first; a crash after this point leaves an
            // orphaned record for the janitor, never an unenforceable object.
            match &record {
                Some(bytes) => match write_new(&meta_path, bytes).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        tracing::debug!(locator = %locator, attempt, "Locator collision on policy record");
                        continue;
                    }
                    Err(e) => return Err(StashError::storage("failed to write policy record", meta_path, e)),
                },
                None => {
                    // A leftover record would silently attach to the new object.
                    let stale = fs::try_exists(&meta_path)
                        .await
                        .storage("failed to check policy record", &meta_path)?;
                    if stale {
                        tracing::debug!(locator = %locator, attempt, "Locator collision on stale record");
                        continue;
                    }
                }
            }

            match fs::hard_link(&staged.path, &content_path).await {
                Ok(()) => {
                    tracing::Span::current().record("stash.locator", locator.as_str());
                    tracing::info!(
                        locator = %locator,
                        size = staged.size,
                        policy = ?policy,
                        "Stored object"
                    );
                    return Ok(locator);
                }
                Err(e) => {
                    if record.is_some() {
                        remove_if_exists(&meta_path).await.ok();
                    }
                    if e.kind() == io::ErrorKind::AlreadyExists {
                        tracing::debug!(locator = %locator, attempt, "Locator collision on content");
                        continue;
                    }
                    return Err(StashError::storage("failed to link content", content_path, e));
                }
            }
        }

        tracing::error!(attempts = MAX_ALLOCATION_ATTEMPTS, "Locator allocation exhausted");
        Err(StashError::Exhausted {
            attempts: MAX_ALLOCATION_ATTEMPTS,
        })
    }

    /// Read an object, applying its expiry policy at the current time.
    pub async fn get(&self, locator: &str) -> Result<Blob> {
        self.get_at(locator, Utc::now()).await
    }

    /// Read an object, evaluating expiry against `now`.
    ///
    /// Malformed, missing and expired locators are all [`StashError::NotFound`].
    #[tracing::instrument(name = "stash.get", skip(self, now), fields(stash.policy = tracing::field::Empty))]
    pub async fn get_at(&self, locator: &str, now: DateTime<Utc>) -> Result<Blob> {
        let locator = Locator::parse(locator).map_err(|_| StashError::NotFound)?;
        let policy = self.load_policy(&locator, now).await?;
        tracing::Span::current().record("stash.policy", tracing::field::debug(&policy));

        match policy {
            ExpiryPolicy::Timed { .. } if policy.is_expired_at(now) => {
                tracing::info!(locator = %locator, "Object expired, removing");
                self.delete_best_effort(&locator).await;
                Err(StashError::NotFound)
            }
            ExpiryPolicy::OnView => self.claim(locator, now).await,
            ExpiryPolicy::Never | ExpiryPolicy::Timed { .. } => {
                let path = self.content_path(&locator);
                let file = match File::open(&path).await {
                    Ok(file) => file,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StashError::NotFound),
                    Err(e) => return Err(StashError::storage("failed to open content", path, e)),
                };
                let len = file
                    .metadata()
                    .await
                    .storage("failed to stat content", &path)?
                    .len();

                Ok(Blob {
                    locator,
                    len,
                    policy,
                    reader: BlobReader::new(file, None),
                })
            }
        }
    }

    /// Describe an object without reading it.
    ///
    /// Unlike [`BlobStore::get`], this never consumes a view-once object.
    /// Expired timed objects are removed and reported as not found.
    pub async fn stat(&self, locator: &str) -> Result<ObjectInfo> {
        self.stat_at(locator, Utc::now()).await
    }

    pub async fn stat_at(&self, locator: &str, now: DateTime<Utc>) -> Result<ObjectInfo> {
        let locator = Locator::parse(locator).map_err(|_| StashError::NotFound)?;
        let policy = self.load_policy(&locator, now).await?;

        if policy.is_expired_at(now) {
            self.delete_best_effort(&locator).await;
            return Err(StashError::NotFound);
        }

        let path = self.content_path(&locator);
        match fs::metadata(&path).await {
            Ok(meta) => Ok(ObjectInfo {
                locator,
                len: meta.len(),
                policy,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StashError::NotFound),
            Err(e) => Err(StashError::storage("failed to stat content", path, e)),
        }
    }

    /// Whether content currently exists for `locator` (expiry not evaluated).
    pub async fn exists(&self, locator: &str) -> bool {
        match Locator::parse(locator) {
            Ok(locator) => fs::try_exists(self.content_path(&locator)).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// The policy currently recorded for `locator`.
    pub async fn policy(&self, locator: &str) -> Result<ExpiryPolicy> {
        let locator = Locator::parse(locator).map_err(|_| StashError::NotFound)?;
        self.load_policy(&locator, Utc::now()).await
    }

    async fn load_policy(&self, locator: &Locator, now: DateTime<Utc>) -> Result<ExpiryPolicy> {
        let path = self.meta_path(locator);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ExpiryPolicy::Never),
            Err(e) => return Err(StashError::storage("failed to read policy record", path, e)),
        };

        match serde_json::from_slice::<PolicyRecord>(&bytes) {
            Ok(record) => Ok(record.policy_at(now)),
            Err(source) if self.config.strict_metadata => Err(StashError::Metadata { path, source }),
            Err(e) => {
                tracing::warn!(
                    locator = %locator,
                    error = %e,
                    "Unreadable policy record, treating object as never-expiring"
                );
                Ok(ExpiryPolicy::Never)
            }
        }
    }

    /// Take exclusive ownership of a view-once object.
    ///
    /// The claim name carries the claim time, since `rename` keeps the
    /// upload's mtime and the janitor must not age a live read by it.
    async fn claim(&self, locator: Locator, now: DateTime<Utc>) -> Result<Blob> {
        let claimed_dir = self.config.claimed_dir();
        fs::create_dir_all(&claimed_dir)
            .await
            .storage("failed to create claim directory", &claimed_dir)?;

        let content_path = self.content_path(&locator);
        let claimed = claimed_dir.join(format!(
            "{}.{}.{}",
            locator,
            now.timestamp_millis(),
            Uuid::new_v4().simple()
        ));

        // rename() is atomic: exactly one concurrent reader wins.
        match fs::rename(&content_path, &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StashError::NotFound),
            Err(e) => return Err(StashError::storage("failed to claim content", content_path, e)),
        }

        let opened = async {
            let file = File::open(&claimed).await?;
            let len = file.metadata().await?.len();
            Ok::<_, io::Error>((file, len))
        }
        .await;

        let (file, len) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                if let Err(restore) = fs::rename(&claimed, &content_path).await {
                    tracing::warn!(locator = %locator, error = %restore, "Failed to release claim");
                }
                return Err(StashError::storage("failed to open claimed content", claimed, e));
            }
        };

        tracing::debug!(locator = %locator, "Claimed view-once object");
        let cleanup = ViewCleanup {
            locator: locator.clone(),
            claimed,
            meta: self.meta_path(&locator),
        };

        Ok(Blob {
            locator,
            len,
            policy: ExpiryPolicy::OnView,
            reader: BlobReader::new(file, Some(cleanup)),
        })
    }

    /// Remove an object's content and policy record. Absent entries are fine.
    pub async fn delete(&self, locator: &str) -> Result<()> {
        match Locator::parse(locator) {
            Ok(locator) => self.delete_locator(&locator).await,
            Err(_) => Ok(()),
        }
    }

    async fn delete_locator(&self, locator: &Locator) -> Result<()> {
        let content = self.content_path(locator);
        let meta = self.meta_path(locator);

        let content_result = remove_if_exists(&content)
            .await
            .storage("failed to remove content", &content);
        let meta_result = remove_if_exists(&meta)
            .await
            .storage("failed to remove policy record", &meta);

        content_result?;
        meta_result?;
        tracing::debug!(locator = %locator, "Deleted object");
        Ok(())
    }

    async fn delete_best_effort(&self, locator: &Locator) {
        if let Err(e) = self.delete_locator(locator).await {
            tracing::warn!(locator = %locator, error = %e, "Cleanup of expired object failed");
        }
    }

    /// Remove expired objects and leftovers that lazy evaluation never reaches.
    ///
    /// - timed objects past `now`
    /// - policy records with no content, older than the orphan grace
    /// - staging files and abandoned claims older than the orphan grace
    #[tracing::instrument(name = "stash.sweep", skip(self))]
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let root = &self.config.root;

        let mut entries = match fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(StashError::storage("failed to list storage root", root, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .storage("failed to list storage root", root)?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(META_SUFFIX).and_then(|s| s.strip_suffix('.')) else {
                continue;
            };
            let Ok(locator) = Locator::parse(stem) else { continue };

            match self.load_policy(&locator, now).await {
                Ok(policy) if policy.is_expired_at(now) => {
                    self.delete_best_effort(&locator).await;
                    report.expired += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(locator = %locator, error = %e, "Skipping unreadable record");
                    continue;
                }
            }

            let content_missing = !fs::try_exists(self.content_path(&locator)).await.unwrap_or(true);
            let path = entry.path();
            if content_missing
                && older_than(&path, now, self.config.orphan_grace).await
                && remove_if_exists(&path).await.is_ok()
            {
                report.orphaned_records += 1;
            }
        }

        report.stale_staging = self.sweep_dir(&self.config.staging_dir(), now).await;
        report.stale_claims = self.sweep_claims(now).await;

        if report.total() > 0 {
            tracing::info!(
                expired = report.expired,
                orphaned_records = report.orphaned_records,
                stale_staging = report.stale_staging,
                stale_claims = report.stale_claims,
                "Store sweep completed"
            );
        }

        Ok(report)
    }

    async fn sweep_dir(&self, dir: &Path, now: DateTime<Utc>) -> usize {
        let Ok(mut entries) = fs::read_dir(dir).await else {
            return 0;
        };

        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if older_than(&path, now, self.config.orphan_grace).await && remove_if_exists(&path).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }

    /// Remove claims abandoned longer than the grace period, aged by the
    /// claim time in their name.
    async fn sweep_claims(&self, now: DateTime<Utc>) -> usize {
        let Ok(mut entries) = fs::read_dir(self.config.claimed_dir()).await else {
            return 0;
        };

        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let stale = match entry.file_name().to_str().and_then(claimed_at) {
                Some(claimed) => (now - claimed)
                    .to_std()
                    .is_ok_and(|age| age > self.config.orphan_grace),
                None => older_than(&path, now, self.config.orphan_grace).await,
            };
            if stale && remove_if_exists(&path).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }
}

/// Claim time encoded in a claim file name (`<locator>.<millis>.<uuid>`).
fn claimed_at(name: &str) -> Option<DateTime<Utc>> {
    let mut parts = name.rsplitn(3, '.');
    let _uuid = parts.next()?;
    let millis = parts.next()?.parse::<i64>().ok()?;
    parts.next()?;
    DateTime::from_timestamp_millis(millis)
}

/// Counts from one janitor pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub orphaned_records: usize,
    pub stale_staging: usize,
    pub stale_claims: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.expired + self.orphaned_records + self.stale_staging + self.stale_claims
    }
}

/// Spawn a background task that periodically runs [`BlobStore::sweep_expired`].
pub fn spawn_janitor(
    store: Arc<BlobStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Store janitor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = store.sweep_expired(Utc::now()).await {
                        tracing::warn!(error = %e, "Store sweep failed");
                    }
                }
            }
        }
    })
}

/// An upload sitting in the staging area.
#[derive(Debug)]
pub struct Staged {
    path: PathBuf,
    size: u64,
    armed: bool,
}

impl Staged {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the staging file now rather than on drop.
    async fn discard(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        if let Err(e) = remove_if_exists(&self.path).await {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove staging file");
        }
    }
}

impl Drop for Staged {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let path = std::mem::take(&mut self.path);
        run_detached(move || {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove staging file");
                }
            }
        });
    }
}

/// Size and policy of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub locator: Locator,
    pub len: u64,
    pub policy: ExpiryPolicy,
}

/// A readable object.
#[derive(Debug)]
pub struct Blob {
    pub locator: Locator,
    /// Content length in bytes.
    pub len: u64,
    /// Policy in force when the object was opened.
    pub policy: ExpiryPolicy,
    pub reader: BlobReader,
}

impl Blob {
    pub fn into_reader(self) -> BlobReader {
        self.reader
    }

    /// Read the whole object into memory.
    pub async fn into_bytes(self) -> io::Result<Vec<u8>> {
        let mut reader = self.reader;
        let mut data = Vec::with_capacity(self.len as usize);
        reader.read_to_end(&mut data).await?;
        Ok(data)
    }
}

/// Content stream for a [`Blob`].
///
/// For view-once objects, the claimed file and its record are removed as soon
/// as the reader reaches EOF, or when it is dropped early.
#[derive(Debug)]
pub struct BlobReader {
    file: File,
    cleanup: Option<ViewCleanup>,
}

impl BlobReader {
    fn new(file: File, cleanup: Option<ViewCleanup>) -> Self {
        Self { file, cleanup }
    }

    /// Whether this reader deletes its object when finished.
    pub fn is_view_once(&self) -> bool {
        self.cleanup.is_some()
    }
}

impl AsyncRead for BlobReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        let asked = buf.remaining() > 0;

        let poll = Pin::new(&mut this.file).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            if asked && buf.filled().len() == before {
                if let Some(cleanup) = this.cleanup.take() {
                    cleanup.run(true);
                }
            }
        }
        poll
    }
}

impl Drop for BlobReader {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.run(false);
        }
    }
}

#[derive(Debug)]
struct ViewCleanup {
    locator: Locator,
    claimed: PathBuf,
    meta: PathBuf,
}

impl ViewCleanup {
    /// Failures are logged only; the read already succeeded.
    fn run(self, delivered: bool) {
        if !delivered {
            tracing::debug!(locator = %self.locator, "View-once reader dropped before EOF");
        }

        let work = move || {
            for path in [&self.claimed, &self.meta] {
                if let Err(e) = std::fs::remove_file(path) {
                    if e.kind() != io::ErrorKind::NotFound {
                        tracing::warn!(
                            locator = %self.locator,
                            path = %path.display(),
                            error = %e,
                            "Failed to remove viewed object"
                        );
                    }
                }
            }
            tracing::info!(locator = %self.locator, "Removed view-once object");
        };

        run_detached(work);
    }
}

/// Run blocking cleanup from a `Drop` impl: on the blocking pool inside a
/// runtime, inline otherwise.
fn run_detached(work: impl FnOnce() + Send + 'static) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(work);
        }
        Err(_) => work(),
    }
}

async fn write_new(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;

    let written = async {
        file.write_all(bytes).await?;
        file.sync_all().await
    }
    .await;

    if written.is_err() {
        remove_if_exists(path).await.ok();
    }
    written
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

async fn older_than(path: &Path, now: DateTime<Utc>, grace: Duration) -> bool {
    let Ok(modified) = fs::metadata(path).await.and_then(|m| m.modified()) else {
        return false;
    };
    let modified: DateTime<Utc> = modified.into();
    match (now - modified).to_std() {
        Ok(age) => age > grace,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn store() -> (BlobStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        (BlobStore::at_path(temp_dir.path()), temp_dir)
    }

    fn txt() -> Extension {
        Extension::text()
    }

    /// Drop-time cleanup runs on the blocking pool; poll until it lands.
    async fn eventually_gone(path: &Path) -> bool {
        for _ in 0..100 {
            if !path.exists() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        !path.exists()
    }

    fn dir_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).map(|mut d| d.next().is_none()).unwrap_or(true)
    }

    #[tokio::test]
    async fn test_put_and_get_never() -> anyhow::Result<()> {
        let (store, _temp) = store();

        let locator = store.put(&b"hello"[..], &txt(), ExpiryPolicy::Never).await?;
        assert!(locator.as_str().ends_with(".txt"));
        assert_eq!(locator.id().len(), 6);

        for _ in 0..3 {
            let blob = store.get(locator.as_str()).await?;
            assert_eq!(blob.len, 5);
            assert_eq!(blob.policy, ExpiryPolicy::Never);
            assert_eq!(blob.into_bytes().await?, b"hello");
        }

        // Never writes no record.
        assert!(!store.meta_path(&locator).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_upload_rejected() -> anyhow::Result<()> {
        let (store, temp) = store();

        let err = store.put(&b""[..], &txt(), ExpiryPolicy::OnView).await.unwrap_err();
        assert!(matches!(err, StashError::Validation(_)));

        // Nothing but the (empty) staging directory remains.
        let leftovers: Vec<_> = std::fs::read_dir(temp.path())?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(leftovers, vec![".staging".to_string()]);
        assert_eq!(std::fs::read_dir(store.config().staging_dir())?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_timed_record_written_before_read() -> anyhow::Result<()> {
        let (store, _temp) = store();
        let now = Utc::now();
        let policy = ExpiryPolicy::expiring_after(now, Duration::from_secs(60)).unwrap();

        let locator = store.put(&b"data"[..], &txt(), policy).await?;
        assert!(store.meta_path(&locator).exists());
        assert_eq!(store.policy(locator.as_str()).await?, policy);
        Ok(())
    }

    #[tokio::test]
    async fn test_timed_expiry_deletes_lazily() -> anyhow::Result<()> {
        let (store, _temp) = store();
        let t0 = Utc::now();
        let policy = ExpiryPolicy::expiring_after(t0, Duration::from_secs(300)).unwrap();
        let locator = store.put(&b"hello"[..], &txt(), policy).await?;

        let blob = store.get_at(locator.as_str(), t0 + ChronoDuration::seconds(60)).await?;
        assert_eq!(blob.into_bytes().await?, b"hello");

        let err = store
            .get_at(locator.as_str(), t0 + ChronoDuration::seconds(360))
            .await
            .unwrap_err();
        assert!(matches!(err, StashError::NotFound));
        assert!(!store.content_path(&locator).exists());
        assert!(!store.meta_path(&locator).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_view_once() -> anyhow::Result<()> {
        let (store, _temp) = store();
        let locator = store.put(&b"secret"[..], &txt(), ExpiryPolicy::OnView).await?;

        let blob = store.get(locator.as_str()).await?;
        assert!(blob.reader.is_view_once());
        assert_eq!(blob.into_bytes().await?, b"secret");

        let err = store.get(locator.as_str()).await.unwrap_err();
        assert!(matches!(err, StashError::NotFound));
        Ok(())
    }

    #[tokio::test]
    async fn test_view_once_cleanup_after_drop() -> anyhow::Result<()> {
        let (store, _temp) = store();
        let locator = store.put(&b"abandoned"[..], &txt(), ExpiryPolicy::OnView).await?;

        let blob = store.get(locator.as_str()).await?;
        assert!(!dir_is_empty(&store.config().claimed_dir()));
        drop(blob);

        assert!(matches!(store.get(locator.as_str()).await, Err(StashError::NotFound)));
        assert!(eventually_gone(&store.meta_path(&locator)).await);
        for _ in 0..100 {
            if dir_is_empty(&store.config().claimed_dir()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(dir_is_empty(&store.config().claimed_dir()));
        Ok(())
    }

    #[tokio::test]
    async fn test_view_record_past_deadline_is_expired() -> anyhow::Result<()> {
        let (store, _temp) = store();
        let t0 = Utc::now();
        let locator = store.put(&b"late"[..], &txt(), ExpiryPolicy::OnView).await?;

        let record = PolicyRecord {
            expires_at: Some(t0 + ChronoDuration::minutes(5)),
            expire_on_view: true,
        };
        std::fs::write(store.meta_path(&locator), serde_json::to_vec(&record)?)?;

        let info = store.stat_at(locator.as_str(), t0).await?;
        assert_eq!(info.policy, ExpiryPolicy::OnView);

        let later = t0 + ChronoDuration::minutes(10);
        assert!(matches!(store.get_at(locator.as_str(), later).await, Err(StashError::NotFound)));
        assert!(!store.content_path(&locator).exists());
        assert!(!store.meta_path(&locator).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_janitor_ages_claims_from_claim_time() -> anyhow::Result<()> {
        let (store, _temp) = store();
        let locator = store.put(&b"slow reader"[..], &txt(), ExpiryPolicy::OnView).await?;

        // Uploaded long ago; rename keeps this mtime on the claimed file.
        let old = std::time::SystemTime::now() - Duration::from_secs(3 * 3600);
        std::fs::File::options()
            .write(true)
            .open(store.content_path(&locator))?
            .set_modified(old)?;

        let blob = store.get(locator.as_str()).await?;

        let report = store.sweep_expired(Utc::now()).await?;
        assert_eq!(report.stale_claims, 0);
        assert!(!dir_is_empty(&store.config().claimed_dir()));
        assert_eq!(blob.into_bytes().await?, b"slow reader");
        Ok(())
    }

    #[tokio::test]
    async fn test_janitor_removes_abandoned_claims() -> anyhow::Result<()> {
        let (store, _temp) = store();
        let claimed_dir = store.config().claimed_dir();
        std::fs::create_dir_all(&claimed_dir)?;

        let stamp = (Utc::now() - ChronoDuration::hours(2)).timestamp_millis();
        std::fs::write(claimed_dir.join(format!("abc123.txt.{stamp}.{}", Uuid::new_v4().simple())), b"x")?;
        let fresh = Utc::now().timestamp_millis();
        std::fs::write(claimed_dir.join(format!("def456.txt.{fresh}.{}", Uuid::new_v4().simple())), b"y")?;

        let report = store.sweep_expired(Utc::now()).await?;
        assert_eq!(report.stale_claims, 1);
        assert_eq!(std::fs::read_dir(&claimed_dir)?.count(), 1);
        Ok(())
    }

    #[test]
    fn test_claimed_at_parses_name() {
        let t = Utc::now();
        let name = format!("abc123.txt.{}.{}", t.timestamp_millis(), Uuid::new_v4().simple());
        assert_eq!(claimed_at(&name).map(|c| c.timestamp_millis()), Some(t.timestamp_millis()));
        assert_eq!(claimed_at("leftover"), None);
        assert_eq!(claimed_at("abc123.txt.notanumber.ffff"), None);
    }

    #[tokio::test]
    async fn test_malformed_locator_not_found() {
        let (store, _temp) = store();
        for bad in ["", "../etc/passwd", "a/b", "abc.meta", ".staging"] {
            assert!(matches!(store.get(bad).await, Err(StashError::NotFound)), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_missing_locator_not_found() {
        let (store, _temp) = store();
        assert!(matches!(store.get("zzzzzz.txt").await, Err(StashError::NotFound)));
    }

    #[tokio::test]
    async fn test_corrupt_record_degrades_to_never() -> anyhow::Result<()> {
        let (store, _temp) = store();
        let locator = store.put(&b"keep"[..], &txt(), ExpiryPolicy::OnView).await?;
        std::fs::write(store.meta_path(&locator), b"{not json")?;

        for _ in 0..2 {
            let blob = store.get(locator.as_str()).await?;
            assert_eq!(blob.policy, ExpiryPolicy::Never);
            assert_eq!(blob.into_bytes().await?, b"keep");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_record_strict() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let store = BlobStore::new(StoreConfig {
            strict_metadata: true,
            ..StoreConfig::with_root(temp.path())
        });
        let locator = store.put(&b"keep"[..], &txt(), ExpiryPolicy::OnView).await?;
        std::fs::write(store.meta_path(&locator), b"garbage")?;

        let err = store.get(locator.as_str()).await.unwrap_err();
        assert!(matches!(err, StashError::Metadata { .. }));
        assert!(err.is_storage());
        Ok(())
    }

    #[tokio::test]
    async fn test_stat_does_not_consume_view_once() -> anyhow::Result<()> {
        let (store, _temp) = store();
        let locator = store.put(&b"peek"[..], &txt(), ExpiryPolicy::OnView).await?;

        for _ in 0..3 {
            let info = store.stat(locator.as_str()).await?;
            assert_eq!(info.len, 4);
            assert_eq!(info.policy, ExpiryPolicy::OnView);
        }
        assert_eq!(store.get(locator.as_str()).await?.into_bytes().await?, b"peek");
        assert!(matches!(store.stat(locator.as_str()).await, Err(StashError::NotFound)));
        Ok(())
    }

    #[tokio::test]
    async fn test_stat_expired_is_not_found() -> anyhow::Result<()> {
        let (store, _temp) = store();
        let t0 = Utc::now();
        let policy = ExpiryPolicy::expiring_after(t0, Duration::from_secs(5)).unwrap();
        let locator = store.put(&b"brief"[..], &txt(), policy).await?;

        assert!(store.stat_at(locator.as_str(), t0).await.is_ok());
        let err = store
            .stat_at(locator.as_str(), t0 + ChronoDuration::seconds(5))
            .await
            .unwrap_err();
        assert!(matches!(err, StashError::NotFound));
        assert!(!store.exists(locator.as_str()).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() -> anyhow::Result<()> {
        let (store, _temp) = store();
        let locator = store.put(&b"bye"[..], &txt(), ExpiryPolicy::OnView).await?;

        store.delete(locator.as_str()).await?;
        assert!(!store.exists(locator.as_str()).await);
        assert!(!store.meta_path(&locator).exists());

        store.delete(locator.as_str()).await?;
        store.delete("../nope").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_collision_retries_with_single_char_ids() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let store = BlobStore::new(StoreConfig {
            id_length: 1,
            ..StoreConfig::with_root(temp.path())
        });

        // 62 possible ids: filling many of them forces retries without overwrites.
        let mut seen = std::collections::HashSet::new();
        for i in 0..30u32 {
            let body = i.to_string();
            match store.put(body.as_bytes(), &txt(), ExpiryPolicy::Never).await {
                Ok(locator) => {
                    assert!(seen.insert(locator.clone()), "locator reused: {locator}");
                    let stored = store.get(locator.as_str()).await?.into_bytes().await?;
                    assert_eq!(stored, body.as_bytes());
                }
                Err(StashError::Exhausted { attempts }) => assert_eq!(attempts, MAX_ALLOCATION_ATTEMPTS),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_record_blocks_never_allocation() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let store = BlobStore::new(StoreConfig {
            id_length: 1,
            ..StoreConfig::with_root(temp.path())
        });
        std::fs::create_dir_all(temp.path())?;

        // Orphaned view-once records for every possible id.
        for c in ('a'..='z').chain('A'..='Z').chain('0'..='9') {
            std::fs::write(temp.path().join(format!("{c}.txt.meta")), br#"{"expire_on_view":true}"#)?;
        }

        let err = store.put(&b"x"[..], &txt(), ExpiryPolicy::Never).await.unwrap_err();
        assert!(matches!(err, StashError::Exhausted { .. }));
        assert_eq!(std::fs::read_dir(store.config().staging_dir())?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_staged_dropped_uncommitted_is_removed() -> anyhow::Result<()> {
        let (store, _temp) = store();
        let staged = store.stage(&b"pending"[..]).await?;
        let path = staged.path().to_path_buf();
        assert!(path.exists());
        assert_eq!(staged.size(), 7);

        drop(staged);
        assert!(eventually_gone(&path).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_stage_then_commit() -> anyhow::Result<()> {
        let (store, _temp) = store();
        let staged = store.stage(&b"two-phase"[..]).await?;
        let staging_path = staged.path().to_path_buf();

        let locator = store
            .commit(staged, &Extension::sanitize(Some("notes.md")), ExpiryPolicy::Never)
            .await?;
        assert_eq!(locator.extension(), Some("md"));
        assert!(!staging_path.exists());
        assert_eq!(store.get(locator.as_str()).await?.into_bytes().await?, b"two-phase");
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_error_surfaces() {
        struct Failing;
        impl AsyncRead for Failing {
            fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
                Poll::Ready(Err(io::Error::other("client went away")))
            }
        }

        let (store, _temp) = store();
        let err = store.put(Failing, &txt(), ExpiryPolicy::Never).await.unwrap_err();
        assert!(matches!(err, StashError::Upload(_)));
        assert_eq!(std::fs::read_dir(store.config().staging_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_and_keeps_live() -> anyhow::Result<()> {
        let (store, _temp) = store();
        let t0 = Utc::now();

        let short = store
            .put(&b"short"[..], &txt(), ExpiryPolicy::expiring_after(t0, Duration::from_secs(10)).unwrap())
            .await?;
        let long = store
            .put(&b"long"[..], &txt(), ExpiryPolicy::expiring_after(t0, Duration::from_secs(3600)).unwrap())
            .await?;
        let forever = store.put(&b"forever"[..], &txt(), ExpiryPolicy::Never).await?;

        let report = store.sweep_expired(t0 + ChronoDuration::seconds(60)).await?;
        assert_eq!(report.expired, 1);

        assert!(!store.exists(short.as_str()).await);
        assert!(store.exists(long.as_str()).await);
        assert!(store.exists(forever.as_str()).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_sweep_removes_old_orphans() -> anyhow::Result<()> {
        let (store, temp) = store();
        store.put(&b"seed"[..], &txt(), ExpiryPolicy::Never).await?;

        std::fs::write(temp.path().join("orphan.txt.meta"), br#"{"expire_on_view":true}"#)?;
        std::fs::write(store.config().staging_dir().join("leftover"), b"partial")?;

        // Within grace: untouched.
        let report = store.sweep_expired(Utc::now()).await?;
        assert_eq!(report.total(), 0);

        let later = Utc::now() + ChronoDuration::hours(2);
        let report = store.sweep_expired(later).await?;
        assert_eq!(report.orphaned_records, 1);
        assert_eq!(report.stale_staging, 1);
        assert!(!temp.path().join("orphan.txt.meta").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_sweep_on_missing_root() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let store = BlobStore::at_path(temp.path().join("never-created"));
        assert_eq!(store.sweep_expired(Utc::now()).await?, SweepReport::default());
        Ok(())
    }

    #[tokio::test]
    async fn test_large_upload_streams() -> anyhow::Result<()> {
        let (store, _temp) = store();
        let data = vec![7u8; 3 * COPY_BUF_SIZE + 123];

        let locator = store.put(&data[..], &Extension::sanitize(Some("blob.bin")), ExpiryPolicy::Never).await?;
        let blob = store.get(locator.as_str()).await?;
        assert_eq!(blob.len, data.len() as u64);
        assert_eq!(blob.into_bytes().await?, data);
        Ok(())
    }
}
