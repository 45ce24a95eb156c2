//! Access token storage and the refresh lock
//!
//! [`CredentialStore`] and [`RefreshLock`] are the seams for swapping the
//! default files for a shared cache or a distributed lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::Result;

/// Lifetime assumed for a legacy cache file that holds only the raw token
pub const LEGACY_TOKEN_LIFETIME_SECS: u64 = 7200;

/// Cached access token with its issuance time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedCredential {
    pub access_token: String,
    /// Unix seconds
    pub issued_at: i64,
    /// Lifetime in seconds
    pub expires_in: u64,
}

impl CachedCredential {
    pub fn new(access_token: String, issued_at: i64, expires_in: u64) -> Self {
        Self {
            access_token,
            issued_at,
            expires_in,
        }
    }

    /// Valid strictly while `now < issued_at + expires_in`
    pub fn is_fresh_at(&self, now: i64) -> bool {
        let expires_at = self.issued_at.saturating_add_unsigned(self.expires_in);
        now < expires_at
    }
}

/// Durable slot for a single access token
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet
    async fn load(&self) -> Result<Option<CachedCredential>>;

    async fn save(&self, credential: &CachedCredential) -> Result<()>;
}

/// Cooperative lock held while a refresh is in flight
#[async_trait]
pub trait RefreshLock: Send + Sync {
    async fn is_held(&self) -> Result<bool>;

    /// `Ok(None)` when another actor holds the lock
    async fn try_acquire(&self) -> Result<Option<LockGuard>>;
}

/// Releases the lock when dropped
pub struct LockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

// =============================================================================
// File Backend
// =============================================================================

/// Token cache file
///
/// Stores a JSON [`CachedCredential`]. A file holding only the raw token is
/// read with its modification time as the issuance time.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load_legacy(&self, raw: &str) -> Result<Option<CachedCredential>> {
        let token = raw.trim();
        if token.is_empty() {
            return Ok(None);
        }

        let modified = fs::metadata(&self.path).await?.modified()?;
        let issued_at = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();

        debug!("Read legacy token cache {:?}", self.path);
        Ok(Some(CachedCredential::new(
            token.to_string(),
            issued_at,
            LEGACY_TOKEN_LIFETIME_SECS,
        )))
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<CachedCredential>> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<CachedCredential>(&raw) {
            Ok(credential) => Ok(Some(credential)),
            Err(_) => self.load_legacy(&raw).await,
        }
    }

    async fn save(&self, credential: &CachedCredential) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }

        // Write then rename so readers never see a partial record
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".part");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, serde_json::to_vec(credential)?).await?;
        fs::rename(&tmp, &self.path).await?;

        debug!("Saved access token to {:?}", self.path);
        Ok(())
    }
}

/// Lock marker file; exists while a refresh is in flight
///
/// A marker older than `stale_after` is taken to be left behind by a
/// refresher that died without releasing it, and is removed.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    stale_after: Option<Duration>,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stale_after: None,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the marker if it is orphaned; true when the lock is free afterwards
    async fn clear_if_stale(&self) -> Result<bool> {
        let Some(stale_after) = self.stale_after else {
            return Ok(false);
        };

        let modified = match fs::metadata(&self.path).await {
            Ok(meta) => meta.modified()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };

        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age < stale_after {
            return Ok(false);
        }

        warn!(
            "Removing stale refresh lock {:?} (held for {}s)",
            self.path,
            age.as_secs()
        );
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_marker(&self) -> Result<Option<LockGuard>> {
        let created = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await;

        match created {
            Ok(_) => {
                debug!("Acquired refresh lock {:?}", self.path);
                let path = self.path.clone();
                Ok(Some(LockGuard::new(move || {
                    if let Err(e) = std::fs::remove_file(&path) {
                        warn!("Failed to release refresh lock {:?}: {}", path, e);
                    }
                })))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl RefreshLock for FileLock {
    async fn is_held(&self) -> Result<bool> {
        if !fs::try_exists(&self.path).await? {
            return Ok(false);
        }
        Ok(!self.clear_if_stale().await?)
    }

    async fn try_acquire(&self) -> Result<Option<LockGuard>> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }

        if let Some(guard) = self.create_marker().await? {
            return Ok(Some(guard));
        }

        if self.clear_if_stale().await? {
            return self.create_marker().await;
        }
        Ok(None)
    }
}

// =============================================================================
// In-Memory Backend
// =============================================================================

/// Process-local token store
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    slot: Arc<Mutex<Option<CachedCredential>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: CachedCredential) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(credential))),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<CachedCredential>> {
        Ok(self.slot.lock().clone())
    }

    async fn save(&self, credential: &CachedCredential) -> Result<()> {
        *self.slot.lock() = Some(credential.clone());
        Ok(())
    }
}

/// Process-local refresh lock
#[derive(Debug, Clone, Default)]
pub struct MemoryLock {
    held: Arc<AtomicBool>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RefreshLock for MemoryLock {
    async fn is_held(&self) -> Result<bool> {
        Ok(self.held.load(Ordering::Acquire))
    }

    async fn try_acquire(&self) -> Result<Option<LockGuard>> {
        if self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(None);
        }

        let held = self.held.clone();
        Ok(Some(LockGuard::new(move || {
            held.store(false, Ordering::Release)
        })))
    }
}
