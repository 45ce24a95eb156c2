//! Refresh coordination: serve the cached token while fresh, otherwise
//! fetch and store a new one under the refresh lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::fetcher::{CredentialFetcher, HttpCredentialFetcher};
use super::store::{
    CachedCredential, CredentialStore, FileCredentialStore, FileLock, LockGuard, RefreshLock,
};
use crate::config::MpConfig;
use crate::error::{MpError, Result};

/// Access token manager shared by every authenticated call
#[derive(Clone)]
pub struct TokenManager {
    store: Arc<dyn CredentialStore>,
    lock: Arc<dyn RefreshLock>,
    fetcher: Arc<dyn CredentialFetcher>,
    lock_timeout: Duration,
    poll_interval: Duration,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        lock: Arc<dyn RefreshLock>,
        fetcher: Arc<dyn CredentialFetcher>,
    ) -> Self {
        Self {
            store,
            lock,
            fetcher,
            lock_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// File-backed manager configured from `config`
    pub fn from_config(config: &MpConfig, http_client: Client) -> Self {
        let fetcher = HttpCredentialFetcher::new(
            config.app_id.clone(),
            config.app_secret.clone(),
            config.api_base.clone(),
            config.max_token_lifetime_secs,
            http_client,
        );

        Self::new(
            Arc::new(FileCredentialStore::new(config.tmp_name.clone())),
            Arc::new(FileLock::new(config.lock_path()).with_stale_after(config.lock_timeout())),
            Arc::new(fetcher),
        )
        .with_lock_timing(config.lock_timeout(), config.lock_poll_interval())
    }

    pub fn with_lock_timing(mut self, lock_timeout: Duration, poll_interval: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self.poll_interval = poll_interval;
        self
    }

    /// Return a valid access token, refreshing it if the cached one is stale
    pub async fn fresh(&self) -> Result<String> {
        let deadline = Instant::now() + self.lock_timeout;

        loop {
            if self.lock.is_held().await? {
                self.wait_for_lock(deadline).await?;
                continue;
            }

            if let Some(cached) = self.load_fresh().await? {
                debug!("Using cached access token");
                return Ok(cached.access_token);
            }

            let Some(guard) = self.lock.try_acquire().await? else {
                // Lost the race to another refresher
                self.wait_for_lock(deadline).await?;
                continue;
            };

            // Another actor may have refreshed between our read and the lock
            if let Some(cached) = self.load_fresh().await? {
                debug!("Access token refreshed by another caller");
                return Ok(cached.access_token);
            }

            return self.fetch_and_store(guard).await;
        }
    }

    /// Fetch a new token even if the cached one has not expired yet
    pub async fn refresh(&self) -> Result<String> {
        let deadline = Instant::now() + self.lock_timeout;

        loop {
            match self.lock.try_acquire().await? {
                Some(guard) => return self.fetch_and_store(guard).await,
                None => {
                    // Someone else is refreshing; their token is as new as ours would be
                    self.wait_for_lock(deadline).await?;
                    if let Some(cached) = self.load_fresh().await? {
                        return Ok(cached.access_token);
                    }
                }
            }
        }
    }

    async fn load_fresh(&self) -> Result<Option<CachedCredential>> {
        let now = Utc::now().timestamp();
        Ok(self.store.load().await?.filter(|c| c.is_fresh_at(now)))
    }

    /// The guard is held until this returns, on success and on error alike
    async fn fetch_and_store(&self, _guard: LockGuard) -> Result<String> {
        let fetched = self.fetcher.fetch().await?;
        let issued_at = Utc::now().timestamp();

        let credential = CachedCredential::new(fetched.access_token, issued_at, fetched.expires_in);
        self.store.save(&credential).await?;

        info!(
            "Successfully refreshed WeChat access token (expires in {}s)",
            credential.expires_in
        );
        Ok(credential.access_token)
    }

    async fn wait_for_lock(&self, deadline: Instant) -> Result<()> {
        loop {
            if Instant::now() >= deadline {
                warn!("Gave up waiting for the token refresh lock");
                return Err(MpError::LockTimeout(self.lock_timeout));
            }
            sleep(self.poll_interval).await;
            if !self.lock.is_held().await? {
                return Ok(());
            }
        }
    }
}
