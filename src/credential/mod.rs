//! Access token management
//!
//! - Token storage with expiry tracking (file or in-memory)
//! - Cooperative refresh lock so concurrent processes fetch at most once
//! - Token issuance via `cgi-bin/token`

mod coordinator;
mod fetcher;
mod store;

pub use coordinator::TokenManager;
pub use fetcher::{
    CredentialFetcher, DEFAULT_TOKEN_LIFETIME_SECS, FetchedCredential, HttpCredentialFetcher,
};
pub use store::{
    CachedCredential, CredentialStore, FileCredentialStore, FileLock, LockGuard,
    MemoryCredentialStore, MemoryLock, RefreshLock,
};
