//! Offline fallback for unreachable remotes
//!
//! When the remote catalog cannot be reached, the caller gets the current
//! contents of the local mirror, flagged as degraded, instead of an error.
//! Nothing is deleted in that case.

use std::future::Future;

use crate::error::{ErrorKind, Result, SyncError};
use crate::types::SyncConfig;

/// Message fragments that mark an error as a network failure
pub const DEFAULT_NETWORK_KEYWORDS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "unreachable",
    "connection",
    "offline",
    "dns",
    "getaddrinfo",
    "econnrefused",
    "econnreset",
    "enotfound",
    "socket hang up",
];

/// Result of a guarded operation
#[derive(Debug)]
pub enum Guarded<T> {
    /// The operation completed
    Fresh(T),
    /// The remote was unreachable; `value` came from the fallback
    Degraded { value: T, cause: SyncError },
}

impl<T> Guarded<T> {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Guarded::Degraded { .. })
    }

    pub fn into_value(self) -> T {
        match self {
            Guarded::Fresh(value) | Guarded::Degraded { value, .. } => value,
        }
    }
}

/// Decides which failures are network failures and substitutes the local
/// mirror for them
#[derive(Debug, Clone)]
pub struct NetworkFallbackPolicy {
    keywords: Vec<String>,
}

impl Default for NetworkFallbackPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_NETWORK_KEYWORDS.iter().map(|k| k.to_string()))
    }
}

impl NetworkFallbackPolicy {
    pub fn new(keywords: impl IntoIterator<Item = String>) -> Self {
        Self {
            keywords: keywords.into_iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        match &config.network_keywords {
            Some(keywords) => Self::new(keywords.iter().cloned()),
            None => Self::default(),
        }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// Whether `err` means the remote could not be reached
    pub fn classify(&self, err: &SyncError) -> bool {
        if err.kind() == ErrorKind::Network {
            return true;
        }
        if err.is_store_error() {
            return false;
        }

        let message = err.to_string().to_lowercase();
        self.keywords.iter().any(|k| message.contains(k.as_str()))
    }

    /// Await `work`; on a network failure return `fallback()` as degraded.
    ///
    /// Any other failure is returned unchanged.
    pub async fn guard<T, Fut, F>(&self, work: Fut, fallback: F) -> Result<Guarded<T>>
    where
        Fut: Future<Output = Result<T>>,
        F: FnOnce() -> Result<T>,
    {
        match work.await {
            Ok(value) => Ok(Guarded::Fresh(value)),
            Err(err) if self.classify(&err) => {
                tracing::warn!(error = %err, "Remote unreachable, serving local mirror");
                let value = fallback()?;
                Ok(Guarded::Degraded { value, cause: err })
            }
            Err(err) => Err(err),
        }
    }
}
