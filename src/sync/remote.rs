//! Remote catalog sources
//!
//! The remote catalog is an opaque paginated data source. `RemoteSource` is
//! the seam: the engine only ever asks for a page or for everything.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::error::{Result, SyncError};
use crate::types::RemoteItem;

/// A paginated remote collection of items
#[async_trait]
pub trait RemoteSource<T = RemoteItem>: Send + Sync
where
    T: Send + 'static,
{
    /// Fetch one page (1-based) of `resource`
    async fn fetch_page(&self, resource: &str, page: u32, page_size: u32) -> Result<Vec<T>>;

    /// Fetch a whole collection in one request
    async fn fetch_all(&self, resource: &str) -> Result<Vec<T>>;
}

fn page_slice<T: Clone>(items: &[T], page: u32, page_size: u32) -> Vec<T> {
    let size = page_size.max(1) as usize;
    let start = (page.max(1) as usize - 1).saturating_mul(size);
    items.iter().skip(start).take(size).cloned().collect()
}

/// Failure a `MemoryRemote` is told to produce
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFailure {
    Network(String),
    Data(String),
    /// Network failure only from this page on
    NetworkFromPage(u32),
}

/// In-process remote catalog, used by tests and demos
#[derive(Default)]
pub struct MemoryRemote {
    collections: RwLock<HashMap<String, Vec<RemoteItem>>>,
    failure: Mutex<Option<InjectedFailure>>,
    latency: Mutex<Duration>,
    requests: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents of a collection
    pub fn set_collection(&self, resource: &str, items: Vec<RemoteItem>) {
        self.collections.write().insert(resource.to_string(), items);
    }

    pub fn fail_with(&self, failure: InjectedFailure) {
        *self.failure.lock() = Some(failure);
    }

    pub fn clear_failure(&self) {
        *self.failure.lock() = None;
    }

    /// Delay every request, to make overlapping syncs observable
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Number of fetch calls served so far
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    async fn before_request(&self, page: Option<u32>) -> Result<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let failure = self.failure.lock().clone();
        match failure {
            Some(InjectedFailure::Network(message)) => Err(SyncError::Network(message)),
            Some(InjectedFailure::Data(message)) => Err(SyncError::Data(message)),
            Some(InjectedFailure::NetworkFromPage(from)) if page.unwrap_or(1) >= from => Err(
                SyncError::Network(format!("connection reset while fetching page {}", page.unwrap_or(1))),
            ),
            _ => Ok(()),
        }
    }

    fn collection(&self, resource: &str) -> Vec<RemoteItem> {
        self.collections
            .read()
            .get(resource)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteSource for MemoryRemote {
    async fn fetch_page(&self, resource: &str, page: u32, page_size: u32) -> Result<Vec<RemoteItem>> {
        self.before_request(Some(page)).await?;
        Ok(page_slice(&self.collection(resource), page, page_size))
    }

    async fn fetch_all(&self, resource: &str) -> Result<Vec<RemoteItem>> {
        self.before_request(None).await?;
        Ok(self.collection(resource))
    }
}

/// Remote catalog exported as `<dir>/<resource>.json` arrays
///
/// An unreachable directory (unmounted share, missing export) is reported as
/// a network failure so the local mirror is served instead.
pub struct JsonDirRemote {
    dir: PathBuf,
}

impl JsonDirRemote {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn load(&self, resource: &str) -> Result<Vec<RemoteItem>> {
        if !tokio::fs::try_exists(&self.dir).await.unwrap_or(false) {
            return Err(SyncError::Network(format!(
                "remote directory unreachable: {}",
                self.dir.display()
            )));
        }

        let path = self.dir.join(format!("{}.json", resource));
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            SyncError::Data(format!("cannot read {}: {}", path.display(), e))
        })?;
        let items: Vec<RemoteItem> = serde_json::from_str(&content)?;
        Ok(items)
    }
}

#[async_trait]
impl RemoteSource for JsonDirRemote {
    async fn fetch_page(&self, resource: &str, page: u32, page_size: u32) -> Result<Vec<RemoteItem>> {
        let items = self.load(resource).await?;
        Ok(page_slice(&items, page, page_size))
    }

    async fn fetch_all(&self, resource: &str) -> Result<Vec<RemoteItem>> {
        self.load(resource).await
    }
}

/// Remote catalog served over HTTP as JSON arrays
///
/// `GET {base_url}/{resource}?page=N&per_page=M`; connection failures and
/// timeouts surface as network errors.
#[cfg(feature = "http")]
pub struct HttpRemote {
    base_url: String,
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpRemote {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn get(&self, resource: &str, query: &[(&str, u32)]) -> Result<Vec<RemoteItem>> {
        let url = format!("{}/{}", self.base_url, resource);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(map_http_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Data(format!("GET {} returned HTTP {}", url, status)));
        }

        response.json::<Vec<RemoteItem>>().await.map_err(map_http_error)
    }
}

#[cfg(feature = "http")]
fn map_http_error(err: reqwest::Error) -> SyncError {
    if err.is_connect() || err.is_timeout() {
        SyncError::Network(err.to_string())
    } else if err.is_decode() {
        SyncError::Data(format!("malformed remote payload: {}", err))
    } else {
        SyncError::Http(err)
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl RemoteSource for HttpRemote {
    async fn fetch_page(&self, resource: &str, page: u32, page_size: u32) -> Result<Vec<RemoteItem>> {
        self.get(resource, &[("page", page), ("per_page", page_size)]).await
    }

    async fn fetch_all(&self, resource: &str) -> Result<Vec<RemoteItem>> {
        self.get(resource, &[]).await
    }
}
