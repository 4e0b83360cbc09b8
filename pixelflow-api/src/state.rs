use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use pixelflow_core::queue::Enqueuer;
use pixelflow_core::ratelimit::RateLimiter;
use pixelflow_core::storage::ObjectStore;
use pixelflow_core::store::JobStore;

use crate::metrics::ApiMetrics;

/// Shared per-request context. Cheap to clone; everything mutable lives
/// behind the service handles.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn Enqueuer>,
    storage: Arc<dyn ObjectStore>,
    limiter: Option<Arc<dyn RateLimiter>>,
    metrics: Arc<ApiMetrics>,
    presign_ttl: Duration,
    user_id_header: String,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn Enqueuer>,
        storage: Arc<dyn ObjectStore>,
        limiter: Option<Arc<dyn RateLimiter>>,
        metrics: Arc<ApiMetrics>,
        presign_ttl: Duration,
        user_id_header: impl Into<String>,
    ) -> Self {
        let presign_ttl = if presign_ttl.is_zero() {
            Duration::from_secs(15 * 60)
        } else {
            presign_ttl
        };

        Self {
            inner: Arc::new(Inner {
                store,
                queue,
                storage,
                limiter,
                metrics,
                presign_ttl,
                user_id_header: user_id_header.into(),
            }),
        }
    }

    pub fn store(&self) -> &dyn JobStore {
        self.inner.store.as_ref()
    }

    pub fn queue(&self) -> &dyn Enqueuer {
        self.inner.queue.as_ref()
    }

    pub fn storage(&self) -> &dyn ObjectStore {
        self.inner.storage.as_ref()
    }

    pub fn limiter(&self) -> Option<&Arc<dyn RateLimiter>> {
        self.inner.limiter.as_ref()
    }

    pub fn metrics(&self) -> &ApiMetrics {
        &self.inner.metrics
    }

    pub fn presign_ttl(&self) -> Duration {
        self.inner.presign_ttl
    }

    pub fn user_id_header(&self) -> &str {
        &self.inner.user_id_header
    }
}
