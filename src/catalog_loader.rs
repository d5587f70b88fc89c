use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::algorithms::AlgorithmLibrary;
use crate::errors::CatalogLoadError;
use crate::host::LibraryProvider;

pub const CATALOG_LOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Loads the algorithm library at most once at a time and caches the first
/// success. Concurrent callers share the in-flight load; a failed or timed-out
/// load leaves the cache empty so the next activation retries.
pub struct CatalogLoader {
    provider: Arc<dyn LibraryProvider>,
    timeout: Duration,
    library: OnceCell<AlgorithmLibrary>,
}

impl CatalogLoader {
    pub fn new(provider: Arc<dyn LibraryProvider>) -> Self {
        Self::with_timeout(provider, CATALOG_LOAD_TIMEOUT)
    }

    pub fn with_timeout(provider: Arc<dyn LibraryProvider>, timeout: Duration) -> Self {
        Self {
            provider,
            timeout,
            library: OnceCell::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.library.initialized()
    }

    pub async fn load(&self) -> Result<AlgorithmLibrary, CatalogLoadError> {
        let library = self
            .library
            .get_or_try_init(|| async {
                match tokio::time::timeout(self.timeout, self.provider.load_library()).await {
                    Ok(Ok(library)) => {
                        info!(version = library.version(), "algorithm library loaded");
                        Ok(library)
                    }
                    Ok(Err(error)) => {
                        warn!(error = %format!("{error:#}"), "algorithm library failed to load");
                        Err(CatalogLoadError::Provider(format!("{error:#}")))
                    }
                    Err(_) => {
                        warn!(timeout = ?self.timeout, "algorithm library load timed out");
                        Err(CatalogLoadError::Timeout(self.timeout))
                    }
                }
            })
            .await?;
        Ok(library.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::{bail, Result};
    use async_trait::async_trait;

    use super::*;

    struct FlakyProvider {
        calls: AtomicUsize,
        failures: usize,
        delay: Duration,
    }

    #[async_trait]
    impl LibraryProvider for FlakyProvider {
        async fn load_library(&self) -> Result<AlgorithmLibrary> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if call < self.failures {
                bail!("injection refused");
            }
            Ok(AlgorithmLibrary::builtin())
        }
    }

    fn provider(failures: usize, delay: Duration) -> Arc<FlakyProvider> {
        Arc::new(FlakyProvider {
            calls: AtomicUsize::new(0),
            failures,
            delay,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_loads_share_one_request() {
        let provider = provider(0, Duration::from_millis(100));
        let loader = CatalogLoader::new(provider.clone());
        let (first, second) = tokio::join!(loader.load(), loader.load());
        assert!(first.is_ok() && second.is_ok());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        loader.load().await.expect("cached");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_clears_cache_for_retry() {
        let provider = provider(1, Duration::ZERO);
        let loader = CatalogLoader::new(provider.clone());
        let error = loader.load().await.expect_err("first load fails");
        assert!(matches!(error, CatalogLoadError::Provider(_)));
        assert!(!loader.is_loaded());
        loader.load().await.expect("retry succeeds");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out() {
        let provider = provider(0, Duration::from_secs(30));
        let loader = CatalogLoader::new(provider);
        let error = loader.load().await.expect_err("timeout");
        assert_eq!(error, CatalogLoadError::Timeout(CATALOG_LOAD_TIMEOUT));
    }
}
