//! Layer composition

use async_trait::async_trait;
use tracing::warn;

use super::{Cache, CacheError};
use crate::error::join_errors;
use crate::pki::CertBundle;

/// Composes caches in order.
///
/// `get` consults every layer and returns the freshest certificate any of
/// them produced; layer failures are only fatal when no layer produced
/// anything. `put` writes through to every layer.
pub struct LayeredCache {
    layers: Vec<Box<dyn Cache>>,
}

impl LayeredCache {
    pub fn new(layers: Vec<Box<dyn Cache>>) -> Self {
        Self { layers }
    }
}

#[async_trait]
impl Cache for LayeredCache {
    async fn get(&self) -> Result<Option<CertBundle>, CacheError> {
        let mut bundles = Vec::new();
        let mut errors = Vec::new();
        for layer in &self.layers {
            match layer.get().await {
                Ok(Some(bundle)) => bundles.push(bundle),
                Ok(None) => {}
                Err(e) => errors.push(e),
            }
        }

        if bundles.is_empty() {
            if errors.is_empty() {
                return Ok(None);
            }
            return Err(CacheError::AllLayers(join_errors(&errors)));
        }
        if !errors.is_empty() {
            warn!(error = %join_errors(&errors), "cache fetch non-fatal error");
        }
        Ok(CertBundle::latest(bundles))
    }

    async fn put(&self, bundle: &CertBundle) -> Result<(), CacheError> {
        let mut errors = Vec::new();
        for layer in &self.layers {
            if let Err(e) = layer.put(bundle).await {
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CacheError::AllLayers(join_errors(&errors)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::testutil;

    #[derive(Default)]
    struct StubCache {
        bundle: Option<CertBundle>,
        fail_get: bool,
        fail_put: bool,
        puts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Cache for StubCache {
        async fn get(&self) -> Result<Option<CertBundle>, CacheError> {
            if self.fail_get {
                return Err(CacheError::Fanout("stub get failure".into()));
            }
            Ok(self.bundle.clone())
        }

        async fn put(&self, _bundle: &CertBundle) -> Result<(), CacheError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            if self.fail_put {
                return Err(CacheError::Fanout("stub put failure".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn get_returns_freshest_across_layers() {
        let older = testutil::bundle_expiring_in_days(20);
        let newer = testutil::bundle_expiring_in_days(70);
        let expect = newer.not_after();
        let cache = LayeredCache::new(vec![
            Box::new(StubCache {
                bundle: Some(older),
                ..Default::default()
            }),
            Box::new(StubCache {
                bundle: Some(newer),
                ..Default::default()
            }),
        ]);

        let got = cache.get().await.unwrap().unwrap();
        assert_eq!(got.not_after(), expect);
    }

    #[tokio::test]
    async fn get_tolerates_failing_layer_when_another_yields() {
        let bundle = testutil::bundle_expiring_in_days(70);
        let expect = bundle.not_after();
        let cache = LayeredCache::new(vec![
            Box::new(StubCache {
                fail_get: true,
                ..Default::default()
            }),
            Box::new(StubCache {
                bundle: Some(bundle),
                ..Default::default()
            }),
        ]);

        let got = cache.get().await.unwrap().unwrap();
        assert_eq!(got.not_after(), expect);
    }

    #[tokio::test]
    async fn get_fails_when_all_layers_fail() {
        let cache = LayeredCache::new(vec![
            Box::new(StubCache {
                fail_get: true,
                ..Default::default()
            }),
            Box::new(StubCache {
                fail_get: true,
                ..Default::default()
            }),
        ]);
        assert!(matches!(
            cache.get().await.unwrap_err(),
            CacheError::AllLayers(_)
        ));
    }

    #[tokio::test]
    async fn empty_layers_are_a_miss_not_an_error() {
        let cache = LayeredCache::new(vec![
            Box::new(StubCache::default()),
            Box::new(StubCache::default()),
        ]);
        assert!(cache.get().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_fans_out_to_every_layer_despite_failures() {
        let first_puts = Arc::new(AtomicUsize::new(0));
        let second_puts = Arc::new(AtomicUsize::new(0));
        let cache = LayeredCache::new(vec![
            Box::new(StubCache {
                fail_put: true,
                puts: first_puts.clone(),
                ..Default::default()
            }),
            Box::new(StubCache {
                puts: second_puts.clone(),
                ..Default::default()
            }),
        ]);

        let result = cache.put(&testutil::bundle_expiring_in_days(60)).await;
        assert!(result.is_err());
        assert_eq!(first_puts.load(Ordering::SeqCst), 1);
        assert_eq!(second_puts.load(Ordering::SeqCst), 1);
    }
}
