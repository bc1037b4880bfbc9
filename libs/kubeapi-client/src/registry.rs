//! Shared API client and its per-type resource client cache.
//!
//! - One [`Transport`] is shared by every resource client created from a
//!   [`KubeApiClient`]; requests run concurrently over it.
//! - Resource clients are memoized per Rust type. Key = `TypeId`, value =
//!   `Arc<C>` stored as `Arc<dyn Any + Send + Sync>` (downcast on read).
//! - Each type has its own slot lock, so first-time construction of one
//!   type never waits on another type, and a factory runs at most once per
//!   type unless it fails.
//! - Resource clients keep only a weak reference back to the registry.

use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kubeapi_transport::{ConnectionOptions, Transport};
use parking_lot::Mutex;
use tracing::debug;
use url::Url;

use crate::error::KubeClientError;
use crate::resources::{ApiResource, ResourceClient};

type Shared = Arc<dyn Any + Send + Sync>;

/// Slot for one client type. `None` until a factory succeeds.
type Slot = Arc<Mutex<Option<Shared>>>;

/// State shared between a [`KubeApiClient`] and its clones.
pub struct ApiClientInner {
    options: ConnectionOptions,
    base_url: Url,
    transport: ArcSwapOption<Transport>,
    clients: DashMap<TypeId, Slot>,
}

impl ApiClientInner {
    /// Transport for the next request, unless the client was disposed.
    pub(crate) fn transport(&self) -> Result<Arc<Transport>, KubeClientError> {
        self.transport.load_full().ok_or(KubeClientError::Disposed)
    }

    pub(crate) fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub(crate) fn default_namespace(&self) -> &str {
        &self.options.default_namespace
    }
}

/// Entry point of the API: owns the transport and the resource clients.
///
/// Cheap to clone; clones share the transport and the client cache.
///
/// # Example
///
/// ```ignore
/// let client = KubeApiClient::new(&ConnectionOptions::from_pod_service_account()?)?;
/// let pods = client.pods()?;
/// let cancel = CancellationToken::new();
/// let pod = pods.get("web-0", None, &cancel).await?;
/// ```
#[derive(Clone)]
pub struct KubeApiClient {
    inner: Arc<ApiClientInner>,
}

impl KubeApiClient {
    /// Validate `options` and build the transport from them.
    ///
    /// The options are copied; changing the caller's value afterwards has no
    /// effect on this client.
    ///
    /// # Errors
    /// Returns `KubeClientError::Configuration` if the options are invalid.
    ///
    /// # Panics
    /// Panics when called outside a Tokio runtime: the transport spawns its
    /// request worker on construction.
    pub fn new(options: &ConnectionOptions) -> Result<Self, KubeClientError> {
        let transport = Transport::from_options(options)?;
        Self::with_transport(options, transport)
    }

    /// Like [`new`](Self::new) but with a caller-supplied transport.
    ///
    /// # Errors
    /// Returns `KubeClientError::Configuration` if the options are invalid.
    pub fn with_transport(
        options: &ConnectionOptions,
        transport: Transport,
    ) -> Result<Self, KubeClientError> {
        options.validate()?;
        let base_url = options.endpoint_url()?;

        debug!(
            endpoint = %base_url,
            default_namespace = %options.default_namespace,
            "kubernetes API client created"
        );

        Ok(Self {
            inner: Arc::new(ApiClientInner {
                options: options.clone(),
                base_url,
                transport: ArcSwapOption::from_pointee(transport),
                clients: DashMap::new(),
            }),
        })
    }

    /// Copy of the options this client was built from.
    #[must_use]
    pub fn options(&self) -> ConnectionOptions {
        self.inner.options.clone()
    }

    #[must_use]
    pub fn default_namespace(&self) -> &str {
        self.inner.default_namespace()
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        self.inner.base_url()
    }

    /// Return the cached client of type `C`, creating it with `factory` on
    /// first use.
    ///
    /// Concurrent first calls for the same `C` wait for each other, so the
    /// factory runs once and every caller receives the same `Arc`. A failed
    /// factory caches nothing; the next call runs a factory again.
    ///
    /// The factory must not call `get_or_create` for its own type.
    ///
    /// # Errors
    /// Returns `KubeClientError::Disposed` after [`dispose`](Self::dispose),
    /// or whatever the factory returns.
    pub fn get_or_create<C, F>(&self, factory: F) -> Result<Arc<C>, KubeClientError>
    where
        C: Send + Sync + 'static,
        F: FnOnce(&KubeApiClient) -> Result<C, KubeClientError>,
    {
        self.inner.transport()?;

        // Clone the slot out so the map shard is not held while the factory runs.
        let slot: Slot = self
            .inner
            .clients
            .entry(TypeId::of::<C>())
            .or_default()
            .clone();
        let mut guard = slot.lock();

        if let Some(existing) = guard.as_ref() {
            return downcast::<C>(existing.clone());
        }

        let client = Arc::new(factory(self)?);

        // dispose() may have cleared the cache while the factory ran.
        if let Err(err) = self.inner.transport() {
            drop(guard);
            self.inner
                .clients
                .remove_if(&TypeId::of::<C>(), |_, current| Arc::ptr_eq(current, &slot));
            return Err(err);
        }

        *guard = Some(client.clone() as Shared);
        debug!(client = type_name::<C>(), "resource client created");
        Ok(client)
    }

    /// Generic resource client for any namespaced, listable kind.
    ///
    /// # Errors
    /// Returns `KubeClientError::Disposed` after disposal, or a template
    /// error if `K` has an unusable API version.
    pub fn resources<K: ApiResource>(&self) -> Result<Arc<ResourceClient<K>>, KubeClientError> {
        self.get_or_create(ResourceClient::<K>::new)
    }

    /// # Errors
    /// See [`resources`](Self::resources).
    pub fn pods(&self) -> Result<Arc<ResourceClient<Pod>>, KubeClientError> {
        self.resources()
    }

    /// # Errors
    /// See [`resources`](Self::resources).
    pub fn replica_sets(&self) -> Result<Arc<ResourceClient<ReplicaSet>>, KubeClientError> {
        self.resources()
    }

    /// # Errors
    /// See [`resources`](Self::resources).
    pub fn deployments(&self) -> Result<Arc<ResourceClient<Deployment>>, KubeClientError> {
        self.resources()
    }

    /// # Errors
    /// See [`resources`](Self::resources).
    pub fn services(&self) -> Result<Arc<ResourceClient<Service>>, KubeClientError> {
        self.resources()
    }

    /// # Errors
    /// See [`resources`](Self::resources).
    pub fn config_maps(&self) -> Result<Arc<ResourceClient<ConfigMap>>, KubeClientError> {
        self.resources()
    }

    /// Release the transport and drop all cached resource clients.
    ///
    /// Calls on resource clients obtained earlier fail with
    /// `KubeClientError::Disposed` from now on. Idempotent.
    pub fn dispose(&self) {
        if self.inner.transport.swap(None).is_some() {
            self.inner.clients.clear();
            debug!(endpoint = %self.inner.base_url, "kubernetes API client disposed");
        }
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.transport.load().is_none()
    }

    pub(crate) fn downgrade(&self) -> Weak<ApiClientInner> {
        Arc::downgrade(&self.inner)
    }
}

impl fmt::Debug for KubeApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeApiClient")
            .field("endpoint", &self.inner.base_url.as_str())
            .field("default_namespace", &self.inner.options.default_namespace)
            .field("clients", &self.inner.clients.len())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

fn downcast<C: Send + Sync + 'static>(shared: Shared) -> Result<Arc<C>, KubeClientError> {
    shared
        .downcast::<C>()
        .map_err(|_| KubeClientError::ClientCacheMismatch(type_name::<C>()))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn options() -> ConnectionOptions {
        ConnectionOptions::for_endpoint("http://127.0.0.1:1")
    }

    #[derive(Debug)]
    struct Counted(usize);

    #[tokio::test]
    async fn factory_runs_once_under_concurrent_first_access() {
        let client = KubeApiClient::new(&options()).unwrap();
        let runs = AtomicUsize::new(0);
        let barrier = Barrier::new(8);

        let results: Vec<Arc<Counted>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        client
                            .get_or_create(|_| {
                                let n = runs.fetch_add(1, Ordering::SeqCst);
                                std::thread::sleep(Duration::from_millis(20));
                                Ok(Counted(n))
                            })
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        for result in &results {
            assert!(Arc::ptr_eq(result, &results[0]));
            assert_eq!(result.0, 0);
        }
    }

    #[tokio::test]
    async fn failed_factory_is_not_cached() {
        let client = KubeApiClient::new(&options()).unwrap();

        let err = client
            .get_or_create::<Counted, _>(|_| Err(KubeClientError::Protocol("boom".to_owned())))
            .unwrap_err();
        assert!(matches!(err, KubeClientError::Protocol(_)));

        let created = client.get_or_create(|_| Ok(Counted(7))).unwrap();
        assert_eq!(created.0, 7);
    }

    #[tokio::test]
    async fn dispose_during_factory_caches_nothing() {
        let client = KubeApiClient::new(&options()).unwrap();

        let err = client
            .get_or_create(|registry| {
                registry.dispose();
                Ok(Counted(1))
            })
            .unwrap_err();

        assert!(matches!(err, KubeClientError::Disposed));
        assert!(client.inner.clients.is_empty());
    }

    #[tokio::test]
    async fn mistyped_cache_entry_is_reported() {
        let client = KubeApiClient::new(&options()).unwrap();
        let wrong: Shared = Arc::new(String::from("not a client"));
        client
            .inner
            .clients
            .insert(TypeId::of::<Counted>(), Arc::new(Mutex::new(Some(wrong))));

        let err = client.get_or_create(|_| Ok(Counted(1))).unwrap_err();
        assert!(matches!(
            err,
            KubeClientError::ClientCacheMismatch(name) if name.ends_with("Counted")
        ));
    }

    #[test]
    #[should_panic(expected = "Tokio 1.x runtime")]
    fn construction_outside_runtime_panics() {
        drop(KubeApiClient::new(&options()));
    }

    #[tokio::test]
    async fn different_types_get_different_clients() {
        let client = KubeApiClient::new(&options()).unwrap();
        let pods = client.pods().unwrap();
        let pods_again = client.resources::<Pod>().unwrap();
        let config_maps = client.config_maps().unwrap();

        assert!(Arc::ptr_eq(&pods, &pods_again));
        assert_eq!(config_maps.kind(), "ConfigMap");
    }

    #[tokio::test]
    async fn options_are_returned_as_copies() {
        let mut original = options();
        let client = KubeApiClient::new(&original).unwrap();

        original.default_namespace = "changed".to_owned();
        let mut copy = client.options();
        copy.default_namespace = "also-changed".to_owned();

        assert_eq!(client.default_namespace(), "default");
        assert_eq!(client.options().default_namespace, "default");
    }

    #[tokio::test]
    async fn invalid_options_fail_before_any_io() {
        let mut bad = options();
        bad.default_namespace = "  ".to_owned();
        assert!(matches!(
            KubeApiClient::new(&bad),
            Err(KubeClientError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn dispose_rejects_further_use() {
        let client = KubeApiClient::new(&options()).unwrap();
        let clone = client.clone();
        client.pods().unwrap();

        clone.dispose();
        clone.dispose();

        assert!(client.is_disposed());
        assert!(matches!(client.pods(), Err(KubeClientError::Disposed)));
        assert!(format!("{client:?}").contains("disposed: true"));
    }
}
