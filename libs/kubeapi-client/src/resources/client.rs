use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{Method, StatusCode};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Status};
use k8s_openapi::{List, ListableResource, Metadata, NamespaceResourceScope, Resource};
use kubeapi_transport::{ByteStream, RequestBuilder, Transport, TransportResponse};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::params::{DeleteOutcome, DeleteParams, ListParams, Patch, PropagationPolicy};
use crate::error::{KubeClientError, TemplateError};
use crate::registry::{ApiClientInner, KubeApiClient};
use crate::template::{RequestTemplate, TemplateParams, params};
use crate::watch::WatchStream;

/// Namespaced, listable Kubernetes kind that a [`ResourceClient`] can serve.
///
/// Implemented for every `k8s-openapi` type with namespace scope.
pub trait ApiResource:
    Resource<Scope = NamespaceResourceScope>
    + ListableResource
    + Metadata<Ty = ObjectMeta>
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> ApiResource for K where
    K: Resource<Scope = NamespaceResourceScope>
        + ListableResource
        + Metadata<Ty = ObjectMeta>
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// The two URL templates a resource client works with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceTemplates {
    /// Collection endpoint used by list, create and watch.
    pub collection: RequestTemplate,
    /// Single object endpoint used by get, update and delete.
    pub by_name: RequestTemplate,
}

impl ResourceTemplates {
    /// Standard templates for `K`: `api/v1/...` for the core group,
    /// `apis/<group>/<version>/...` otherwise.
    ///
    /// # Errors
    /// Returns `TemplateError::Malformed` if the kind's group, version or
    /// plural name cannot form a path.
    pub fn for_resource<K: Resource>() -> Result<Self, TemplateError> {
        let prefix = if K::GROUP.is_empty() {
            format!("api/{}", K::VERSION)
        } else {
            format!("apis/{}/{}", K::GROUP, K::VERSION)
        };
        let plural = K::URL_PATH_SEGMENT;

        Ok(Self {
            collection: RequestTemplate::parse(&format!(
                "{prefix}/namespaces/{{Namespace}}/{plural}\
                 ?labelSelector={{LabelSelector?}}\
                 &fieldSelector={{FieldSelector?}}\
                 &resourceVersion={{ResourceVersion?}}\
                 &watch={{Watch?}}"
            ))?,
            by_name: RequestTemplate::parse(&format!(
                "{prefix}/namespaces/{{Namespace}}/{plural}/{{Name}}"
            ))?,
        })
    }
}

/// Typed client for one kind: get, list, create, update, delete and watch.
///
/// Obtained from [`KubeApiClient`], usually through
/// [`KubeApiClient::resources`] or one of its typed shortcuts. Holds only a
/// weak reference to the API client; once that is dropped or disposed every
/// call fails with [`KubeClientError::Disposed`].
///
/// Every call takes a cancellation token. Cancelling it abandons the
/// request and returns [`KubeClientError::Cancelled`].
pub struct ResourceClient<K> {
    api: Weak<ApiClientInner>,
    templates: ResourceTemplates,
    _kind: PhantomData<fn() -> K>,
}

impl<K: ApiResource> ResourceClient<K> {
    /// Client using the standard templates for `K`.
    ///
    /// # Errors
    /// Returns `KubeClientError::Template` if the templates cannot be built.
    pub fn new(client: &KubeApiClient) -> Result<Self, KubeClientError> {
        Ok(Self::with_templates(client, ResourceTemplates::for_resource::<K>()?))
    }

    /// Client using custom templates, e.g. for an aggregated API behind a
    /// path prefix.
    #[must_use]
    pub fn with_templates(client: &KubeApiClient, templates: ResourceTemplates) -> Self {
        Self {
            api: client.downgrade(),
            templates,
            _kind: PhantomData,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        K::KIND
    }

    #[must_use]
    pub fn templates(&self) -> &ResourceTemplates {
        &self.templates
    }

    /// Fetch `name`. A missing object is `Ok(None)`.
    ///
    /// `namespace` defaults to the client's default namespace.
    ///
    /// # Errors
    /// `RequestFailed` for non-2xx statuses other than 404, `Connection` for
    /// network failures, `Decode` for an unexpected body, `Disposed` or
    /// `Cancelled`.
    pub async fn get(
        &self,
        name: &str,
        namespace: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Option<K>, KubeClientError> {
        let (api, transport) = self.context()?;
        let url = self.item_url(&api, namespace, name)?;

        cancellable(cancel, async move {
            let response = transport.request(Method::GET, &url).send().await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            decode(&success_body(response).await?).map(Some)
        })
        .await
    }

    /// List objects in a namespace.
    ///
    /// # Errors
    /// Same as [`get`](Self::get), except that 404 is a `RequestFailed`.
    pub async fn list(
        &self,
        params: &ListParams,
        namespace: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<List<K>, KubeClientError> {
        let (api, transport) = self.context()?;
        let url = self.collection_url(&api, namespace, params, false)?;

        cancellable(cancel, async move {
            let response = transport.request(Method::GET, &url).send().await?;
            decode(&success_body(response).await?)
        })
        .await
    }

    /// Create `resource` in its own namespace, or the default namespace if
    /// it has none. Returns the object as stored by the server.
    ///
    /// # Errors
    /// `RequestFailed` carrying the server's `Status` (for example
    /// `AlreadyExists`), plus the errors of [`get`](Self::get).
    pub async fn create(
        &self,
        resource: &K,
        cancel: &CancellationToken,
    ) -> Result<K, KubeClientError> {
        let (api, transport) = self.context()?;
        let namespace = resource.metadata().namespace.as_deref();
        let url = self.collection_url(&api, namespace, &ListParams::default(), false)?;

        cancellable(cancel, async move {
            let response = transport
                .request(Method::POST, &url)
                .json(resource)
                .send()
                .await?;
            decode(&success_body(response).await?)
        })
        .await
    }

    /// Apply `patch` to `name` with `PATCH`.
    ///
    /// # Errors
    /// Same as [`create`](Self::create).
    pub async fn update<P: Serialize + Sync>(
        &self,
        name: &str,
        patch: &Patch<P>,
        namespace: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<K, KubeClientError> {
        let (api, transport) = self.context()?;
        let url = self.item_url(&api, namespace, name)?;

        cancellable(cancel, async move {
            let response = transport
                .request(Method::PATCH, &url)
                .header(CONTENT_TYPE, patch.content_type())
                .json(patch.document())
                .send()
                .await?;
            decode(&success_body(response).await?)
        })
        .await
    }

    /// Delete `name` with the given propagation policy.
    ///
    /// # Errors
    /// See [`delete_with`](Self::delete_with).
    pub async fn delete(
        &self,
        name: &str,
        namespace: Option<&str>,
        policy: PropagationPolicy,
        cancel: &CancellationToken,
    ) -> Result<DeleteOutcome<K>, KubeClientError> {
        self.delete_with(name, namespace, &DeleteParams::from(policy), cancel)
            .await
    }

    /// Delete `name`.
    ///
    /// A 404 is not an error: it yields a `Success` status with code 404.
    /// With [`PropagationPolicy::Foreground`] the body is always decoded as
    /// `K`; otherwise its `kind` decides between `K` and `Status`.
    ///
    /// # Errors
    /// Same as [`get`](Self::get).
    pub async fn delete_with(
        &self,
        name: &str,
        namespace: Option<&str>,
        delete: &DeleteParams,
        cancel: &CancellationToken,
    ) -> Result<DeleteOutcome<K>, KubeClientError> {
        let (api, transport) = self.context()?;
        let url = self.item_url(&api, namespace, name)?;

        cancellable(cancel, async move {
            let response = transport
                .request(Method::DELETE, &url)
                .json(delete)
                .send()
                .await?;
            if response.status() == StatusCode::NOT_FOUND {
                debug!(kind = K::KIND, name, "delete target already gone");
                return Ok(DeleteOutcome::Status(already_deleted::<K>(name)));
            }
            let body = success_body(response).await?;
            match delete.propagation_policy {
                PropagationPolicy::Foreground => decode(&body).map(DeleteOutcome::Resource),
                PropagationPolicy::Background | PropagationPolicy::Orphan => {
                    decode_delete_body::<K>(&body)
                }
            }
        })
        .await
    }

    /// Open a watch on a namespace.
    ///
    /// The URL is checked now; the request itself is sent when the returned
    /// stream is first polled. Pass `params.resource_version` from a
    /// previous list to continue from it.
    ///
    /// A stream first polled after the API client was disposed yields
    /// `Disposed` and ends as failed without sending anything.
    ///
    /// # Errors
    /// `Disposed` or `Template`. Request and stream failures are reported
    /// through the stream.
    pub fn watch(
        &self,
        params: &ListParams,
        namespace: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<WatchStream<K>, KubeClientError> {
        let (api, transport) = self.context()?;
        let url = self.collection_url(&api, namespace, params, true)?;
        let max_line = transport.max_body_size();

        let registry = self.api.clone();
        let connect = async move {
            let transport = registry
                .upgrade()
                .ok_or(KubeClientError::Disposed)?
                .transport()?;
            open_watch(transport.request(Method::GET, &url)).await
        };

        Ok(WatchStream::from_connect(connect, cancel, max_line))
    }

    fn context(&self) -> Result<(Arc<ApiClientInner>, Arc<Transport>), KubeClientError> {
        let api = self.api.upgrade().ok_or(KubeClientError::Disposed)?;
        let transport = api.transport()?;
        Ok((api, transport))
    }

    fn namespace<'a>(
        &self,
        api: &'a ApiClientInner,
        namespace: Option<&'a str>,
    ) -> Result<&'a str, KubeClientError> {
        let namespace = namespace.unwrap_or(api.default_namespace());
        if namespace.trim().is_empty() {
            return Err(TemplateError::MissingParameter {
                template: self.templates.collection.to_string(),
                name: params::NAMESPACE.to_owned(),
            }
            .into());
        }
        Ok(namespace)
    }

    fn collection_url(
        &self,
        api: &ApiClientInner,
        namespace: Option<&str>,
        list: &ListParams,
        watch: bool,
    ) -> Result<Url, KubeClientError> {
        let values = TemplateParams::new()
            .set(params::NAMESPACE, self.namespace(api, namespace)?)
            .set_opt(params::LABEL_SELECTOR, list.label_selector.as_deref())
            .set_opt(params::FIELD_SELECTOR, list.field_selector.as_deref())
            .set_opt(params::RESOURCE_VERSION, list.resource_version.as_deref())
            .set_opt(params::WATCH, watch.then_some("true"));
        Ok(self.templates.collection.expand(api.base_url(), &values)?)
    }

    fn item_url(
        &self,
        api: &ApiClientInner,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Url, KubeClientError> {
        if name.is_empty() {
            return Err(TemplateError::MissingParameter {
                template: self.templates.by_name.to_string(),
                name: params::NAME.to_owned(),
            }
            .into());
        }
        let values = TemplateParams::new()
            .set(params::NAMESPACE, self.namespace(api, namespace)?)
            .set(params::NAME, name);
        Ok(self.templates.by_name.expand(api.base_url(), &values)?)
    }
}

impl<K: Resource> fmt::Debug for ResourceClient<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceClient")
            .field("kind", &K::KIND)
            .field("collection", &self.templates.collection.as_str())
            .finish_non_exhaustive()
    }
}

/// Run `request` unless `cancel` fires first.
async fn cancellable<T>(
    cancel: &CancellationToken,
    request: impl Future<Output = Result<T, KubeClientError>>,
) -> Result<T, KubeClientError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(KubeClientError::Cancelled),
        result = request => result,
    }
}

async fn open_watch(request: RequestBuilder) -> Result<ByteStream, KubeClientError> {
    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(request_failed(response).await);
    }
    if !is_json(response.content_type()) {
        return Err(KubeClientError::Protocol(format!(
            "watch response has content type '{}', expected JSON",
            response.content_type().unwrap_or("<none>")
        )));
    }
    debug!("watch connected");
    Ok(response.into_byte_stream())
}

/// `application/json`, optionally with parameters such as `;stream=watch`.
fn is_json(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|ct| ct.split(';').next())
        .is_some_and(|media| {
            let media = media.trim();
            media.eq_ignore_ascii_case("application/json") || media.ends_with("+json")
        })
}

/// Body of a 2xx response, or `RequestFailed` for any other status.
async fn success_body(response: TransportResponse) -> Result<Bytes, KubeClientError> {
    if response.status().is_success() {
        Ok(response.bytes().await?)
    } else {
        Err(request_failed(response).await)
    }
}

async fn request_failed(response: TransportResponse) -> KubeClientError {
    let status = response.status();
    match response.error_preview().await {
        Ok(body) => {
            let api_status = serde_json::from_str::<Status>(&body).ok().map(Box::new);
            KubeClientError::RequestFailed {
                status,
                body,
                api_status,
            }
        }
        Err(e) => KubeClientError::Connection(e),
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, KubeClientError> {
    serde_json::from_slice(body).map_err(KubeClientError::Decode)
}

#[derive(Deserialize)]
struct KindProbe {
    kind: Option<String>,
}

fn decode_delete_body<K: ApiResource>(body: &[u8]) -> Result<DeleteOutcome<K>, KubeClientError> {
    let probe: KindProbe = decode(body)?;
    if probe.kind.as_deref() == Some(K::KIND) {
        decode(body).map(DeleteOutcome::Resource)
    } else {
        decode(body).map(DeleteOutcome::Status)
    }
}

fn already_deleted<K: Resource>(name: &str) -> Status {
    Status {
        status: Some("Success".to_owned()),
        code: Some(404),
        reason: Some("NotFound".to_owned()),
        message: Some(format!("{} \"{name}\" already deleted", K::KIND)),
        ..Status::default()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::Pod;
    use kubeapi_transport::ConnectionOptions;

    #[test]
    fn core_group_templates() {
        let templates = ResourceTemplates::for_resource::<Pod>().unwrap();
        assert_eq!(
            templates.collection.as_str(),
            "api/v1/namespaces/{Namespace}/pods?labelSelector={LabelSelector?}\
             &fieldSelector={FieldSelector?}&resourceVersion={ResourceVersion?}&watch={Watch?}"
        );
        assert_eq!(
            templates.by_name.as_str(),
            "api/v1/namespaces/{Namespace}/pods/{Name}"
        );
    }

    #[test]
    fn named_group_templates() {
        let templates = ResourceTemplates::for_resource::<Deployment>().unwrap();
        assert!(
            templates
                .by_name
                .as_str()
                .starts_with("apis/apps/v1/namespaces/{Namespace}/deployments/")
        );
    }

    #[test]
    fn json_content_types() {
        assert!(is_json(Some("application/json")));
        assert!(is_json(Some("application/json;stream=watch")));
        assert!(is_json(Some("Application/JSON; charset=utf-8")));
        assert!(!is_json(Some("text/plain")));
        assert!(!is_json(None));
    }

    #[test]
    fn delete_body_kind_selects_outcome() {
        let status = decode_delete_body::<Pod>(
            br#"{"apiVersion":"v1","kind":"Status","status":"Success","details":{"name":"web-0","kind":"pods"}}"#,
        )
        .unwrap();
        assert_eq!(
            status.status().and_then(|s| s.status.as_deref()),
            Some("Success")
        );

        let pod = decode_delete_body::<Pod>(
            br#"{"apiVersion":"v1","kind":"Pod","metadata":{"name":"web-0","deletionTimestamp":"2026-01-01T00:00:00Z"}}"#,
        )
        .unwrap();
        assert!(pod.resource().unwrap().metadata.deletion_timestamp.is_some());
    }

    #[test]
    fn synthetic_status_for_missing_object() {
        let status = already_deleted::<Pod>("web-0");
        assert_eq!(status.code, Some(404));
        assert_eq!(status.status.as_deref(), Some("Success"));
        assert_eq!(status.message.as_deref(), Some("Pod \"web-0\" already deleted"));
    }

    #[tokio::test]
    async fn blank_name_and_namespace_are_rejected_before_io() {
        let client = KubeApiClient::new(&ConnectionOptions::for_endpoint("http://127.0.0.1:1")).unwrap();
        let pods = client.pods().unwrap();
        let cancel = CancellationToken::new();

        assert!(matches!(
            pods.get("", None, &cancel).await,
            Err(KubeClientError::Template(TemplateError::MissingParameter { name, .. })) if name == "Name"
        ));
        assert!(matches!(
            pods.list(&ListParams::default(), Some(" "), &cancel).await,
            Err(KubeClientError::Template(TemplateError::MissingParameter { name, .. })) if name == "Namespace"
        ));
    }

    #[tokio::test]
    async fn dropped_registry_means_disposed() {
        let client = KubeApiClient::new(&ConnectionOptions::for_endpoint("http://127.0.0.1:1")).unwrap();
        let pods = client.pods().unwrap();
        drop(client);

        let err = pods
            .get("web-0", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, KubeClientError::Disposed));
        assert!(matches!(
            pods.watch(&ListParams::default(), None, &CancellationToken::new()),
            Err(KubeClientError::Disposed)
        ));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let client = KubeApiClient::new(&ConnectionOptions::for_endpoint("http://127.0.0.1:1")).unwrap();
        let pods = client.pods().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pods.get("web-0", None, &cancel).await.unwrap_err();
        assert!(matches!(err, KubeClientError::Cancelled));
    }
}
