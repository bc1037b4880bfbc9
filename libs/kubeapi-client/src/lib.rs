#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Typed Kubernetes API client.
//!
//! [`KubeApiClient`] owns one [`Transport`](kubeapi_transport::Transport)
//! and hands out one [`ResourceClient`] per resource type, created on first
//! use and shared afterwards. Resource clients expand the kind's URL
//! templates, run get/list/create/update/delete over the shared transport
//! and open [`WatchStream`]s of typed [`ChangeEvent`]s.
//!
//! Model types come from `k8s-openapi`.
//!
//! # Example
//!
//! ```ignore
//! use futures::StreamExt;
//! use kubeapi_client::{KubeApiClient, ListParams};
//! use kubeapi_transport::ConnectionOptions;
//! use tokio_util::sync::CancellationToken;
//!
//! let client = KubeApiClient::new(&ConnectionOptions::from_pod_service_account()?)?;
//! let pods = client.pods()?;
//! let cancel = CancellationToken::new();
//!
//! let list = pods.list(&ListParams::default().labels("app=web"), None, &cancel).await?;
//! let version = list.metadata.resource_version.unwrap_or_default();
//!
//! let mut events = pods.watch(&ListParams::default().labels("app=web").at(version), None, &cancel)?;
//! while let Some(event) = events.next().await {
//!     let event = event?;
//!     tracing::info!(kind = %event.event_type(), "pod changed");
//! }
//! ```

mod error;
mod registry;
mod resources;
pub mod template;
mod watch;

pub use error::{KubeClientError, TemplateError};
pub use registry::KubeApiClient;
pub use resources::{
    ApiResource, ConfigMaps, DeleteOutcome, DeleteParams, Deployments, ListParams, Patch, Pods,
    PropagationPolicy, ReplicaSets, ResourceClient, ResourceTemplates, Services,
};
pub use template::{RequestTemplate, TemplateParams};
pub use watch::{ChangeEvent, EventType, WatchState, WatchStream};

pub use k8s_openapi;
pub use kubeapi_transport;
