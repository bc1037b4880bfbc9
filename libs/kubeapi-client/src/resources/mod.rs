//! Typed resource clients.

mod client;
mod params;

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};

pub use client::{ApiResource, ResourceClient, ResourceTemplates};
pub use params::{DeleteOutcome, DeleteParams, ListParams, Patch, PropagationPolicy};

pub type Pods = ResourceClient<Pod>;
pub type ReplicaSets = ResourceClient<ReplicaSet>;
pub type Deployments = ResourceClient<Deployment>;
pub type Services = ResourceClient<Service>;
pub type ConfigMaps = ResourceClient<ConfigMap>;
