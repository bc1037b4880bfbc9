use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use serde::Serialize;

/// Filters for `list` and `watch`. Unset fields are left out of the query.
///
/// Selectors are passed to the API server verbatim.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListParams {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub resource_version: Option<String>,
}

impl ListParams {
    #[must_use]
    pub fn labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    #[must_use]
    pub fn fields(mut self, selector: impl Into<String>) -> Self {
        self.field_selector = Some(selector.into());
        self
    }

    /// Start from `version`, typically the `resourceVersion` of a previous
    /// list, so a following watch misses no change.
    #[must_use]
    pub fn at(mut self, version: impl Into<String>) -> Self {
        self.resource_version = Some(version.into());
        self
    }
}

/// Partial modification sent with `PATCH`.
///
/// The variant picks the patch format and therefore the `Content-Type`.
#[derive(Clone, Debug, PartialEq)]
pub enum Patch<P> {
    /// RFC 6902 JSON Patch: an array of operations.
    Json(P),
    /// RFC 7386 JSON Merge Patch.
    Merge(P),
    /// Kubernetes strategic merge patch.
    Strategic(P),
}

impl<P> Patch<P> {
    #[must_use]
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json(_) => "application/json-patch+json",
            Self::Merge(_) => "application/merge-patch+json",
            Self::Strategic(_) => "application/strategic-merge-patch+json",
        }
    }

    #[must_use]
    pub fn document(&self) -> &P {
        match self {
            Self::Json(p) | Self::Merge(p) | Self::Strategic(p) => p,
        }
    }
}

/// Whether and when dependents of a deleted object are removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum PropagationPolicy {
    /// Dependents are kept and lose their owner reference.
    Orphan,
    /// The object goes now, dependents are collected afterwards.
    #[default]
    Background,
    /// Dependents go first; the object stays, marked for deletion, until
    /// they are gone.
    Foreground,
}

impl PropagationPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Orphan => "Orphan",
            Self::Background => "Background",
            Self::Foreground => "Foreground",
        }
    }
}

impl fmt::Display for PropagationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a `DELETE` request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteParams {
    pub propagation_policy: PropagationPolicy,
    /// `Some(0)` deletes immediately.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_period_seconds: Option<i64>,
}

impl From<PropagationPolicy> for DeleteParams {
    fn from(propagation_policy: PropagationPolicy) -> Self {
        Self {
            propagation_policy,
            grace_period_seconds: None,
        }
    }
}

/// What the server answered to a delete.
///
/// `Resource` is the object in its terminating state: always the case for
/// [`PropagationPolicy::Foreground`], and for other policies when deletion
/// waits on finalizers. `Status` covers immediate deletions and objects that
/// were already gone.
#[derive(Clone, Debug, PartialEq)]
pub enum DeleteOutcome<K> {
    Resource(K),
    Status(Status),
}

impl<K> DeleteOutcome<K> {
    #[must_use]
    pub fn resource(&self) -> Option<&K> {
        match self {
            Self::Resource(r) => Some(r),
            Self::Status(_) => None,
        }
    }

    #[must_use]
    pub fn status(&self) -> Option<&Status> {
        match self {
            Self::Status(s) => Some(s),
            Self::Resource(_) => None,
        }
    }

    /// True when the object did not exist any more.
    #[must_use]
    pub fn was_already_gone(&self) -> bool {
        self.status().and_then(|s| s.code) == Some(404)
    }
}
