//! Tower layers composed by [`TransportBuilder`](crate::TransportBuilder).
//!
//! - [`BearerAuthLayer`] - attaches the configured bearer token
//! - [`DiagnosticsLayer`] - opt-in header and payload logging

mod bearer;
mod diagnostics;

pub use bearer::{BearerAuthLayer, BearerAuthService};
pub use diagnostics::{DIAGNOSTICS_TARGET, DiagnosticsConfig, DiagnosticsLayer, DiagnosticsService};
