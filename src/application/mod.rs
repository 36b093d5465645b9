//! Application Layer
//!
//! Use cases that orchestrate the domain and infrastructure.

pub mod sidecar;
pub mod traffic_guard;

pub use sidecar::{Collaborators, Sidecar, SidecarError, SidecarOptions};
pub use traffic_guard::{Admission, Rejection, RequestInfo, TrafficGuard};
