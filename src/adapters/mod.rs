//! Adapters Layer
//!
//! Inbound: the guarded HTTP surface.
//! Outbound: implementations of the domain ports.

pub mod inbound;
pub mod outbound;
