//! Domain Layer
//!
//! Entities, change events, outbound ports and pure services.

pub mod entities;
pub mod events;
pub mod ports;
pub mod services;
