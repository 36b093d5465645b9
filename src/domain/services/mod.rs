//! Domain Services
//!
//! Pure logic with no I/O: IP filter decisions and threshold rebalancing.

pub mod ip_filter;
pub mod rebalance;

pub use ip_filter::FilterSnapshot;
pub use rebalance::rebalance;
