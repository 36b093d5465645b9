mod http_server;

pub use http_server::{client_ip, guarded, metrics_router, run, GuardState, QueryCount};
