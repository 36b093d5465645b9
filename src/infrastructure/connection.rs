//! Backend Connection
//!
//! A handle to one backend endpoint with a liveness flag. The flag is
//! written only by the connection's health prober and read by the pool.

use parking_lot::Mutex;
use reqwest::Url;

/// A backend endpoint and its last known liveness.
#[derive(Debug)]
pub struct Connection {
    endpoint: Url,
    broken: Mutex<bool>,
}

impl Connection {
    /// Create a connection that is assumed live until probed.
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            broken: Mutex::new(false),
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Result of the most recent probe.
    pub fn is_broken(&self) -> bool {
        *self.broken.lock()
    }

    /// Record a probe result. Returns true if the state flipped.
    pub(crate) fn set_broken(&self, broken: bool) -> bool {
        let mut flag = self.broken.lock();
        let changed = *flag != broken;
        *flag = broken;
        changed
    }

    /// `host:port` target for reachability probes.
    ///
    /// The port falls back to the scheme default.
    pub fn probe_addr(&self) -> Option<String> {
        let host = self.endpoint.host_str()?;
        let port = self.endpoint.port_or_known_default()?;
        if host.contains(':') {
            Some(format!("[{}]:{}", host.trim_matches(|c: char| c == '[' || c == ']'), port))
        } else {
            Some(format!("{}:{}", host, port))
        }
    }

    /// Read-only copy of the current state.
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            endpoint: self.endpoint.clone(),
            broken: self.is_broken(),
        }
    }
}

/// Detached snapshot of a connection, for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub endpoint: Url,
    pub broken: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(url: &str) -> Connection {
        Connection::new(Url::parse(url).unwrap())
    }

    #[test]
    fn test_new_connection_is_live() {
        let c = conn("http://127.0.0.1:8080");
        assert!(!c.is_broken());
        assert_eq!(c.endpoint().as_str(), "http://127.0.0.1:8080/");
    }

    #[test]
    fn test_set_broken_reports_change() {
        let c = conn("http://127.0.0.1:8080");
        assert!(c.set_broken(true));
        assert!(c.is_broken());
        assert!(!c.set_broken(true));
        assert!(c.set_broken(false));
        assert!(!c.is_broken());
    }

    #[test]
    fn test_probe_addr_explicit_port() {
        assert_eq!(
            conn("http://10.0.0.1:9000/q").probe_addr(),
            Some("10.0.0.1:9000".to_string())
        );
    }

    #[test]
    fn test_probe_addr_default_port() {
        assert_eq!(
            conn("http://example.com/").probe_addr(),
            Some("example.com:80".to_string())
        );
        assert_eq!(
            conn("https://example.com/").probe_addr(),
            Some("example.com:443".to_string())
        );
    }

    #[test]
    fn test_probe_addr_ipv6() {
        assert_eq!(
            conn("http://[::1]:8080/").probe_addr(),
            Some("[::1]:8080".to_string())
        );
    }

    #[test]
    fn test_info_is_detached_copy() {
        let c = conn("http://127.0.0.1:8080");
        let info = c.info();
        c.set_broken(true);
        assert!(!info.broken);
        assert!(c.info().broken);
    }
}
