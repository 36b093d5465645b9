//! IP Filter Service
//!
//! Pure allow/block/authorize decisions against an immutable snapshot of the
//! IP filter rules. Snapshots are built off to the side on every reload and
//! published as a whole; nothing here is ever mutated after construction.

use crate::domain::entities::FilterOptions;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

/// Runtime form of `FilterOptions`.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSnapshot {
    allowed: HashSet<IpAddr>,
    blocked: HashSet<IpAddr>,
    authorized: HashMap<String, HashSet<IpAddr>>,
    url_path: String,
    url_param: String,
    default_allowed: bool,
}

impl Default for FilterSnapshot {
    /// Filters nothing: no path matches and unknown IPs are allowed.
    fn default() -> Self {
        Self {
            allowed: HashSet::new(),
            blocked: HashSet::new(),
            authorized: HashMap::new(),
            url_path: String::new(),
            url_param: String::new(),
            default_allowed: true,
        }
    }
}

impl FilterSnapshot {
    /// Build a snapshot from document options.
    ///
    /// Malformed IP literals are skipped; they never abort the build.
    pub fn from_options(opts: &FilterOptions) -> Self {
        let allowed = parse_ips(&opts.allowed_ips, "allowed");
        let blocked = parse_ips(&opts.blocked_ips, "blocked");

        let mut authorized: HashMap<String, HashSet<IpAddr>> = HashMap::new();
        for entry in &opts.authorized {
            if entry.resource.is_empty() {
                continue;
            }
            let ips = parse_ips(&entry.ips, "authorized");
            authorized
                .entry(entry.resource.clone())
                .or_default()
                .extend(ips);
        }

        Self {
            allowed,
            blocked,
            authorized,
            url_path: opts.url_path.clone(),
            url_param: opts.url_param.clone(),
            default_allowed: !opts.block_by_default,
        }
    }

    /// Path the filter applies to.
    pub fn url_path(&self) -> &str {
        &self.url_path
    }

    /// Query key carrying the caller identity.
    pub fn url_param(&self) -> &str {
        &self.url_param
    }

    pub fn default_allowed(&self) -> bool {
        self.default_allowed
    }

    /// Whether requests on `path` are subject to filtering.
    pub fn applies_to(&self, path: &str) -> bool {
        !self.url_path.is_empty() && self.url_path == path
    }

    /// General allow/block decision.
    ///
    /// An explicit allow wins over an explicit block. Unknown or missing
    /// addresses fall back to the default policy.
    pub fn allowed(&self, ip: Option<IpAddr>) -> bool {
        let Some(ip) = ip.map(|ip| ip.to_canonical()) else {
            return self.default_allowed;
        };

        if self.allowed.contains(&ip) {
            return true;
        }
        if self.blocked.contains(&ip) {
            return false;
        }
        self.default_allowed
    }

    /// Whether `ip` is authorized for the resource `identity`.
    ///
    /// An empty identity is never authorized.
    pub fn authorized(&self, ip: Option<IpAddr>, identity: &str) -> bool {
        if identity.is_empty() {
            return false;
        }
        let Some(ip) = ip.map(|ip| ip.to_canonical()) else {
            return false;
        };

        self.authorized
            .get(identity)
            .map(|ips| ips.contains(&ip))
            .unwrap_or(false)
    }

    /// Admission decision for a request on the filtered path.
    pub fn admits(&self, ip: Option<IpAddr>, identity: Option<&str>) -> bool {
        self.allowed(ip) || self.authorized(ip, identity.unwrap_or_default())
    }
}

fn parse_ips(raw: &[String], list: &str) -> HashSet<IpAddr> {
    raw.iter()
        .filter_map(|literal| match literal.trim().parse::<IpAddr>() {
            Ok(ip) => Some(ip.to_canonical()),
            Err(_) => {
                tracing::warn!(list, literal = %literal, "skipping malformed IP literal");
                None
            }
        })
        .collect()
}
