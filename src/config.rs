use crate::domain::entities::ServiceInstance;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // Identity
    pub service_name: String,
    pub group: String,
    pub listen_addr: String,
    pub advertise_ip: String,
    pub debug: bool,

    // Rule document
    pub rule_id: Option<String>,
    pub rule_dir: String,
    pub rule_poll_secs: u64,

    // Usage collector
    pub collector_url: String,
    pub collector_timeout_ms: u64,
    pub usage_flush_secs: u64,
    pub usage_send_limit: u64,

    // Health probing
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,

    /// Peer instances (`ip:port`) seeded into the registry
    pub peers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "sidecar".to_string(),
            group: "DEFAULT_GROUP".to_string(),
            listen_addr: "0.0.0.0:8080".to_string(),
            advertise_ip: "127.0.0.1".to_string(),
            debug: false,
            rule_id: None,
            rule_dir: "rules".to_string(),
            rule_poll_secs: 5,
            collector_url: "http://127.0.0.1:8181/q".to_string(),
            collector_timeout_ms: 1000,
            usage_flush_secs: 60,
            usage_send_limit: 1000,
            probe_interval_secs: 5,
            probe_timeout_secs: 5,
            peers: Vec::new(),
        }
    }
}

impl Config {
    /// Port part of `listen_addr`.
    pub fn listen_port(&self) -> Option<u16> {
        self.listen_addr.rsplit_once(':')?.1.parse().ok()
    }

    /// Peers as instances of this service. Malformed entries are skipped.
    pub fn peer_instances(&self) -> Vec<ServiceInstance> {
        self.peers
            .iter()
            .filter_map(|peer| {
                let parsed = peer.rsplit_once(':').and_then(|(ip, port)| {
                    let ip = ip.trim_matches(|c: char| c == '[' || c == ']');
                    Some((ip, port.parse::<u16>().ok()?))
                });
                match parsed {
                    Some((ip, port)) if !ip.is_empty() => Some(ServiceInstance::new(
                        self.service_name.clone(),
                        self.group.clone(),
                        ip,
                        port,
                    )),
                    _ => {
                        tracing::warn!(peer = %peer, "skipping malformed peer address");
                        None
                    }
                }
            })
            .collect()
    }
}

pub fn load_config() -> anyhow::Result<Config> {
    from_lookup(|key| std::env::var(key).ok())
}

fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
    let defaults = Config::default();

    let string = |key: &str, default: String| var(key).unwrap_or(default);
    let number = |key: &str, default: u64| -> anyhow::Result<u64> {
        match var(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid value for {}: '{}' ({})", key, raw, e)),
            None => Ok(default),
        }
    };

    // Durations feed periodic timers and request timeouts; zero is never valid
    let positive = |key: &str, default: u64| -> anyhow::Result<u64> {
        let value = number(key, default)?;
        if value == 0 {
            anyhow::bail!("{} must be greater than zero", key);
        }
        Ok(value)
    };

    let peers = var("SIDECAR_PEERS")
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Ok(Config {
        service_name: string("SIDECAR_SERVICE_NAME", defaults.service_name),
        group: string("SIDECAR_GROUP", defaults.group),
        listen_addr: string("SIDECAR_LISTEN_ADDR", defaults.listen_addr),
        advertise_ip: string("SIDECAR_ADVERTISE_IP", defaults.advertise_ip),
        debug: var("DEBUG").is_some(),
        rule_id: var("SIDECAR_RULE_ID").filter(|v| !v.is_empty()),
        rule_dir: string("SIDECAR_RULE_DIR", defaults.rule_dir),
        rule_poll_secs: positive("SIDECAR_RULE_POLL_SECS", defaults.rule_poll_secs)?,
        collector_url: string("SIDECAR_COLLECTOR_URL", defaults.collector_url),
        collector_timeout_ms: positive("SIDECAR_COLLECTOR_TIMEOUT_MS", defaults.collector_timeout_ms)?,
        usage_flush_secs: positive("SIDECAR_USAGE_FLUSH_SECS", defaults.usage_flush_secs)?,
        usage_send_limit: number("SIDECAR_USAGE_SEND_LIMIT", defaults.usage_send_limit)?,
        probe_interval_secs: positive("SIDECAR_PROBE_INTERVAL_SECS", defaults.probe_interval_secs)?,
        probe_timeout_secs: positive("SIDECAR_PROBE_TIMEOUT_SECS", defaults.probe_timeout_secs)?,
        peers,
    })
}
