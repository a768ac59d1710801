//! Source-IP allowlist for the public HTTP surface.
//!
//! Entries are CIDR ranges, bare IPs, or DNS hostnames. Hostnames are
//! resolved at startup and re-resolved periodically so a moving upstream
//! keeps working. An empty list allows everyone.

use std::net::IpAddr;
use std::sync::RwLock;
use std::time::Duration;

use ipnet::IpNet;
use tracing::{debug, info, warn};

/// How often hostname entries are re-resolved.
pub const DNS_REFRESH_INTERVAL: Duration = Duration::from_secs(180);

/// The set of networks allowed to call the proxy endpoints.
pub struct AllowedIps {
    inputs: Vec<String>,
    nets: RwLock<Vec<Option<IpNet>>>,
}

impl AllowedIps {
    /// Parse the configured entries; hostname entries resolve on first use.
    pub async fn new(inputs: Vec<String>) -> Self {
        let nets = RwLock::new(vec![None; inputs.len()]);
        let allowed = Self { inputs, nets };
        allowed.refresh().await;
        allowed
    }

    /// True when `ip` matches any entry, or when no entries are configured.
    pub fn contains(&self, ip: IpAddr) -> bool {
        if self.inputs.is_empty() {
            return true;
        }

        self.nets
            .read()
            .unwrap()
            .iter()
            .flatten()
            .any(|net| net.contains(&ip))
    }

    /// Re-parse every entry, resolving hostnames through DNS.
    pub async fn refresh(&self) {
        let mut parsed = Vec::with_capacity(self.inputs.len());

        for input in &self.inputs {
            parsed.push(resolve_entry(input).await);
        }

        let mut nets = self.nets.write().unwrap();
        for (slot, net) in nets.iter_mut().zip(parsed) {
            // A failed lookup keeps whatever the entry resolved to before.
            if net.is_some() {
                *slot = net;
            }
        }
    }

    /// Printable form of the active allowlist.
    pub fn describe(&self) -> String {
        if self.inputs.is_empty() {
            return "(everyone)".into();
        }

        let nets = self.nets.read().unwrap();
        self.inputs
            .iter()
            .zip(nets.iter())
            .map(|(input, net)| match net {
                Some(net) => format!("{net} (input: {input})"),
                None => format!("{input} (unresolved)"),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

async fn resolve_entry(input: &str) -> Option<IpNet> {
    // CIDR or bare IP first; no DNS involved.
    if let Ok(net) = input.parse::<IpNet>() {
        return Some(net);
    }
    if let Ok(ip) = input.parse::<IpAddr>() {
        return Some(IpNet::from(ip));
    }

    // Hostname: port 0 satisfies the resolver; only addresses matter.
    match tokio::net::lookup_host((input, 0u16)).await {
        Ok(mut addrs) => addrs.next().map(|addr| IpNet::from(addr.ip())),
        Err(err) => {
            warn!(host = input, %err, "allowlist lookup failed");
            None
        }
    }
}

/// Periodically re-resolve hostname entries.
pub fn start_refresh_task(allowed: std::sync::Arc<AllowedIps>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(DNS_REFRESH_INTERVAL);
        ticker.tick().await; // the startup resolve already happened
        loop {
            ticker.tick().await;
            debug!("refreshing allowlist DNS entries");
            allowed.refresh().await;
        }
    })
}

/// Log the active allowlist at startup.
pub fn log_allowlist(allowed: &AllowedIps) {
    info!("Allowed upstreams: {}", allowed.describe());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_list_allows_everyone() {
        let allowed = AllowedIps::new(Vec::new()).await;
        assert!(allowed.contains("203.0.113.9".parse().unwrap()));
    }

    #[tokio::test]
    async fn cidr_and_bare_ip_entries() {
        let allowed =
            AllowedIps::new(vec!["10.0.0.0/8".into(), "192.0.2.7".into()]).await;

        assert!(allowed.contains("10.1.2.3".parse().unwrap()));
        assert!(allowed.contains("192.0.2.7".parse().unwrap()));
        assert!(!allowed.contains("192.0.2.8".parse().unwrap()));
        assert!(!allowed.contains("203.0.113.9".parse().unwrap()));
    }

    #[tokio::test]
    async fn ipv6_entries() {
        let allowed = AllowedIps::new(vec!["2001:db8::/32".into()]).await;
        assert!(allowed.contains("2001:db8::1".parse().unwrap()));
        assert!(!allowed.contains("2001:db9::1".parse().unwrap()));
    }

    #[tokio::test]
    async fn unresolvable_entry_denies_rather_than_allows() {
        let allowed =
            AllowedIps::new(vec!["does-not-exist.invalid".into()]).await;
        assert!(!allowed.contains("203.0.113.9".parse().unwrap()));
    }
}
