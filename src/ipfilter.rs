//! Coarse client-IP filtering from config allowlist/blocklist entries.

use anyhow::Context;
use ipnet::IpNet;
use std::net::IpAddr;

/// Parse a list entry: either CIDR notation or a literal address
/// (treated as a host-length prefix).
pub fn parse_net(entry: &str) -> anyhow::Result<IpNet> {
    if let Ok(net) = entry.parse::<IpNet>() {
        return Ok(net);
    }
    let addr: IpAddr = entry
        .parse()
        .with_context(|| format!("not an IP or CIDR: {}", entry))?;
    Ok(IpNet::from(addr))
}

/// Compiled allow/block decision over client addresses.
///
/// Blocklist always wins; an empty allowlist admits everyone else.
pub struct IpFilter {
    allow: Vec<IpNet>,
    block: Vec<IpNet>,
}

impl IpFilter {
    pub fn new(allowlist: &[String], blocklist: &[String]) -> anyhow::Result<Self> {
        let allow = allowlist.iter().map(|e| parse_net(e)).collect::<Result<_, _>>()?;
        let block = blocklist.iter().map(|e| parse_net(e)).collect::<Result<_, _>>()?;
        Ok(Self { allow, block })
    }

    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        if self.block.iter().any(|net| net.contains(&ip)) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|net| net.contains(&ip))
    }

    /// The IP a request is judged by: the first `X-Forwarded-For` token when
    /// present, the connection peer otherwise. Unparseable values deny.
    pub fn check(&self, forwarded_for: Option<&str>, peer: IpAddr) -> bool {
        match forwarded_for {
            Some(value) => {
                let first = value.split(',').next().unwrap_or("").trim();
                match first.parse::<IpAddr>() {
                    Ok(ip) => self.is_allowed(ip),
                    Err(_) => false,
                }
            }
            None => self.is_allowed(peer),
        }
    }
}
