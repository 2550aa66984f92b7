//! `SocketAddr` and `Endpoint`.

use std::{cmp::Ordering, fmt, net::IpAddr, str::FromStr};

use anyhow::{Context, Result, bail};

/// An immutable `(ip, port)` pair, ordered by `(ip, port)` and rendered as
/// `ip:port`. Accepts the `loopback` alias for `127.0.0.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketAddr {
    ip: IpAddr,
    port: u16,
}

impl SocketAddr {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parses `ip:port`, or `loopback:port` as an alias for `127.0.0.1:port`.
    pub fn parse(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .with_context(|| format!("missing ':port' in address {s:?}"))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid port in address {s:?}"))?;
        let ip = if host.eq_ignore_ascii_case("loopback") {
            IpAddr::from([127, 0, 0, 1])
        } else {
            IpAddr::from_str(host).with_context(|| format!("invalid ip in address {s:?}"))?
        };
        Ok(Self { ip, port })
    }
}

impl From<std::net::SocketAddr> for SocketAddr {
    fn from(a: std::net::SocketAddr) -> Self {
        Self {
            ip: a.ip(),
            port: a.port(),
        }
    }
}

impl From<SocketAddr> for std::net::SocketAddr {
    fn from(a: SocketAddr) -> Self {
        std::net::SocketAddr::new(a.ip, a.port)
    }
}

impl fmt::Display for SocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl PartialOrd for SocketAddr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SocketAddr {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ip, self.port).cmp(&(other.ip, other.port))
    }
}

/// The transport a listener/connector speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// `(protocol, addr)` plus the source URL it was parsed from. Equality and
/// hashing are by `(protocol, addr)` only — the original URL is carried for
/// diagnostics and is deliberately excluded so two differently-spelled URLs
/// resolving to the same address collapse to one map entry (required for
/// `ChannelMap`/`PendingConnects` keying).
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub addr: SocketAddr,
    pub source_url: String,
}

impl Endpoint {
    /// Parses a URL of the form `tcp://ip:port` or `udp://ip:port`;
    /// schema-less strings default to `tcp://`. Returns an error for
    /// malformed entries so callers (`ServiceStub::set_url_list`) can
    /// discard them the way the source does.
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        if url.is_empty() {
            bail!("empty endpoint url");
        }
        let (protocol, rest) = if let Some(rest) = url.strip_prefix("tcp://") {
            (Protocol::Tcp, rest)
        } else if let Some(rest) = url.strip_prefix("udp://") {
            (Protocol::Udp, rest)
        } else {
            (Protocol::Tcp, url)
        };
        let addr = SocketAddr::parse(rest)?;
        Ok(Self {
            protocol,
            addr,
            source_url: url.to_string(),
        })
    }

    /// The string key used by `PendingConnects`.
    pub fn peer_key(&self) -> String {
        self.addr.to_string()
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.protocol == other.protocol && self.addr == other.addr
    }
}

impl Eq for Endpoint {}

impl std::hash::Hash for Endpoint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.protocol.hash(state);
        self.addr.hash(state);
    }
}
