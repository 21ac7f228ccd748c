use crate::{Error, Result};

use std::{
    fmt::{Display, Write},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SocketAddr {
    pub hostname: HostName,
    pub port: u16,
}

impl SocketAddr {
    pub fn new(hostname: HostName, port: u16) -> Self {
        Self { hostname, port }
    }

    /// Splits `host[:port]` the way it appears in a `Host` header or request target.
    pub fn parse_host_header(host: &str) -> Result<(HostName, Option<u16>)> {
        let invalid = || Error::InvalidEndpoint(host.to_string());

        let hostname;
        let mut port = None;
        if let Some(rest) = host.strip_prefix('[') {
            let (v6, tail) = rest.split_once(']').ok_or_else(invalid)?;
            hostname = v6;
            if let Some(p) = tail.strip_prefix(':') {
                port = Some(p.parse().map_err(|_| invalid())?);
            } else if !tail.is_empty() {
                return Err(invalid());
            }
        } else if let Some((h, p)) = host.rsplit_once(':') {
            if h.contains(':') {
                // bare v6 literal without brackets
                hostname = host;
            } else {
                hostname = h;
                port = Some(p.parse().map_err(|_| invalid())?);
            }
        } else {
            hostname = host;
        }

        Ok((HostName::from_str(hostname)?, port))
    }
}

impl Display for SocketAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.hostname.to_string_url_style())?;
        f.write_char(':')?;
        f.write_str(&self.port.to_string())
    }
}

impl FromStr for SocketAddr {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(addr) = std::net::SocketAddr::from_str(s) {
            return Ok(addr.into());
        }

        match Self::parse_host_header(s)? {
            (hostname, Some(port)) => Ok(Self { hostname, port }),
            (_, None) => Err(Error::InvalidEndpoint(s.to_string())),
        }
    }
}

impl From<std::net::SocketAddr> for SocketAddr {
    fn from(value: std::net::SocketAddr) -> Self {
        Self {
            hostname: value.ip().into(),
            port: value.port(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum HostName {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

impl HostName {
    pub fn is_ipaddr(&self) -> bool {
        !matches!(self, Self::Domain(_))
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Self::V4(v4) => Some(IpAddr::V4(*v4)),
            Self::V6(v6) => Some(IpAddr::V6(*v6)),
            Self::Domain(_) => None,
        }
    }

    pub fn to_string_url_style(&self) -> String {
        match self {
            Self::V6(v6) => format!("[{}]", v6),
            _ => self.to_string(),
        }
    }
}

impl Display for HostName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V4(v4) => f.write_str(&v4.to_string()),
            Self::V6(v6) => f.write_str(&v6.to_string()),
            Self::Domain(domain) => f.write_str(domain),
        }
    }
}

impl FromStr for HostName {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(ip) = IpAddr::from_str(s) {
            Ok(ip.into())
        } else {
            let domain = idna::domain_to_ascii_strict(s)
                .map_err(|_| Error::InvalidEndpoint(s.to_string()))?;
            if domain.is_empty() || domain.len() > 255 {
                return Err(Error::InvalidEndpoint(s.to_string()));
            }
            Ok(Self::Domain(domain))
        }
    }
}

impl From<IpAddr> for HostName {
    fn from(value: IpAddr) -> Self {
        match value {
            IpAddr::V4(v4) => v4.into(),
            IpAddr::V6(v6) => v6.into(),
        }
    }
}

impl From<Ipv4Addr> for HostName {
    fn from(value: Ipv4Addr) -> Self {
        Self::V4(value)
    }
}

impl From<Ipv6Addr> for HostName {
    fn from(value: Ipv6Addr) -> Self {
        match value.to_ipv4_mapped() {
            Some(v4) => Self::V4(v4),
            None => Self::V6(value),
        }
    }
}
