use crate::{
    utils::{HostName, SocketAddr},
    Error, Result,
};

use hyper::Uri;
use percent_encoding::percent_decode_str;

/// A request target split into the parts a forwarding proxy cares about.
#[derive(Clone, Debug)]
pub struct ParsedUri {
    pub scheme: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub hostname: Option<HostName>,
    pub port: Option<u16>,
    pub path: String,
    pub query: Option<String>,
}

impl ParsedUri {
    pub fn parse(target: &str) -> Result<Self> {
        let uri: Uri = target.parse().map_err(|_| Error::InvalidRequest)?;
        uri.try_into()
    }

    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    pub fn hostname(&self) -> Option<&HostName> {
        self.hostname.as_ref()
    }

    /// The explicit port, or the scheme's well-known one.
    pub fn port_or_default(&self) -> Option<u16> {
        self.port.or(match self.scheme()? {
            "http" | "ws" => Some(80),
            "https" | "wss" => Some(443),
            _ => None,
        })
    }

    pub fn destination(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(
            self.hostname.clone()?,
            self.port_or_default()?,
        ))
    }

    /// Path and query only, as sent to an origin server.
    pub fn origin_form(&self) -> String {
        let mut target = self.path.clone();
        if let Some(query) = &self.query {
            target.push('?');
            target.push_str(query);
        }
        target
    }
}

impl TryFrom<Uri> for ParsedUri {
    type Error = Error;

    fn try_from(value: Uri) -> Result<Self> {
        let mut user = None;
        let mut password = None;
        let mut hostname = None;
        let mut port = None;

        if let Some(authority) = value.authority() {
            let host = match authority.as_str().rsplit_once('@') {
                Some((auth, host)) => {
                    let decode = |s: &str| {
                        percent_decode_str(s)
                            .decode_utf8()
                            .map(|s| s.to_string())
                            .map_err(|_| Error::InvalidRequest)
                    };
                    match auth.split_once(':') {
                        Some((u, p)) => {
                            user = Some(decode(u)?);
                            password = Some(decode(p)?);
                        }
                        None => user = Some(decode(auth)?),
                    }
                    host
                }
                None => authority.as_str(),
            };

            let (hostname_, port_) = SocketAddr::parse_host_header(host)?;
            hostname = Some(hostname_);
            port = port_;
        }

        let scheme = value.scheme_str().map(|s| s.to_ascii_lowercase());
        if scheme.is_some() && hostname.is_none() {
            return Err(Error::InvalidRequest);
        }
        if scheme.is_none() && user.is_some() {
            return Err(Error::InvalidRequest);
        }

        let path = match value.path() {
            "" => "/".to_string(),
            path => path.to_string(),
        };
        let query = value.query().filter(|q| !q.is_empty()).map(str::to_string);

        Ok(ParsedUri {
            scheme,
            user,
            password,
            hostname,
            port,
            path,
            query,
        })
    }
}
