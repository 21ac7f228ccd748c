use crate::{Error, Result};

use std::net::IpAddr;

use async_trait::async_trait;

#[async_trait(?Send)]
pub trait Resolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Resolves through the operating system.
#[derive(Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait(?Send)]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|_| Error::Resolve(host.to_string()))?
            .map(|addr| addr.ip())
            .collect();

        if addrs.is_empty() {
            return Err(Error::Resolve(host.to_string()));
        }
        Ok(addrs)
    }
}
