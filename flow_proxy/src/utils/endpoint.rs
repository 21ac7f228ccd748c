use crate::{
    utils::{CancelToken, HostName, Resolver, SocketAddr},
    Result,
};

use std::{cell::RefCell, fmt::Display, net::IpAddr, rc::Rc};

pub type Addresses = Rc<Vec<IpAddr>>;

/// A destination that is resolved at most once.
pub struct Endpoint {
    addr: SocketAddr,
    resolved: RefCell<Option<Result<Addresses>>>,
}

impl Endpoint {
    pub fn new(addr: SocketAddr) -> Self {
        let resolved = addr.hostname.ip().map(|ip| Ok(Rc::new(vec![ip])));
        Self {
            addr,
            resolved: RefCell::new(resolved),
        }
    }

    pub fn addr(&self) -> &SocketAddr {
        &self.addr
    }

    pub fn hostname(&self) -> &HostName {
        &self.addr.hostname
    }

    pub fn port(&self) -> u16 {
        self.addr.port
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.borrow().is_some()
    }

    pub fn resolved(&self) -> Option<Result<Addresses>> {
        self.resolved.borrow().clone()
    }

    /// Same destination, without the resolution cache.
    pub fn dup(&self) -> Self {
        Self::new(self.addr.clone())
    }

    pub async fn lookup(&self, resolver: &dyn Resolver) -> Result<Addresses> {
        if let Some(cached) = self.resolved() {
            return cached;
        }

        let result = match &self.addr.hostname {
            HostName::Domain(domain) => resolver.resolve(domain).await.map(Rc::new),
            // ip hosts are cached at construction
            other => Ok(Rc::new(other.ip().into_iter().collect())),
        };
        match &result {
            Ok(addrs) => log::debug!("resolved {} to {:?}", self.addr.hostname, addrs),
            Err(e) => log::debug!("{}", e),
        }
        self.resolved.replace(Some(result.clone()));
        result
    }

    /// Callback flavour of [`Endpoint::lookup`]. The handler never runs synchronously.
    pub fn resolve(
        self: &Rc<Self>,
        resolver: Rc<dyn Resolver>,
        handler: Box<dyn FnOnce(Result<Addresses>)>,
    ) -> CancelToken {
        let token = CancelToken::new();
        let handler = token.guard(handler);

        if let Some(cached) = self.resolved() {
            handler.post(cached);
            return token;
        }

        let this = Rc::clone(self);
        tokio::task::spawn_local(async move {
            if handler.token().is_canceled() {
                return;
            }
            let result = this.lookup(&*resolver).await;
            handler.call(result);
        });
        token
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.addr.fmt(f)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Endpoint").field(&self.addr.to_string()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{flow::mock::local, Error};

    use async_trait::async_trait;
    use std::cell::Cell;

    struct CountingResolver(Cell<usize>);

    #[async_trait(?Send)]
    impl Resolver for CountingResolver {
        async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
            self.0.set(self.0.get() + 1);
            match host {
                "example.com" => Ok(vec!["93.184.216.34".parse().unwrap()]),
                _ => Err(Error::Resolve(host.to_string())),
            }
        }
    }

    #[tokio::test]
    async fn resolves_once() {
        local(async {
            let resolver = CountingResolver(Cell::new(0));
            let endpoint = Endpoint::new("example.com:80".parse().unwrap());
            assert!(!endpoint.is_resolved());

            let first = endpoint.lookup(&resolver).await.unwrap();
            let second = endpoint.lookup(&resolver).await.unwrap();
            assert_eq!(first, second);
            assert_eq!(resolver.0.get(), 1);

            assert!(!endpoint.dup().is_resolved());
        })
        .await;
    }

    #[tokio::test]
    async fn failure_is_cached() {
        local(async {
            let resolver = Rc::new(CountingResolver(Cell::new(0)));
            let endpoint = Rc::new(Endpoint::new("nowhere.invalid:80".parse().unwrap()));

            let (tx, rx) = tokio::sync::oneshot::channel();
            let _token = endpoint.resolve(
                resolver.clone(),
                Box::new(move |r: Result<Addresses>| {
                    let _ = tx.send(r.is_err());
                }),
            );
            assert!(rx.await.unwrap());
            assert!(endpoint.lookup(&*resolver).await.is_err());
            assert_eq!(resolver.0.get(), 1);
        })
        .await;
    }

    #[test]
    fn ip_endpoints_need_no_resolver() {
        let endpoint = Endpoint::new("8.8.8.8:53".parse().unwrap());
        assert!(endpoint.is_resolved());
    }
}
