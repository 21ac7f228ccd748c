pub mod layer;

mod http;
mod socks5;
mod speed;

pub use http::{HttpConnectFlow, HttpProxy};
pub use socks5::{Socks5Flow, Socks5Proxy};
pub use speed::RaceFlow;

use crate::{
    config::{Config, ProxyConfig, RouteConfig},
    flow::{RemoteDataFlow, StreamFlow},
    outbound::layer::Layer,
    utils::{Resolver, Session},
    Error, Result,
};

use std::{rc::Rc, time::Duration};

use tokio::net::TcpStream;

/// Produces the remote chain for one session.
pub trait Outbound {
    fn build(&self, session: &Rc<Session>) -> Result<Box<dyn RemoteDataFlow>>;
}

enum Client {
    Http(HttpProxy),
    Socks5(Socks5Proxy),
}

struct Hop {
    layers: Vec<Box<dyn Layer>>,
    client: Client,
}

impl Hop {
    fn new(conf: &ProxyConfig) -> Result<Self> {
        let protocol: Vec<&str> = conf.protocol.split('+').collect();
        let (main, layers) = protocol
            .split_last()
            .ok_or_else(|| Error::InvalidConfig("empty protocol".into()))?;

        let layers = layers
            .iter()
            .map(|name| layer::by_name(name))
            .collect::<Result<Vec<_>>>()?;
        let client = match *main {
            "http" => Client::Http(HttpProxy::new(conf)?),
            "socks5" => Client::Socks5(Socks5Proxy::new(conf)?),
            _ => {
                return Err(Error::InvalidConfig(format!(
                    "this protocol can not be used: {}",
                    main
                )))
            }
        };
        Ok(Self { layers, client })
    }

    fn wrap(&self, mut next: Box<dyn RemoteDataFlow>) -> Box<dyn RemoteDataFlow> {
        for layer in &self.layers {
            next = layer.wrap(next);
        }
        match &self.client {
            Client::Http(proxy) => Box::new(HttpConnectFlow::new(next, proxy.clone())),
            Client::Socks5(proxy) => Box::new(Socks5Flow::new(next, proxy.clone())),
        }
    }
}

struct Route {
    hops: Vec<Hop>,
    delay: Duration,
}

impl Route {
    fn new(conf: &RouteConfig) -> Result<Self> {
        Ok(Self {
            hops: conf.proxies.iter().map(Hop::new).collect::<Result<_>>()?,
            delay: Duration::from_millis(conf.delay_ms),
        })
    }
}

/// Builds chains from the configured routes: a TCP leg at the bottom, then
/// every proxy of the route in order. More than one route is raced.
pub struct ChainOutbound {
    routes: Vec<Route>,
    resolver: Rc<dyn Resolver>,
}

impl ChainOutbound {
    pub fn new(config: &Config, resolver: Rc<dyn Resolver>) -> Result<Self> {
        let routes = config.routes.iter().map(Route::new).collect::<Result<_>>()?;
        Ok(Self { routes, resolver })
    }

    pub fn direct(resolver: Rc<dyn Resolver>) -> Self {
        Self {
            routes: Vec::new(),
            resolver,
        }
    }

    fn chain(&self, route: Option<&Route>, session: &Rc<Session>) -> Box<dyn RemoteDataFlow> {
        let mut flow: Box<dyn RemoteDataFlow> = Box::new(StreamFlow::<TcpStream>::tcp(
            session.clone(),
            self.resolver.clone(),
        ));
        for hop in route.map(|r| r.hops.as_slice()).unwrap_or_default() {
            flow = hop.wrap(flow);
        }
        flow
    }
}

impl Outbound for ChainOutbound {
    fn build(&self, session: &Rc<Session>) -> Result<Box<dyn RemoteDataFlow>> {
        match self.routes.as_slice() {
            [] => Ok(self.chain(None, session)),
            [route] => Ok(self.chain(Some(route), session)),
            routes => {
                let candidates = routes
                    .iter()
                    .map(|route| (self.chain(Some(route), session), route.delay))
                    .collect();
                Ok(Box::new(RaceFlow::new(session.clone(), candidates)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{flow::DataFlow, utils::SystemResolver};

    fn proxy(protocol: &str) -> ProxyConfig {
        ProxyConfig {
            protocol: protocol.into(),
            user: None,
            password: None,
            server: "127.0.0.1:3128".into(),
        }
    }

    fn outbound(routes: Vec<Vec<ProxyConfig>>) -> Result<ChainOutbound> {
        let config = Config {
            socks5_listen: Vec::new(),
            http_listen: Vec::new(),
            routes: routes
                .into_iter()
                .map(|proxies| RouteConfig {
                    delay_ms: 0,
                    proxies,
                })
                .collect(),
            idle_timeout_secs: 300,
        };
        ChainOutbound::new(&config, Rc::new(SystemResolver))
    }

    fn depth(flow: &dyn DataFlow) -> usize {
        1 + flow.next_hop().map(depth).unwrap_or(0)
    }

    #[tokio::test]
    async fn route_is_stacked_in_order() {
        let outbound = outbound(vec![vec![proxy("tls+http"), proxy("socks5")]]).unwrap();
        let session = Session::new();
        let flow = outbound.build(&session).unwrap();
        assert_eq!(depth(flow.as_data_flow()), 4);
        assert_eq!(flow.session().id(), session.id());
    }

    #[tokio::test]
    async fn direct_is_a_single_leg() {
        let flow = ChainOutbound::direct(Rc::new(SystemResolver))
            .build(&Session::new())
            .unwrap();
        assert!(flow.next_hop().is_none());
    }

    #[tokio::test]
    async fn several_routes_are_raced() {
        let outbound = outbound(vec![vec![proxy("http")], vec![]]).unwrap();
        let flow = outbound.build(&Session::new()).unwrap();
        // nothing adopted before connect
        assert!(flow.next_hop().is_none());
        assert!(!flow.state_machine().is_errored());
    }

    #[test]
    fn unknown_protocols_are_rejected() {
        assert!(matches!(
            outbound(vec![vec![proxy("socks4")]]),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            outbound(vec![vec![proxy("quic+http")]]),
            Err(Error::InvalidConfig(_))
        ));
    }
}
