pub mod http;
pub mod socks5;

pub use http::HttpServerFlow;
pub use socks5::Socks5ServerFlow;

use crate::{
    config::Config,
    flow::{LocalDataFlow, StreamFlow},
    outbound::Outbound,
    tunnel,
    utils::{Buffer, Guarded, Session},
    Error, Result,
};

use std::{fmt, rc::Rc, time::Duration};

use tokio::net::TcpListener;

/// A local leg that negotiates on top of the accepted client connection.
pub(crate) trait Negotiator: 'static {
    fn client(&self) -> &dyn LocalDataFlow;
}

/// Writes `reply` (if any) to the client, then lets the client leg report
/// `error` in its own way. `handler` sees the client's outcome.
pub(crate) fn reply_then_report<T: Negotiator>(
    this: &Rc<T>,
    reply: Option<Vec<u8>>,
    error: &Error,
    handler: Guarded<Result<()>>,
) {
    let Some(reply) = reply else {
        this.client().report_error(
            error,
            Box::new(move |result: Result<()>| {
                handler.call(result);
            }),
        );
        return;
    };

    let error = error.clone();
    let weak = Rc::downgrade(this);
    this.client().write(
        Buffer::from(reply),
        Box::new(move |result: Result<()>| {
            let Some(this) = weak.upgrade() else {
                return;
            };
            if let Err(e) = result {
                log::debug!("error reply not delivered: {}", e);
            }
            this.client().report_error(
                &error,
                Box::new(move |result: Result<()>| {
                    handler.call(result);
                }),
            );
        }),
    );
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Protocol {
    Socks5,
    Http,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Socks5 => f.write_str("socks5"),
            Protocol::Http => f.write_str("http"),
        }
    }
}

/// Binds every configured listener and serves them forever.
///
/// Must run inside a `LocalSet`.
pub async fn start(config: &Config, outbound: Rc<dyn Outbound>) -> Result<()> {
    let idle_timeout = Duration::from_secs(config.idle_timeout_secs);

    let configured = config
        .socks5_listen
        .iter()
        .map(|addr| (addr, Protocol::Socks5))
        .chain(config.http_listen.iter().map(|addr| (addr, Protocol::Http)));
    let mut listeners = Vec::new();
    for (addr, protocol) in configured {
        let listener = TcpListener::bind(addr).await?;
        log::info!("{} proxy listening on {}", protocol, addr);
        listeners.push((listener, protocol));
    }
    if listeners.is_empty() {
        return Err(Error::InvalidConfig("no listener configured".into()));
    }

    for (listener, protocol) in listeners {
        tokio::task::spawn_local(serve(listener, protocol, outbound.clone(), idle_timeout));
    }

    std::future::pending::<()>().await;
    Ok(())
}

async fn serve(
    listener: TcpListener,
    protocol: Protocol,
    outbound: Rc<dyn Outbound>,
    idle_timeout: Duration,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(o) => o,
            Err(e) => {
                log::warn!("accept failed: {}", e);
                continue;
            }
        };
        let session = Session::new();
        let id = session.id();
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[{}] set_nodelay on {} failed: {}", id, peer, e);
        }
        log::debug!("[{}] {} client {}", id, protocol, peer);

        let raw = Box::new(StreamFlow::accepted(stream, session));
        let local: Box<dyn LocalDataFlow> = match protocol {
            Protocol::Socks5 => Box::new(Socks5ServerFlow::new(raw)),
            Protocol::Http => Box::new(HttpServerFlow::new(raw)),
        };

        let outbound = outbound.clone();
        tokio::task::spawn_local(async move {
            if let Err(e) = tunnel::run(local, outbound, idle_timeout).await {
                log::debug!("[{}] tunnel ended: {}", id, e);
            }
        });
    }
}
