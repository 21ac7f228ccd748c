use crate::{
    config::ProxyConfig,
    flow::{
        relay::{self, Ops, Relayed, Tracked},
        DataFlow, DataHandler, EventHandler, FlowStateMachine, FsmCell, RemoteDataFlow, Role,
    },
    utils::{Buffer, CancelToken, Endpoint, Guarded, HostName, Session, SocketAddr},
    Error, Result,
};

use std::{cell::RefCell, rc::Rc, str::FromStr};

const VERSION: u8 = 5;

#[derive(Clone)]
struct Credentials {
    user: String,
    password: String,
}

/// Socks5 proxy settings shared by every session's client leg.
#[derive(Clone)]
pub struct Socks5Proxy {
    server: SocketAddr,
    credentials: Option<Credentials>,
}

impl Socks5Proxy {
    pub fn new(conf: &ProxyConfig) -> Result<Self> {
        let credentials = match &conf.user {
            Some(user) if !user.is_empty() => {
                let password = conf.password.clone().unwrap_or_default();
                if user.len() > 255 || password.len() > 255 {
                    return Err(Error::InvalidConfig(
                        "socks5 credentials longer than 255 bytes".into(),
                    ));
                }
                Some(Credentials {
                    user: user.clone(),
                    password,
                })
            }
            _ => None,
        };

        Ok(Self {
            server: SocketAddr::from_str(&conf.server)?,
            credentials,
        })
    }

    pub fn server(&self) -> &SocketAddr {
        &self.server
    }
}

fn connect_request(target: &SocketAddr) -> Result<Vec<u8>> {
    let mut request = vec![VERSION, 1, 0];
    match &target.hostname {
        HostName::V4(v4) => {
            request.push(1);
            request.extend_from_slice(&v4.octets());
        }
        HostName::V6(v6) => {
            request.push(4);
            request.extend_from_slice(&v6.octets());
        }
        HostName::Domain(domain) => {
            let len = u8::try_from(domain.len())
                .map_err(|_| Error::InvalidEndpoint(domain.clone()))?;
            request.push(3);
            request.push(len);
            request.extend_from_slice(domain.as_bytes());
        }
    }
    request.extend_from_slice(&target.port.to_be_bytes());
    Ok(request)
}

struct Negotiation {
    handler: Option<Guarded<Result<()>>>,
    target: Option<Rc<Endpoint>>,
    pending: Vec<u8>,
}

struct ClientInner {
    next: Box<dyn RemoteDataFlow>,
    session: Rc<Session>,
    proxy: Socks5Proxy,
    fsm: FsmCell,
    ops: Ops,
    negotiation: RefCell<Negotiation>,
}

impl Tracked for ClientInner {
    fn fsm(&self) -> &FsmCell {
        &self.fsm
    }

    fn ops(&self) -> &Ops {
        &self.ops
    }

    fn session_id(&self) -> u64 {
        self.session.id()
    }
}

impl Relayed for ClientInner {
    fn next(&self) -> &dyn DataFlow {
        self.next.as_data_flow()
    }
}

type Step = fn(&Rc<ClientInner>, Vec<u8>);

impl ClientInner {
    fn finish(&self, result: Result<()>) {
        match &result {
            Ok(()) => self.fsm.update(|m| m.connected()),
            Err(e) => {
                log::debug!(
                    "[{}] socks5 handshake with {} failed: {}",
                    self.session.id(),
                    self.proxy.server,
                    e
                );
                self.fsm.update(|m| m.errored());
            }
        }
        let handler = self.negotiation.borrow_mut().handler.take();
        if let Some(handler) = handler {
            handler.call(result);
        }
    }

    fn send(self: &Rc<Self>, bytes: Vec<u8>, then: fn(&Rc<Self>)) {
        let weak = Rc::downgrade(self);
        self.next.write(
            Buffer::from(bytes),
            Box::new(move |result: Result<()>| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok(()) => then(&this),
                    Err(e) => this.finish(Err(e)),
                }
            }),
        );
    }

    /// Reads exactly `n` bytes; never reads past them.
    fn read_exact(self: &Rc<Self>, n: usize, then: Step) {
        let have = self.negotiation.borrow().pending.len();
        if have >= n {
            let data = std::mem::take(&mut self.negotiation.borrow_mut().pending);
            then(self, data);
            return;
        }

        let weak = Rc::downgrade(self);
        self.next.read(
            Buffer::new(n - have),
            Box::new(move |result: Result<Buffer>| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok(buffer) => {
                        this.negotiation
                            .borrow_mut()
                            .pending
                            .extend_from_slice(&buffer);
                        this.read_exact(n, then);
                    }
                    Err(Error::Eof) => this.finish(Err(Error::InvalidResponse)),
                    Err(e) => this.finish(Err(e)),
                }
            }),
        );
    }

    fn send_greeting(self: &Rc<Self>) {
        let greeting = match self.proxy.credentials {
            Some(_) => vec![VERSION, 2, 0, 2],
            None => vec![VERSION, 1, 0],
        };
        self.send(greeting, |this| this.read_exact(2, Self::on_method));
    }

    fn on_method(self: &Rc<Self>, reply: Vec<u8>) {
        if reply[0] != VERSION {
            self.finish(Err(Error::ServerVersionNotSupported));
            return;
        }
        match (reply[1], &self.proxy.credentials) {
            (0, _) => self.send_request(),
            (2, Some(credentials)) => {
                let mut auth = vec![1, credentials.user.len() as u8];
                auth.extend_from_slice(credentials.user.as_bytes());
                auth.push(credentials.password.len() as u8);
                auth.extend_from_slice(credentials.password.as_bytes());
                self.send(auth, |this| this.read_exact(2, Self::on_auth));
            }
            _ => self.finish(Err(Error::AuthenticationNotSupported)),
        }
    }

    fn on_auth(self: &Rc<Self>, reply: Vec<u8>) {
        if reply[0] != 1 {
            self.finish(Err(Error::InvalidResponse));
        } else if reply[1] != 0 {
            self.finish(Err(Error::AuthenticationFailed));
        } else {
            self.send_request();
        }
    }

    fn send_request(self: &Rc<Self>) {
        let target = self.negotiation.borrow().target.clone();
        let request = match target.map(|t| connect_request(t.addr())) {
            Some(Ok(request)) => request,
            Some(Err(e)) => return self.finish(Err(e)),
            None => return self.finish(Err(Error::InvalidEndpoint("no target".into()))),
        };
        self.send(request, |this| this.read_exact(5, Self::on_reply_head));
    }

    fn on_reply_head(self: &Rc<Self>, head: Vec<u8>) {
        if head[0] != VERSION {
            self.finish(Err(Error::InvalidResponse));
            return;
        }
        if head[1] != 0 {
            self.finish(Err(Error::ConnectionFailed(head[1])));
            return;
        }
        // the fifth byte is the first of the bound address
        let remaining = match head[3] {
            1 => 4 - 1 + 2,
            4 => 16 - 1 + 2,
            3 => head[4] as usize + 2,
            _ => {
                self.finish(Err(Error::InvalidResponse));
                return;
            }
        };
        self.read_exact(remaining, |this, _| {
            log::debug!("[{}] socks5 tunnel through {} ready", this.session.id(), this.proxy.server);
            this.finish(Ok(()))
        });
    }
}

/// Client side of SOCKS5 over a leg connected to the proxy.
pub struct Socks5Flow {
    inner: Rc<ClientInner>,
}

impl Socks5Flow {
    pub fn new(next: Box<dyn RemoteDataFlow>, proxy: Socks5Proxy) -> Self {
        let session = next.session();
        Self {
            inner: Rc::new(ClientInner {
                next,
                session,
                proxy,
                fsm: FsmCell::new(Role::Remote),
                ops: Ops::default(),
                negotiation: RefCell::new(Negotiation {
                    handler: None,
                    target: None,
                    pending: Vec::new(),
                }),
            }),
        }
    }
}

impl Drop for Socks5Flow {
    fn drop(&mut self) {
        self.inner.ops.cancel_all();
    }
}

impl DataFlow for Socks5Flow {
    fn read(&self, buffer: Buffer, handler: DataHandler) -> CancelToken {
        relay::read(&self.inner, buffer, handler)
    }

    fn write(&self, buffer: Buffer, handler: EventHandler) -> CancelToken {
        relay::write(&self.inner, buffer, handler)
    }

    fn close_write(&self, handler: EventHandler) -> CancelToken {
        relay::close_write(&self.inner, handler)
    }

    fn state_machine(&self) -> FlowStateMachine {
        self.inner.fsm.get()
    }

    fn next_hop(&self) -> Option<&dyn DataFlow> {
        Some(self.inner.next.as_data_flow())
    }

    fn session(&self) -> Rc<Session> {
        self.inner.session.clone()
    }
}

impl RemoteDataFlow for Socks5Flow {
    fn connect(&self, endpoint: Rc<Endpoint>, handler: EventHandler) -> CancelToken {
        self.inner.fsm.update(|m| m.connect_begin());

        let token = CancelToken::new();
        {
            let mut negotiation = self.inner.negotiation.borrow_mut();
            negotiation.handler = Some(token.guard(handler));
            negotiation.target = Some(endpoint);
        }

        let server = Rc::new(Endpoint::new(self.inner.proxy.server.clone()));
        let weak = Rc::downgrade(&self.inner);
        self.inner.next.connect(
            server,
            Box::new(move |result: Result<()>| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok(()) => this.send_greeting(),
                    Err(e) => this.finish(Err(e)),
                }
            }),
        );
        token
    }

    fn connecting_to(&self) -> Option<Rc<Endpoint>> {
        self.inner.negotiation.borrow().target.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{
        mock::{capture, endpoint, local, settle, MockFlow, MockHandle},
        FlowState,
    };

    fn client(user: Option<&str>) -> (Socks5Flow, MockHandle) {
        let (mock, handle) = MockFlow::remote();
        let proxy = Socks5Proxy::new(&ProxyConfig {
            protocol: "socks5".into(),
            server: "127.0.0.1:1080".into(),
            user: user.map(str::to_string),
            password: user.map(|_| "secret".to_string()),
        })
        .unwrap();
        (Socks5Flow::new(Box::new(mock), proxy), handle)
    }

    #[tokio::test(start_paused = true)]
    async fn connects_through_proxy() {
        local(async {
            let (flow, server) = client(None);
            let (h, rx) = capture();
            flow.connect(endpoint("example.com:80"), h);
            settle().await;

            assert_eq!(server.connected_to().unwrap().to_string(), "127.0.0.1:1080");
            assert_eq!(server.writes(), vec![vec![5, 1, 0]]);

            server.push(&[5, 0]);
            settle().await;
            let mut request = vec![5, 1, 0, 3, 11];
            request.extend_from_slice(b"example.com");
            request.extend_from_slice(&[0, 80]);
            assert_eq!(server.writes()[1], request);

            // reply split across reads, followed by tunneled data
            server.push(&[5, 0, 0]);
            server.push(&[1, 10, 0, 0, 1, 0x1f, 0x90]);
            server.push(b"payload");
            rx.await.unwrap().unwrap();
            assert_eq!(flow.state_machine().state(), FlowState::Established);

            let (h, rx) = capture();
            flow.read(Buffer::empty(), h);
            assert_eq!(&rx.await.unwrap().unwrap()[..], b"payload");
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn authenticates_with_credentials() {
        local(async {
            let (flow, server) = client(Some("alice"));
            let (h, rx) = capture();
            flow.connect(endpoint("10.0.0.1:443"), h);
            settle().await;
            assert_eq!(server.writes(), vec![vec![5, 2, 0, 2]]);

            server.push(&[5, 2]);
            settle().await;
            assert_eq!(server.writes()[1], b"\x01\x05alice\x06secret".to_vec());

            server.push(&[1, 0]);
            settle().await;
            assert_eq!(server.writes()[2], vec![5, 1, 0, 1, 10, 0, 0, 1, 1, 187]);

            server.push(&[5, 0, 0, 4]);
            server.push(&[0; 18]);
            rx.await.unwrap().unwrap();
        })
        .await;
    }

    #[tokio::test]
    async fn surfaces_reply_errors() {
        local(async {
            let (flow, server) = client(None);
            let (h, rx) = capture();
            flow.connect(endpoint("10.0.0.1:443"), h);
            server.push(&[5, 0]);
            server.push(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0]);
            assert!(matches!(
                rx.await.unwrap().unwrap_err(),
                Error::ConnectionFailed(5)
            ));
            assert!(flow.state_machine().is_errored());
        })
        .await;
    }

    #[tokio::test]
    async fn rejects_bad_method_reply() {
        local(async {
            let (flow, server) = client(None);
            let (h, rx) = capture();
            flow.connect(endpoint("10.0.0.1:443"), h);
            server.push(&[4, 0]);
            assert!(matches!(
                rx.await.unwrap().unwrap_err(),
                Error::ServerVersionNotSupported
            ));

            let (flow, server) = client(None);
            let (h, rx) = capture();
            flow.connect(endpoint("10.0.0.1:443"), h);
            server.push(&[5, 2]);
            assert!(matches!(
                rx.await.unwrap().unwrap_err(),
                Error::AuthenticationNotSupported
            ));
        })
        .await;
    }
}
