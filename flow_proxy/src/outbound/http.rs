use crate::{
    config::ProxyConfig,
    flow::{
        relay::{self, take_front, Ops, Relayed, Tracked},
        DataFlow, DataHandler, EventHandler, FlowStateMachine, FsmCell, RemoteDataFlow, Role,
    },
    utils::{
        http::{HeadReader, ResponseHead},
        Buffer, CancelToken, Endpoint, Guarded, Session, SocketAddr,
    },
    Error, Result,
};

use std::{cell::RefCell, rc::Rc, str::FromStr};

use base64::Engine;

/// HTTP proxy settings shared by every session's client leg.
#[derive(Clone)]
pub struct HttpProxy {
    server: SocketAddr,
    auth: Option<String>,
}

impl HttpProxy {
    pub fn new(conf: &ProxyConfig) -> Result<Self> {
        let mut auth = None;
        if let Some(user) = conf.user.as_ref().filter(|u| !u.is_empty()) {
            let base64 = base64::engine::general_purpose::STANDARD;
            let password = conf.password.as_deref().unwrap_or("");
            auth = Some(base64.encode(format!("{}:{}", user, password)));
        }

        Ok(Self {
            server: SocketAddr::from_str(&conf.server)?,
            auth,
        })
    }

    pub fn server(&self) -> &SocketAddr {
        &self.server
    }

    fn connect_request(&self, target: &SocketAddr) -> Vec<u8> {
        let mut request = format!(
            "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n",
            target = target
        );
        if let Some(auth) = &self.auth {
            request.push_str("Proxy-Authorization: Basic ");
            request.push_str(auth);
            request.push_str("\r\n");
        }
        request.push_str("\r\n");
        request.into_bytes()
    }
}

struct Negotiation {
    handler: Option<Guarded<Result<()>>>,
    target: Option<Rc<Endpoint>>,
    reader: HeadReader,
    /// Tunneled bytes that arrived with the proxy's response.
    pending_payload: Vec<u8>,
}

struct ClientInner {
    next: Box<dyn RemoteDataFlow>,
    session: Rc<Session>,
    proxy: HttpProxy,
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

impl ClientInner {
    fn finish(&self, result: Result<()>) {
        match &result {
            Ok(()) => self.fsm.update(|m| m.connected()),
            Err(e) => {
                log::debug!(
                    "[{}] http connect through {} failed: {}",
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

    fn send_request(self: &Rc<Self>) {
        let target = self.negotiation.borrow().target.clone();
        let Some(target) = target else {
            self.finish(Err(Error::InvalidEndpoint("no target".into())));
            return;
        };

        let weak = Rc::downgrade(self);
        self.next.write(
            Buffer::from(self.proxy.connect_request(target.addr())),
            Box::new(move |result: Result<()>| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok(()) => this.read_response(),
                    Err(e) => this.finish(Err(e)),
                }
            }),
        );
    }

    fn read_response(self: &Rc<Self>) {
        let weak = Rc::downgrade(self);
        self.next.read(
            Buffer::empty(),
            Box::new(move |result: Result<Buffer>| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                match result.and_then(|buffer| this.on_response_data(&buffer)) {
                    Ok(true) => this.finish(Ok(())),
                    Ok(false) => this.read_response(),
                    Err(Error::Eof) => this.finish(Err(Error::InvalidResponse)),
                    Err(e) => this.finish(Err(e)),
                }
            }),
        );
    }

    fn on_response_data(&self, data: &[u8]) -> Result<bool> {
        let mut negotiation = self.negotiation.borrow_mut();
        let Some(raw) = negotiation.reader.feed(data)? else {
            return Ok(false);
        };

        let head = ResponseHead::parse(&raw)?;
        if head.code != 200 {
            return Err(Error::ConnectError(head.code));
        }

        negotiation.pending_payload = negotiation.reader.take_rest().to_vec();
        Ok(true)
    }
}

/// Client side of HTTP CONNECT over a leg connected to the proxy.
pub struct HttpConnectFlow {
    inner: Rc<ClientInner>,
}

impl HttpConnectFlow {
    pub fn new(next: Box<dyn RemoteDataFlow>, proxy: HttpProxy) -> Self {
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
                    reader: HeadReader::new(),
                    pending_payload: Vec::new(),
                }),
            }),
        }
    }

    pub fn has_pending_payload(&self) -> bool {
        !self.inner.negotiation.borrow().pending_payload.is_empty()
    }
}

impl Drop for HttpConnectFlow {
    fn drop(&mut self) {
        self.inner.ops.cancel_all();
    }
}

impl DataFlow for HttpConnectFlow {
    fn read(&self, buffer: Buffer, handler: DataHandler) -> CancelToken {
        let payload = {
            let mut negotiation = self.inner.negotiation.borrow_mut();
            let queued = &mut negotiation.pending_payload;
            (!queued.is_empty()).then(|| take_front(queued, buffer.len()))
        };
        let Some(payload) = payload else {
            return relay::read(&self.inner, buffer, handler);
        };

        self.inner.fsm.update(|m| {
            m.read_begin();
            m.read_end();
        });
        let token = CancelToken::new();
        token.guard(handler).post(Ok(Buffer::from(payload)));
        token
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

impl RemoteDataFlow for HttpConnectFlow {
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
                    Ok(()) => this.send_request(),
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
