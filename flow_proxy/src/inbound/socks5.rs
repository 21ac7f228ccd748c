use super::{reply_then_report, Negotiator};
use crate::{
    flow::{
        relay::{self, Ops, Relayed, Tracked},
        DataFlow, DataHandler, EventHandler, FlowStateMachine, FsmCell, LocalDataFlow, Role,
    },
    utils::{Buffer, CancelToken, Endpoint, Guarded, HostName, Session, SocketAddr},
    Error, Result,
};

use std::{
    cell::RefCell,
    net::{Ipv4Addr, Ipv6Addr},
    rc::Rc,
    str::FromStr,
};

/// Upper bound on buffered negotiation bytes.
pub const SOCKS5_BUFFER_SIZE: usize = 512;

const VERSION: u8 = 5;
const NO_AUTH: u8 = 0;
const CMD_CONNECT: u8 = 1;

/// Validates a client greeting. `Ok(false)` means more bytes are needed.
pub(crate) fn parse_greeting(buf: &[u8]) -> Result<bool> {
    match buf.first() {
        None => return Ok(false),
        Some(&VERSION) => {}
        Some(_) => return Err(Error::UnsupportedVersion),
    }
    let Some(&n) = buf.get(1) else {
        return Ok(false);
    };

    let expected = 2 + n as usize;
    if buf.len() < expected {
        return Ok(false);
    }
    if buf.len() > expected {
        return Err(Error::IllegalRequest);
    }
    if !buf[2..].contains(&NO_AUTH) {
        return Err(Error::UnsupportedAuthenticationMethod);
    }
    Ok(true)
}

/// Validates a CONNECT request. `Ok(None)` means more bytes are needed.
pub(crate) fn parse_request(buf: &[u8]) -> Result<Option<SocketAddr>> {
    if buf.len() < 4 {
        if buf.first().is_some_and(|v| *v != VERSION) {
            return Err(Error::UnsupportedVersion);
        }
        return Ok(None);
    }
    if buf[0] != VERSION {
        return Err(Error::UnsupportedVersion);
    }
    if buf[1] != CMD_CONNECT {
        return Err(Error::UnsupportedCommand);
    }
    if buf[2] != 0 {
        return Err(Error::IllegalRequest);
    }

    let expected = match buf[3] {
        1 => 4 + 4 + 2,
        3 => match buf.get(4) {
            Some(len) => 4 + 1 + *len as usize + 2,
            None => return Ok(None),
        },
        4 => 4 + 16 + 2,
        _ => return Err(Error::UnsupportedAddressType),
    };
    if buf.len() < expected {
        return Ok(None);
    }
    if buf.len() > expected {
        return Err(Error::IllegalRequest);
    }

    let port = u16::from_be_bytes([buf[expected - 2], buf[expected - 1]]);
    let hostname = match buf[3] {
        1 => {
            let octets: [u8; 4] = buf[4..8].try_into().map_err(|_| Error::IllegalRequest)?;
            HostName::V4(Ipv4Addr::from(octets))
        }
        4 => {
            let octets: [u8; 16] = buf[4..20].try_into().map_err(|_| Error::IllegalRequest)?;
            Ipv6Addr::from(octets).into()
        }
        _ => {
            let domain =
                std::str::from_utf8(&buf[5..expected - 2]).map_err(|_| Error::IllegalRequest)?;
            if domain.is_empty() {
                return Err(Error::IllegalRequest);
            }
            HostName::from_str(domain)
                .unwrap_or_else(|_| HostName::Domain(domain.to_ascii_lowercase()))
        }
    };
    Ok(Some(SocketAddr::new(hostname, port)))
}

/// Reply to a successful CONNECT, with a zeroed bound address of the
/// destination's family.
pub(crate) fn success_reply(destination: Option<&HostName>) -> Vec<u8> {
    match destination {
        Some(HostName::V6(_)) => {
            let mut reply = vec![0; 22];
            reply[..4].copy_from_slice(&[VERSION, 0, 0, 4]);
            reply
        }
        _ => vec![VERSION, 0, 0, 1, 0, 0, 0, 0, 0, 0],
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Greeting,
    Request,
    /// Destination known, waiting for `continue_open`.
    Connecting,
    Done,
}

struct Negotiation {
    phase: Phase,
    pending: Vec<u8>,
    handler: Option<Guarded<Result<()>>>,
}

struct ServerInner {
    next: Box<dyn LocalDataFlow>,
    session: Rc<Session>,
    fsm: FsmCell,
    ops: Ops,
    negotiation: RefCell<Negotiation>,
}

impl Tracked for ServerInner {
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

impl Relayed for ServerInner {
    fn next(&self) -> &dyn DataFlow {
        self.next.as_data_flow()
    }
}

impl Negotiator for ServerInner {
    fn client(&self) -> &dyn LocalDataFlow {
        &*self.next
    }
}

impl ServerInner {
    fn finish(&self, result: Result<()>) {
        match &result {
            Ok(()) => {}
            Err(e) => {
                log::debug!("[{}] socks5 negotiation failed: {}", self.session.id(), e);
                self.fsm.update(|m| m.errored());
            }
        }
        let handler = self.negotiation.borrow_mut().handler.take();
        if let Some(handler) = handler {
            handler.call(result);
        }
    }

    fn negotiate_read(self: &Rc<Self>) {
        let weak = Rc::downgrade(self);
        self.next.read(
            Buffer::new(SOCKS5_BUFFER_SIZE),
            Box::new(move |result: Result<Buffer>| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok(buffer) => this.on_negotiation_data(&buffer),
                    Err(Error::Eof) => {
                        let partial = !this.negotiation.borrow().pending.is_empty();
                        this.finish(Err(if partial {
                            Error::RequestIncomplete
                        } else {
                            Error::Eof
                        }));
                    }
                    Err(e) => this.finish(Err(e)),
                }
            }),
        );
    }

    fn on_negotiation_data(self: &Rc<Self>, data: &[u8]) {
        let mut negotiation = self.negotiation.borrow_mut();
        if negotiation.pending.len() + data.len() > SOCKS5_BUFFER_SIZE {
            drop(negotiation);
            self.finish(Err(Error::IllegalRequest));
            return;
        }
        negotiation.pending.extend_from_slice(data);

        let phase = negotiation.phase;
        match phase {
            Phase::Greeting => match parse_greeting(&negotiation.pending) {
                Ok(false) => {
                    drop(negotiation);
                    self.negotiate_read();
                }
                Ok(true) => {
                    negotiation.pending.clear();
                    drop(negotiation);
                    self.reply_greeting();
                }
                Err(e) => {
                    drop(negotiation);
                    self.finish(Err(e));
                }
            },
            Phase::Request => match parse_request(&negotiation.pending) {
                Ok(None) => {
                    drop(negotiation);
                    self.negotiate_read();
                }
                Ok(Some(addr)) => {
                    negotiation.pending.clear();
                    negotiation.phase = Phase::Connecting;
                    drop(negotiation);
                    log::info!("[{}] socks5 connect {}", self.session.id(), addr);
                    self.session.set_endpoint(Endpoint::new(addr));
                    self.finish(Ok(()));
                }
                Err(e) => {
                    drop(negotiation);
                    self.finish(Err(e));
                }
            },
            Phase::Connecting | Phase::Done => {}
        }
    }

    fn reply_greeting(self: &Rc<Self>) {
        let weak = Rc::downgrade(self);
        self.next.write(
            Buffer::from(&[VERSION, NO_AUTH]),
            Box::new(move |result: Result<()>| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok(()) => {
                        this.negotiation.borrow_mut().phase = Phase::Request;
                        this.negotiate_read();
                    }
                    Err(e) => this.finish(Err(e)),
                }
            }),
        );
    }
}

/// Server side of SOCKS5: learns the destination from the client, then
/// relays once the remote chain is connected.
pub struct Socks5ServerFlow {
    inner: Rc<ServerInner>,
}

impl Socks5ServerFlow {
    pub fn new(next: Box<dyn LocalDataFlow>) -> Self {
        let session = next.session();
        Self {
            inner: Rc::new(ServerInner {
                next,
                session,
                fsm: FsmCell::new(Role::Local),
                ops: Ops::default(),
                negotiation: RefCell::new(Negotiation {
                    phase: Phase::Greeting,
                    pending: Vec::new(),
                    handler: None,
                }),
            }),
        }
    }
}

impl Drop for Socks5ServerFlow {
    fn drop(&mut self) {
        self.inner.ops.cancel_all();
    }
}

impl DataFlow for Socks5ServerFlow {
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

impl LocalDataFlow for Socks5ServerFlow {
    fn open(&self, handler: EventHandler) -> CancelToken {
        self.inner.fsm.update(|m| m.connect_begin());

        let token = CancelToken::new();
        self.inner.negotiation.borrow_mut().handler = Some(token.guard(handler));

        let weak = Rc::downgrade(&self.inner);
        self.inner.next.open(Box::new(move |result: Result<()>| {
            let Some(this) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(()) => this.negotiate_read(),
                Err(e) => this.finish(Err(e)),
            }
        }));
        token
    }

    fn continue_open(&self, handler: EventHandler) -> CancelToken {
        let token = CancelToken::new();
        self.inner.negotiation.borrow_mut().handler = Some(token.guard(handler));

        let endpoint = self.inner.session.endpoint();
        let reply = success_reply(endpoint.as_ref().map(|e| e.hostname()));

        let weak = Rc::downgrade(&self.inner);
        self.inner.next.write(
            Buffer::from(reply),
            Box::new(move |result: Result<()>| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = result {
                    this.finish(Err(e));
                    return;
                }

                let weak = Rc::downgrade(&this);
                this.next.continue_open(Box::new(move |result: Result<()>| {
                    let Some(this) = weak.upgrade() else {
                        return;
                    };
                    if result.is_ok() {
                        this.negotiation.borrow_mut().phase = Phase::Done;
                        this.fsm.update(|m| m.connected());
                    }
                    this.finish(result);
                }));
            }),
        );
        token
    }

    fn report_error(&self, error: &Error, handler: EventHandler) -> CancelToken {
        let token = CancelToken::new();
        let phase = self.inner.negotiation.borrow().phase;
        self.inner.ops.cancel_all();
        self.inner.fsm.update(|m| m.closed());

        // only a client waiting on its CONNECT reply is told why
        let reply = (phase == Phase::Connecting)
            .then(|| vec![VERSION, error.socks_reply_code(), 0, 1, 0, 0, 0, 0, 0, 0]);
        reply_then_report(&self.inner, reply, error, token.guard(handler));
        token
    }
}
