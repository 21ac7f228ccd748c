use super::{reply_then_report, Negotiator};
use crate::{
    flow::{
        relay::{self, finish_read, take_front, Ops, Relayed, Tracked},
        DataFlow, DataHandler, EventHandler, FlowStateMachine, FsmCell, LocalDataFlow, Role,
    },
    utils::{
        http::{HeadReader, RequestHead, RequestStream},
        Buffer, CancelToken, Endpoint, Guarded, ParsedUri, Session, SocketAddr,
    },
    Error, Result,
};

use std::{cell::RefCell, rc::Rc};

use base64::Engine;

pub const CONNECT_RESPONSE: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_GATEWAY_RESPONSE: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Turns a proxy request head into an origin request head and returns where it goes.
pub(crate) fn rewrite_request(head: &mut RequestHead) -> Result<SocketAddr> {
    let uri = ParsedUri::parse(&head.target)?;

    let destination = match uri.hostname() {
        Some(hostname) => {
            let port = uri.port_or_default().ok_or(Error::InvalidRequest)?;
            if head.header("host").is_none() {
                let mut host = hostname.to_string_url_style();
                if uri.port.is_some_and(|p| Some(p) != default_port(uri.scheme())) {
                    host.push(':');
                    host.push_str(&port.to_string());
                }
                head.set_header("Host", host);
            }
            if head.header("authorization").is_none() {
                if let Some(user) = &uri.user {
                    let base64 = base64::engine::general_purpose::STANDARD;
                    let credentials = format!("{}:{}", user, uri.password.as_deref().unwrap_or(""));
                    head.set_header("Authorization", format!("Basic {}", base64.encode(credentials)));
                }
            }
            SocketAddr::new(hostname.clone(), port)
        }
        None => {
            let host = head.header_str("host").ok_or(Error::InvalidRequest)?;
            let (hostname, port) = SocketAddr::parse_host_header(host)?;
            SocketAddr::new(hostname, port.unwrap_or(80))
        }
    };

    head.target = uri.origin_form();
    head.remove_header("proxy-authorization");
    head.rename_header("proxy-connection", "Connection");
    Ok(destination)
}

fn default_port(scheme: Option<&str>) -> Option<u16> {
    match scheme? {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

fn connect_target(head: &RequestHead) -> Result<SocketAddr> {
    let (hostname, port) =
        SocketAddr::parse_host_header(&head.target).map_err(|_| Error::InvalidRequest)?;
    Ok(SocketAddr::new(hostname, port.unwrap_or(443)))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    ReadingHead,
    Connecting,
    Done,
}

enum Mode {
    Undecided,
    Connect,
    Plain {
        /// Rewritten bytes not yet handed to a reader.
        queued: Vec<u8>,
        stream: RequestStream,
    },
}

struct Negotiation {
    phase: Phase,
    mode: Mode,
    reader: HeadReader,
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
        if let Err(e) = &result {
            log::debug!("[{}] http negotiation failed: {}", self.session.id(), e);
            self.fsm.update(|m| m.errored());
        }
        let handler = self.negotiation.borrow_mut().handler.take();
        if let Some(handler) = handler {
            handler.call(result);
        }
    }

    fn negotiate_read(self: &Rc<Self>) {
        let weak = Rc::downgrade(self);
        self.next.read(
            Buffer::empty(),
            Box::new(move |result: Result<Buffer>| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                match result.and_then(|buffer| this.on_negotiation_data(&buffer)) {
                    Ok(true) => this.finish(Ok(())),
                    Ok(false) => this.negotiate_read(),
                    Err(Error::Eof) => this.finish(Err(Error::InvalidRequest)),
                    Err(e) => this.finish(Err(e)),
                }
            }),
        );
    }

    /// Returns whether the first request is complete.
    fn on_negotiation_data(&self, data: &[u8]) -> Result<bool> {
        let mut negotiation = self.negotiation.borrow_mut();
        let Some(raw) = negotiation.reader.feed(data)? else {
            return Ok(false);
        };
        let rest = negotiation.reader.take_rest();
        let mut head = RequestHead::parse(&raw)?;

        let destination = if head.is_connect() {
            if !rest.is_empty() {
                return Err(Error::DataBeforeConnectRequestFinish);
            }
            negotiation.mode = Mode::Connect;
            connect_target(&head)?
        } else {
            let destination = rewrite_request(&mut head)?;
            let mut stream = RequestStream::after_head(&head);
            let mut replay = head.to_bytes();
            let session = self.session.id();
            replay.extend(stream.feed(&rest, |next| check_followup(session, &destination, next))?);
            negotiation.mode = Mode::Plain {
                queued: replay,
                stream,
            };
            destination
        };

        log::info!(
            "[{}] http {} {}",
            self.session.id(),
            head.method,
            destination
        );
        negotiation.phase = Phase::Connecting;
        self.session.set_endpoint(Endpoint::new(destination));
        Ok(true)
    }

    fn plain_read(self: &Rc<Self>, max: usize, handler: Guarded<Result<Buffer>>) {
        let weak = Rc::downgrade(self);
        self.next.read(
            Buffer::empty(),
            Box::new(move |result: Result<Buffer>| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                let result = result
                    .and_then(|buffer| this.rewrite(&buffer))
                    .map(|out| this.dequeue(out, max));
                match result {
                    // a partial head produces nothing yet
                    Ok(out) if out.is_empty() => this.plain_read(max, handler),
                    result => {
                        let result = result.map(Buffer::from);
                        finish_read(&*this, &result);
                        drop(this);
                        handler.call(result);
                    }
                }
            }),
        );
    }

    /// Queues `out` behind earlier leftovers and takes up to `max` bytes.
    fn dequeue(&self, out: Vec<u8>, max: usize) -> Vec<u8> {
        match &mut self.negotiation.borrow_mut().mode {
            Mode::Plain { queued, .. } => {
                queued.extend(out);
                take_front(queued, max)
            }
            Mode::Connect | Mode::Undecided => out,
        }
    }

    fn rewrite(&self, data: &[u8]) -> Result<Vec<u8>> {
        let destination = self.session.endpoint().map(|e| e.addr().clone());
        let session = self.session.id();
        let mut negotiation = self.negotiation.borrow_mut();
        match (&mut negotiation.mode, destination) {
            (Mode::Plain { stream, .. }, Some(destination)) => {
                stream.feed(data, |head| check_followup(session, &destination, head))
            }
            _ => Ok(data.to_vec()),
        }
    }
}

/// Rewrites a later request on a kept-alive connection. The tunnel is already
/// bound to one destination, so requests for another host are forwarded there anyway.
fn check_followup(session: u64, destination: &SocketAddr, head: &mut RequestHead) -> Result<()> {
    let next = rewrite_request(head)?;
    if &next != destination {
        log::warn!(
            "[{}] request for {} sent on connection to {}",
            session,
            next,
            destination
        );
    }
    Ok(())
}

/// Server side of an HTTP proxy, accepting both CONNECT and plain
/// absolute-form requests.
pub struct HttpServerFlow {
    inner: Rc<ServerInner>,
}

impl HttpServerFlow {
    pub fn new(next: Box<dyn LocalDataFlow>) -> Self {
        let session = next.session();
        Self {
            inner: Rc::new(ServerInner {
                next,
                session,
                fsm: FsmCell::new(Role::Local),
                ops: Ops::default(),
                negotiation: RefCell::new(Negotiation {
                    phase: Phase::ReadingHead,
                    mode: Mode::Undecided,
                    reader: HeadReader::new(),
                    handler: None,
                }),
            }),
        }
    }

    pub fn is_connect(&self) -> bool {
        matches!(self.inner.negotiation.borrow().mode, Mode::Connect)
    }
}

impl Drop for HttpServerFlow {
    fn drop(&mut self) {
        self.inner.ops.cancel_all();
    }
}

impl DataFlow for HttpServerFlow {
    fn read(&self, buffer: Buffer, handler: DataHandler) -> CancelToken {
        let max = buffer.len();
        let ready = match &mut self.inner.negotiation.borrow_mut().mode {
            Mode::Plain { queued, .. } => Some(take_front(queued, max)),
            Mode::Connect | Mode::Undecided => None,
        };
        let Some(ready) = ready else {
            return relay::read(&self.inner, buffer, handler);
        };

        self.inner.fsm.update(|m| m.read_begin());
        let token = CancelToken::new();
        self.inner.ops.set_read(&token);
        let handler = token.guard(handler);
        if ready.is_empty() {
            self.inner.plain_read(max, handler);
        } else {
            self.inner.fsm.update(|m| m.read_end());
            handler.post(Ok(Buffer::from(ready)));
        }
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

impl LocalDataFlow for HttpServerFlow {
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

        let proceed = |this: Rc<ServerInner>| {
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
        };

        if !self.is_connect() {
            proceed(self.inner.clone());
            return token;
        }

        let weak = Rc::downgrade(&self.inner);
        self.inner.next.write(
            Buffer::from(CONNECT_RESPONSE),
            Box::new(move |result: Result<()>| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok(()) => proceed(this),
                    Err(e) => this.finish(Err(e)),
                }
            }),
        );
        token
    }

    fn report_error(&self, error: &Error, handler: EventHandler) -> CancelToken {
        let token = CancelToken::new();
        let phase = self.inner.negotiation.borrow().phase;
        self.inner.ops.cancel_all();
        self.inner.fsm.update(|m| m.closed());

        let reply = (phase == Phase::Connecting).then(|| BAD_GATEWAY_RESPONSE.to_vec());
        reply_then_report(&self.inner, reply, error, token.guard(handler));
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{
        mock::{capture, local, settle, MockFlow, MockHandle},
        FlowState,
    };

    fn server() -> (HttpServerFlow, MockHandle) {
        let (mock, handle) = MockFlow::new(Role::Local, Session::new());
        (HttpServerFlow::new(Box::new(mock)), handle)
    }

    async fn read_all(flow: &HttpServerFlow) -> Vec<u8> {
        let (h, rx) = capture();
        flow.read(Buffer::empty(), h);
        rx.await.unwrap().unwrap().into_vec()
    }

    #[tokio::test]
    async fn connect_request() {
        local(async {
            let (flow, client) = server();
            let (h, rx) = capture();
            flow.open(h);
            client.push(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n");
            settle().await;
            client.push(b"\r\n");
            rx.await.unwrap().unwrap();

            assert!(flow.is_connect());
            assert_eq!(
                flow.session().endpoint().unwrap().to_string(),
                "example.com:443"
            );
            assert_eq!(flow.state_machine().state(), FlowState::Establishing);

            let (h, rx) = capture();
            flow.continue_open(h);
            rx.await.unwrap().unwrap();
            assert_eq!(client.written(), CONNECT_RESPONSE.to_vec());
            assert_eq!(flow.state_machine().state(), FlowState::Established);

            client.push(b"\x16\x03\x01");
            assert_eq!(read_all(&flow).await, b"\x16\x03\x01".to_vec());
        })
        .await;
    }

    #[tokio::test]
    async fn data_before_connect_finishes() {
        local(async {
            let (flow, client) = server();
            let (h, rx) = capture();
            flow.open(h);
            client.push(b"CONNECT example.com:443 HTTP/1.1\r\n\r\nearly");
            let err = rx.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::DataBeforeConnectRequestFinish));
        })
        .await;
    }

    #[tokio::test]
    async fn plain_request_is_rewritten_and_replayed() {
        local(async {
            let (flow, client) = server();
            let (h, rx) = capture();
            flow.open(h);
            client.push(
                b"GET http://example.com/index.html HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\nProxy-Authorization: Basic Zm9vOmJhcg==\r\n\r\n",
            );
            rx.await.unwrap().unwrap();
            assert!(!flow.is_connect());
            assert_eq!(flow.session().endpoint().unwrap().to_string(), "example.com:80");

            let (h, rx) = capture();
            flow.continue_open(h);
            rx.await.unwrap().unwrap();
            // no CONNECT reply in plain mode
            assert!(client.written().is_empty());

            assert_eq!(
                read_all(&flow).await,
                b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nConnection: keep-alive\r\n\r\n"
                    .to_vec()
            );

            // a second request on the same connection, split mid-head
            client.push(b"POST http://example.com/form HTTP/1.1\r\nContent-Le");
            client.push(b"ngth: 3\r\n\r\nabc");
            assert_eq!(
                read_all(&flow).await,
                b"POST /form HTTP/1.1\r\nContent-Length: 3\r\nHost: example.com\r\n\r\nabc"
                    .to_vec()
            );
        })
        .await;
    }

    #[tokio::test]
    async fn plain_reads_honor_the_buffer_size() {
        local(async {
            let (flow, client) = server();
            let (h, rx) = capture();
            flow.open(h);
            client.push(b"GET http://example.com/a HTTP/1.1\r\n\r\n");
            rx.await.unwrap().unwrap();
            let (h, rx) = capture();
            flow.continue_open(h);
            rx.await.unwrap().unwrap();

            let expected = b"GET /a HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec();
            let mut got = Vec::new();
            while got.len() < expected.len() {
                let (h, rx) = capture();
                flow.read(Buffer::new(8), h);
                let chunk = rx.await.unwrap().unwrap();
                assert!(!chunk.is_empty() && chunk.len() <= 8);
                got.extend_from_slice(&chunk);
            }
            assert_eq!(got, expected);
            assert!(!client.has_pending_read());

            // a rewritten follow-up is also handed out in pieces
            client.push(b"GET http://example.com/b HTTP/1.1\r\n\r\n");
            let (h, rx) = capture();
            flow.read(Buffer::new(8), h);
            assert_eq!(&rx.await.unwrap().unwrap()[..], b"GET /b H");
            assert_eq!(
                read_all(&flow).await,
                b"TTP/1.1\r\nHost: example.com\r\n\r\n".to_vec()
            );
        })
        .await;
    }

    #[tokio::test]
    async fn origin_form_uses_host_header() {
        local(async {
            let (flow, client) = server();
            let (h, rx) = capture();
            flow.open(h);
            client.push(b"GET /a?b=c HTTP/1.1\r\nHost: [::1]:8080\r\n\r\n");
            rx.await.unwrap().unwrap();
            assert_eq!(flow.session().endpoint().unwrap().to_string(), "[::1]:8080");
        })
        .await;
    }

    #[tokio::test]
    async fn missing_destination_is_invalid() {
        local(async {
            let (flow, client) = server();
            let (h, rx) = capture();
            flow.open(h);
            client.push(b"GET / HTTP/1.1\r\n\r\n");
            assert!(matches!(
                rx.await.unwrap().unwrap_err(),
                Error::InvalidRequest
            ));
        })
        .await;
    }

    #[tokio::test]
    async fn bad_gateway_after_failed_connect() {
        local(async {
            let (flow, client) = server();
            let (h, rx) = capture();
            flow.open(h);
            client.push(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n");
            rx.await.unwrap().unwrap();

            let (h, rx) = capture();
            flow.report_error(&Error::Resolve("example.com".into()), h);
            rx.await.unwrap().unwrap();
            assert!(client.written().starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));
            assert!(client.reported().is_some());
        })
        .await;
    }

    #[test]
    fn rewrite_adds_host_and_credentials() {
        let mut head =
            RequestHead::parse(b"GET http://user:pw@example.com:8080/x HTTP/1.1\r\n\r\n").unwrap();
        let destination = rewrite_request(&mut head).unwrap();
        assert_eq!(destination.to_string(), "example.com:8080");
        assert_eq!(head.target, "/x");
        assert_eq!(head.header_str("host"), Some("example.com:8080"));
        assert_eq!(head.header_str("authorization"), Some("Basic dXNlcjpwdw=="));
    }
}
