//! Pumps bytes between plaintext callers, a [`TlsEngine`] and the encrypted
//! next hop.

use super::tls_engine::{HandshakeAction, Plaintext, TlsEngine};
use crate::{
    flow::{
        relay::{finish_read, finish_write, Ops, Tracked},
        DataFlow, DataHandler, EventHandler, FlowStateMachine, FsmCell, RemoteDataFlow, Role,
        DEFAULT_READ_SIZE,
    },
    utils::{Buffer, CancelToken, Endpoint, Guarded, Session},
    Error, Result,
};

use std::{cell::RefCell, rc::Rc};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Handshaking,
    Established,
}

struct PendingRead {
    cap: usize,
    handler: Guarded<Result<Buffer>>,
}

struct PendingWrite {
    data: Buffer,
    fed: usize,
    handler: Guarded<Result<()>>,
}

struct Pump {
    engine: Box<dyn TlsEngine>,
    phase: Phase,
    connect: Option<Guarded<Result<()>>>,
    read: Option<PendingRead>,
    write: Option<PendingWrite>,
    close: Option<Guarded<Result<()>>>,
    /// Ciphertext not yet handed to the next hop.
    outgoing: Vec<u8>,
    inner_reading: bool,
    inner_writing: bool,
    inner_eof: bool,
    failed: bool,
}

struct TlsInner {
    next: Box<dyn RemoteDataFlow>,
    session: Rc<Session>,
    fsm: FsmCell,
    ops: Ops,
    pump: RefCell<Pump>,
    target: RefCell<Option<Rc<Endpoint>>>,
}

impl Tracked for TlsInner {
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

impl TlsInner {
    fn drive(self: &Rc<Self>) {
        if let Err(e) = self.step() {
            self.fail(e);
        }
    }

    fn step(self: &Rc<Self>) -> Result<()> {
        let mut guard = self.pump.borrow_mut();
        let pump = &mut *guard;
        if pump.failed {
            return Ok(());
        }

        match pump.phase {
            Phase::Idle | Phase::Connecting => return Ok(()),
            Phase::Handshaking => {
                let action = pump.engine.handshake()?;
                pump.outgoing.extend(pump.engine.take_ciphertext()?);

                let idle = pump.outgoing.is_empty() && !pump.inner_writing;
                match action {
                    HandshakeAction::Done if idle => {
                        pump.phase = Phase::Established;
                        let handler = pump.connect.take();
                        drop(guard);
                        log::debug!("[{}] tls handshake finished", self.session.id());
                        self.fsm.update(|m| m.connected());
                        if let Some(handler) = handler {
                            handler.post(Ok(()));
                        }
                        return self.step();
                    }
                    HandshakeAction::WantIo if idle && !pump.inner_reading => {
                        if pump.inner_eof {
                            return Err(Error::Tls("connection closed during handshake".into()));
                        }
                        self.inner_read(pump);
                    }
                    _ => {}
                }
            }
            Phase::Established => {
                if let Some(cap) = pump.read.as_ref().map(|r| r.cap) {
                    match pump.engine.take_plaintext(cap)? {
                        Plaintext::Data(data) => self.complete_read(pump, Ok(Buffer::from(data))),
                        Plaintext::Closed => self.complete_read(pump, Err(Error::Eof)),
                        Plaintext::WantRead if pump.inner_eof => {
                            self.complete_read(pump, Err(Error::Eof))
                        }
                        Plaintext::WantRead if !pump.inner_reading => self.inner_read(pump),
                        Plaintext::WantRead => {}
                    }
                }

                if let Some(write) = pump.write.as_mut() {
                    while write.fed < write.data.len() {
                        let n = pump.engine.write_plaintext(&write.data[write.fed..])?;
                        write.fed += n;
                        pump.outgoing.extend(pump.engine.take_ciphertext()?);
                        if n == 0 {
                            // engine is full until its ciphertext is sent
                            break;
                        }
                    }
                }
                pump.outgoing.extend(pump.engine.take_ciphertext()?);
            }
        }

        if !pump.outgoing.is_empty() && !pump.inner_writing {
            self.inner_write(pump);
        }
        if pump.phase != Phase::Established || pump.inner_writing {
            return Ok(());
        }

        let written = pump
            .write
            .as_ref()
            .is_some_and(|w| w.fed == w.data.len());
        if written {
            if let Some(write) = pump.write.take() {
                let result = Ok(());
                finish_write(&**self, &result);
                write.handler.post(result);
            }
        }

        if pump.write.is_none() {
            if let Some(handler) = pump.close.take() {
                self.inner_close(handler);
            }
        }
        Ok(())
    }

    fn complete_read(&self, pump: &mut Pump, result: Result<Buffer>) {
        if let Some(read) = pump.read.take() {
            finish_read(self, &result);
            read.handler.post(result);
        }
    }

    fn inner_read(self: &Rc<Self>, pump: &mut Pump) {
        pump.inner_reading = true;
        let weak = Rc::downgrade(self);
        self.next.read(
            Buffer::empty(),
            Box::new(move |result: Result<Buffer>| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                let fed = {
                    let mut pump = this.pump.borrow_mut();
                    pump.inner_reading = false;
                    match result {
                        Ok(data) => pump.engine.feed_ciphertext(&data),
                        Err(Error::Eof) => {
                            pump.inner_eof = true;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                };
                match fed {
                    Ok(()) => this.drive(),
                    Err(e) => this.fail(e),
                }
            }),
        );
    }

    fn inner_write(self: &Rc<Self>, pump: &mut Pump) {
        pump.inner_writing = true;
        let data = std::mem::take(&mut pump.outgoing);
        let weak = Rc::downgrade(self);
        self.next.write(
            Buffer::from(data),
            Box::new(move |result: Result<()>| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                this.pump.borrow_mut().inner_writing = false;
                match result {
                    Ok(()) => this.drive(),
                    Err(e) => this.fail(e),
                }
            }),
        );
    }

    fn inner_close(self: &Rc<Self>, handler: Guarded<Result<()>>) {
        let weak = Rc::downgrade(self);
        self.next.close_write(Box::new(move |result: Result<()>| {
            let Some(this) = weak.upgrade() else {
                return;
            };
            match &result {
                Ok(()) => this.fsm.update(|m| m.write_close_end()),
                Err(_) => this.fsm.update(|m| m.errored()),
            }
            drop(this);
            handler.call(result);
        }));
    }

    /// Reports `error` once, to the pending connect, else read, else write.
    fn fail(&self, error: Error) {
        let mut pump = self.pump.borrow_mut();
        if pump.failed {
            return;
        }
        pump.failed = true;
        let connect = pump.connect.take();
        let read = pump.read.take();
        let write = pump.write.take();
        let close = pump.close.take();
        drop(pump);

        log::debug!("[{}] tls failed: {}", self.session.id(), error);
        self.fsm.update(|m| m.errored());

        if let Some(handler) = connect {
            handler.post(Err(error));
        } else if let Some(read) = read {
            read.handler.post(Err(error));
        } else if let Some(write) = write {
            write.handler.post(Err(error));
        } else if let Some(handler) = close {
            handler.post(Err(error));
        }
    }
}

/// TLS client leg. Reads and writes plaintext; its next hop carries ciphertext.
pub struct TlsFlow {
    inner: Rc<TlsInner>,
}

impl TlsFlow {
    pub fn new(next: Box<dyn RemoteDataFlow>, engine: Box<dyn TlsEngine>) -> Self {
        let session = next.session();
        Self {
            inner: Rc::new(TlsInner {
                next,
                session,
                fsm: FsmCell::new(Role::Remote),
                ops: Ops::default(),
                pump: RefCell::new(Pump {
                    engine,
                    phase: Phase::Idle,
                    connect: None,
                    read: None,
                    write: None,
                    close: None,
                    outgoing: Vec::new(),
                    inner_reading: false,
                    inner_writing: false,
                    inner_eof: false,
                    failed: false,
                }),
                target: RefCell::new(None),
            }),
        }
    }
}

impl Drop for TlsFlow {
    fn drop(&mut self) {
        self.inner.ops.cancel_all();
    }
}

impl DataFlow for TlsFlow {
    fn read(&self, buffer: Buffer, handler: DataHandler) -> CancelToken {
        self.inner.fsm.update(|m| m.read_begin());
        let token = CancelToken::new();
        self.inner.ops.set_read(&token);

        let cap = if buffer.is_empty() {
            DEFAULT_READ_SIZE
        } else {
            buffer.len()
        };
        self.inner.pump.borrow_mut().read = Some(PendingRead {
            cap,
            handler: token.guard(handler),
        });
        self.inner.drive();
        token
    }

    fn write(&self, buffer: Buffer, handler: EventHandler) -> CancelToken {
        self.inner.fsm.update(|m| m.write_begin());
        let token = CancelToken::new();
        self.inner.ops.set_write(&token);

        self.inner.pump.borrow_mut().write = Some(PendingWrite {
            data: buffer,
            fed: 0,
            handler: token.guard(handler),
        });
        self.inner.drive();
        token
    }

    fn close_write(&self, handler: EventHandler) -> CancelToken {
        self.inner.fsm.update(|m| m.write_close_begin());
        self.inner.ops.cancel_write();
        let token = CancelToken::new();
        self.inner.ops.set_write(&token);

        {
            let mut pump = self.inner.pump.borrow_mut();
            pump.write = None;
            pump.engine.send_close_notify();
            pump.close = Some(token.guard(handler));
        }
        self.inner.drive();
        token
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

impl RemoteDataFlow for TlsFlow {
    fn connect(&self, endpoint: Rc<Endpoint>, handler: EventHandler) -> CancelToken {
        self.inner.fsm.update(|m| m.connect_begin());
        self.inner.target.replace(Some(endpoint.clone()));

        let token = CancelToken::new();
        let handler = token.guard(handler);
        {
            let mut pump = self.inner.pump.borrow_mut();
            if let Err(e) = pump.engine.set_server_name(endpoint.hostname()) {
                drop(pump);
                self.inner.fsm.update(|m| m.errored());
                handler.post(Err(e));
                return token;
            }
            pump.connect = Some(handler);
            pump.phase = Phase::Connecting;
        }

        let weak = Rc::downgrade(&self.inner);
        self.inner.next.connect(
            endpoint,
            Box::new(move |result: Result<()>| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok(()) => {
                        this.pump.borrow_mut().phase = Phase::Handshaking;
                        this.drive();
                    }
                    Err(e) => this.fail(e),
                }
            }),
        );
        token
    }

    fn connecting_to(&self) -> Option<Rc<Endpoint>> {
        self.inner.target.borrow().clone()
    }
}
