//! Scripted in-memory leg and helpers for driving legs in tests.

use crate::{
    flow::{
        DataFlow, DataHandler, EventHandler, FlowStateMachine, FsmCell, LocalDataFlow,
        RemoteDataFlow, Role, DEFAULT_READ_SIZE,
    },
    utils::{Buffer, CancelToken, Endpoint, Guarded, Session},
    Error, Result,
};

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    future::Future,
    rc::Rc,
    time::Duration,
};

use tokio::sync::oneshot;

pub(crate) async fn local<F: Future>(f: F) -> F::Output {
    tokio::task::LocalSet::new().run_until(f).await
}

/// Lets every ready local task run.
pub(crate) async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// A boxed handler that forwards its result into a channel.
pub(crate) fn capture<T: 'static>() -> (Box<dyn FnOnce(T)>, oneshot::Receiver<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Box::new(move |v: T| {
            let _ = tx.send(v);
        }),
        rx,
    )
}

#[derive(Default)]
struct Script {
    incoming: VecDeque<Result<Vec<u8>>>,
    pending_read: Option<(usize, Guarded<Result<Buffer>>)>,
    writes: Vec<Vec<u8>>,
    write_closed: bool,
    fail_writes: Option<Error>,
    hold_writes: bool,
    held_writes: Vec<Guarded<Result<()>>>,
    connect_results: VecDeque<(Duration, Result<()>)>,
    connects: usize,
    connected_to: Option<Rc<Endpoint>>,
    reported: Option<Error>,
}

struct MockInner {
    session: Rc<Session>,
    fsm: FsmCell,
    script: RefCell<Script>,
}

/// A leg whose inbound bytes and connect outcomes are scripted by a [`MockHandle`].
pub(crate) struct MockFlow {
    inner: Rc<MockInner>,
}

#[derive(Clone)]
pub(crate) struct MockHandle {
    inner: Rc<MockInner>,
}

impl MockFlow {
    pub fn new(role: Role, session: Rc<Session>) -> (Self, MockHandle) {
        let inner = Rc::new(MockInner {
            session,
            fsm: FsmCell::new(role),
            script: RefCell::default(),
        });
        (
            Self {
                inner: inner.clone(),
            },
            MockHandle { inner },
        )
    }

    pub fn remote() -> (Self, MockHandle) {
        Self::new(Role::Remote, Session::new())
    }
}

impl MockHandle {
    pub fn push(&self, bytes: &[u8]) {
        self.push_result(Ok(bytes.to_vec()));
    }

    pub fn push_eof(&self) {
        self.push_result(Err(Error::Eof));
    }

    pub fn push_error(&self, error: Error) {
        self.push_result(Err(error));
    }

    fn push_result(&self, result: Result<Vec<u8>>) {
        self.inner.script.borrow_mut().incoming.push_back(result);
        self.inner.serve_read();
    }

    pub fn written(&self) -> Vec<u8> {
        self.inner.script.borrow().writes.concat()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.inner.script.borrow().writes.clone()
    }

    pub fn clear_written(&self) {
        self.inner.script.borrow_mut().writes.clear();
    }

    pub fn is_write_closed(&self) -> bool {
        self.inner.script.borrow().write_closed
    }

    pub fn has_pending_read(&self) -> bool {
        self.inner.script.borrow().pending_read.is_some()
    }

    /// Leaves later writes pending until [`MockHandle::release_writes`].
    pub fn hold_writes(&self) {
        self.inner.script.borrow_mut().hold_writes = true;
    }

    pub fn release_writes(&self) {
        let held = {
            let mut script = self.inner.script.borrow_mut();
            script.hold_writes = false;
            std::mem::take(&mut script.held_writes)
        };
        for handler in held {
            handler.post(Ok(()));
        }
    }

    pub fn fail_writes(&self, error: Error) {
        self.inner.script.borrow_mut().fail_writes = Some(error);
    }

    pub fn connect_result(&self, delay: Duration, result: Result<()>) {
        self.inner
            .script
            .borrow_mut()
            .connect_results
            .push_back((delay, result));
    }

    pub fn connects(&self) -> usize {
        self.inner.script.borrow().connects
    }

    pub fn connected_to(&self) -> Option<Rc<Endpoint>> {
        self.inner.script.borrow().connected_to.clone()
    }

    pub fn reported(&self) -> Option<Error> {
        self.inner.script.borrow().reported.clone()
    }

    pub fn state_machine(&self) -> FlowStateMachine {
        self.inner.fsm.get()
    }
}

impl MockInner {
    fn serve_read(&self) {
        let mut script = self.script.borrow_mut();
        if script.pending_read.is_none() || script.incoming.is_empty() {
            return;
        }
        let Some((cap, handler)) = script.pending_read.take() else {
            return;
        };
        let result = match script.incoming.pop_front() {
            Some(Ok(mut bytes)) => {
                if bytes.len() > cap {
                    let rest = bytes.split_off(cap);
                    script.incoming.push_front(Ok(rest));
                }
                Ok(Buffer::from(bytes))
            }
            Some(Err(e)) => {
                // errors stick so later reads see them too
                script.incoming.push_front(Err(e.clone()));
                Err(e)
            }
            None => return,
        };
        drop(script);
        handler.post(result);
    }
}

impl DataFlow for MockFlow {
    fn read(&self, buffer: Buffer, handler: DataHandler) -> CancelToken {
        let token = CancelToken::new();
        let cap = if buffer.is_empty() {
            DEFAULT_READ_SIZE
        } else {
            buffer.len()
        };
        self.inner.script.borrow_mut().pending_read = Some((cap, token.guard(handler)));
        self.inner.serve_read();
        token
    }

    fn write(&self, buffer: Buffer, handler: EventHandler) -> CancelToken {
        let token = CancelToken::new();
        let mut script = self.inner.script.borrow_mut();
        let result = match &script.fail_writes {
            Some(e) => Err(e.clone()),
            None => {
                script.writes.push(buffer.into_vec());
                Ok(())
            }
        };
        if result.is_ok() && script.hold_writes {
            script.held_writes.push(token.guard(handler));
            return token;
        }
        drop(script);
        token.guard(handler).post(result);
        token
    }

    fn close_write(&self, handler: EventHandler) -> CancelToken {
        let token = CancelToken::new();
        self.inner.script.borrow_mut().write_closed = true;
        token.guard(handler).post(Ok(()));
        token
    }

    fn state_machine(&self) -> FlowStateMachine {
        self.inner.fsm.get()
    }

    fn next_hop(&self) -> Option<&dyn DataFlow> {
        None
    }

    fn session(&self) -> Rc<Session> {
        self.inner.session.clone()
    }
}

impl LocalDataFlow for MockFlow {
    fn open(&self, handler: EventHandler) -> CancelToken {
        self.inner.fsm.update(|m| {
            m.connect_begin();
            m.connected();
        });
        let token = CancelToken::new();
        token.guard(handler).post(Ok(()));
        token
    }

    fn continue_open(&self, handler: EventHandler) -> CancelToken {
        let token = CancelToken::new();
        token.guard(handler).post(Ok(()));
        token
    }

    fn report_error(&self, error: &Error, handler: EventHandler) -> CancelToken {
        self.inner.script.borrow_mut().reported = Some(error.clone());
        self.inner.fsm.update(|m| m.closed());
        let token = CancelToken::new();
        token.guard(handler).post(Ok(()));
        token
    }
}

impl RemoteDataFlow for MockFlow {
    fn connect(&self, endpoint: Rc<Endpoint>, handler: EventHandler) -> CancelToken {
        self.inner.fsm.update(|m| m.connect_begin());
        let (delay, result) = {
            let mut script = self.inner.script.borrow_mut();
            script.connects += 1;
            script.connected_to = Some(endpoint);
            script
                .connect_results
                .pop_front()
                .unwrap_or((Duration::ZERO, Ok(())))
        };

        let token = CancelToken::new();
        let handler = token.guard(handler);
        let weak = Rc::downgrade(&self.inner);
        tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match &result {
                Ok(()) => inner.fsm.update(|m| m.connected()),
                Err(_) => inner.fsm.update(|m| m.errored()),
            }
            drop(inner);
            handler.call(result);
        });
        token
    }

    fn connecting_to(&self) -> Option<Rc<Endpoint>> {
        self.inner.script.borrow().connected_to.clone()
    }
}

/// A remote mock that is already connected.
pub(crate) fn connected_remote() -> (MockFlow, MockHandle) {
    let (flow, handle) = MockFlow::remote();
    flow.inner.fsm.update(|m| {
        m.connect_begin();
        m.connected();
    });
    (flow, handle)
}

pub(crate) fn endpoint(addr: &str) -> Rc<Endpoint> {
    Rc::new(Endpoint::new(addr.parse().unwrap()))
}
