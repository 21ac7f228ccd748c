//! Races several remote chains to one destination and keeps the first that
//! connects.

use crate::{
    flow::{
        DataFlow, DataHandler, EventHandler, FlowStateMachine, FsmCell, RemoteDataFlow, Role,
    },
    utils::{runloop::Timer, Buffer, CancelToken, Endpoint, Guarded, Session},
    Error, Result,
};

use once_cell::unsync::OnceCell;
use std::{
    cell::{Cell, RefCell},
    io,
    rc::Rc,
    time::Duration,
};

struct Slot {
    flow: Option<Box<dyn RemoteDataFlow>>,
    delay: Duration,
    timer: Timer,
    attempt: Option<CancelToken>,
}

struct Racer {
    session: Rc<Session>,
    fsm: FsmCell,
    slots: RefCell<Vec<Slot>>,
    adopted: OnceCell<Box<dyn RemoteDataFlow>>,
    remaining: Cell<usize>,
    last_error: RefCell<Option<Error>>,
    handler: RefCell<Option<Guarded<Result<()>>>>,
    /// Token handed out by `connect`.
    race: RefCell<Option<CancelToken>>,
    target: RefCell<Option<Rc<Endpoint>>>,
}

impl Racer {
    /// Stops the race if its token was canceled. Returns whether it was.
    fn check_canceled(&self) -> bool {
        let canceled = self
            .race
            .borrow()
            .as_ref()
            .is_some_and(|token| token.is_canceled());
        if canceled {
            log::debug!("[{}] race canceled", self.session.id());
            self.stop();
        }
        canceled
    }

    /// Disarms every timer and abandons every attempt in flight.
    fn stop(&self) {
        for slot in self.slots.borrow_mut().iter_mut() {
            slot.timer.cancel();
            if let Some(attempt) = slot.attempt.take() {
                attempt.cancel();
            }
        }
    }

    fn start(self: &Rc<Self>, index: usize) {
        if self.check_canceled() {
            return;
        }
        let Some(endpoint) = self.target.borrow().clone() else {
            return;
        };
        let mut slots = self.slots.borrow_mut();
        let Some(slot) = slots.get_mut(index) else {
            return;
        };
        let Some(flow) = slot.flow.as_ref() else {
            return;
        };

        log::debug!("[{}] race candidate {} connecting", self.session.id(), index);
        let weak = Rc::downgrade(self);
        let token = flow.connect(
            endpoint,
            Box::new(move |result: Result<()>| {
                if let Some(this) = weak.upgrade() {
                    this.finish(index, result);
                }
            }),
        );
        slot.attempt = Some(token);
    }

    fn finish(&self, index: usize, result: Result<()>) {
        if self.adopted.get().is_some() || self.check_canceled() {
            return;
        }

        match result {
            Ok(()) => {
                let (winner, losers) = {
                    let mut slots = self.slots.borrow_mut();
                    let mut losers = Vec::new();
                    let mut winner = None;
                    for (i, slot) in slots.iter_mut().enumerate() {
                        slot.timer.cancel();
                        if let Some(attempt) = slot.attempt.take() {
                            if i != index {
                                attempt.cancel();
                            }
                        }
                        if i == index {
                            winner = slot.flow.take();
                        } else {
                            losers.extend(slot.flow.take());
                        }
                    }
                    (winner, losers)
                };
                drop(losers);

                let Some(winner) = winner else {
                    return;
                };
                log::debug!("[{}] race won by candidate {}", self.session.id(), index);
                if self.adopted.set(winner).is_err() {
                    return;
                }
                self.fsm.update(|m| m.connected());
                if let Some(handler) = self.handler.take() {
                    handler.call(Ok(()));
                }
            }
            Err(e) => {
                log::debug!(
                    "[{}] race candidate {} failed: {}",
                    self.session.id(),
                    index,
                    e
                );
                if let Some(slot) = self.slots.borrow_mut().get_mut(index) {
                    slot.attempt = None;
                    slot.flow = None;
                }
                self.last_error.replace(Some(e));
                self.remaining.set(self.remaining.get().saturating_sub(1));
                if self.remaining.get() == 0 {
                    self.fsm.update(|m| m.errored());
                    let error = self
                        .last_error
                        .take()
                        .unwrap_or(Error::ConnectionFailed(1));
                    if let Some(handler) = self.handler.take() {
                        handler.call(Err(error));
                    }
                }
            }
        }
    }
}

/// Remote leg over several candidate chains, each started after its own
/// delay. Once one connects, every operation goes to it.
pub struct RaceFlow {
    inner: Rc<Racer>,
}

impl RaceFlow {
    pub fn new(session: Rc<Session>, candidates: Vec<(Box<dyn RemoteDataFlow>, Duration)>) -> Self {
        let slots = candidates
            .into_iter()
            .map(|(flow, delay)| Slot {
                flow: Some(flow),
                delay,
                timer: Timer::new(),
                attempt: None,
            })
            .collect();
        Self {
            inner: Rc::new(Racer {
                session,
                fsm: FsmCell::new(Role::Remote),
                slots: RefCell::new(slots),
                adopted: OnceCell::new(),
                remaining: Cell::new(0),
                last_error: RefCell::new(None),
                handler: RefCell::new(None),
                race: RefCell::new(None),
                target: RefCell::new(None),
            }),
        }
    }

    fn not_connected<T: 'static>(&self, handler: Box<dyn FnOnce(Result<T>)>) -> CancelToken {
        let token = CancelToken::new();
        token
            .guard(handler)
            .post(Err(Error::from(io::Error::from(io::ErrorKind::NotConnected))));
        token
    }
}

impl Drop for RaceFlow {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl DataFlow for RaceFlow {
    fn read(&self, buffer: Buffer, handler: DataHandler) -> CancelToken {
        match self.inner.adopted.get() {
            Some(flow) => flow.read(buffer, handler),
            None => self.not_connected(handler),
        }
    }

    fn write(&self, buffer: Buffer, handler: EventHandler) -> CancelToken {
        match self.inner.adopted.get() {
            Some(flow) => flow.write(buffer, handler),
            None => self.not_connected(handler),
        }
    }

    fn close_write(&self, handler: EventHandler) -> CancelToken {
        match self.inner.adopted.get() {
            Some(flow) => flow.close_write(handler),
            None => self.not_connected(handler),
        }
    }

    fn state_machine(&self) -> FlowStateMachine {
        match self.inner.adopted.get() {
            Some(flow) => flow.state_machine(),
            None => self.inner.fsm.get(),
        }
    }

    fn next_hop(&self) -> Option<&dyn DataFlow> {
        self.inner.adopted.get().map(|flow| flow.as_data_flow())
    }

    fn session(&self) -> Rc<Session> {
        self.inner.session.clone()
    }
}

impl RemoteDataFlow for RaceFlow {
    fn connect(&self, endpoint: Rc<Endpoint>, handler: EventHandler) -> CancelToken {
        self.inner.fsm.update(|m| m.connect_begin());
        self.inner.target.replace(Some(endpoint));

        let token = CancelToken::new();
        let handler = token.guard(handler);

        let mut slots = self.inner.slots.borrow_mut();
        if slots.is_empty() {
            drop(slots);
            self.inner.fsm.update(|m| m.errored());
            handler.post(Err(Error::InvalidConfig("no route to race".into())));
            return token;
        }
        self.inner.handler.replace(Some(handler));
        self.inner.race.replace(Some(token.clone_for_callback()));
        self.inner.remaining.set(slots.len());

        for (index, slot) in slots.iter_mut().enumerate() {
            let weak = Rc::downgrade(&self.inner);
            slot.timer.wait(slot.delay, move || {
                if let Some(this) = weak.upgrade() {
                    this.start(index);
                }
            });
        }
        token
    }

    fn connecting_to(&self) -> Option<Rc<Endpoint>> {
        self.inner.target.borrow().clone()
    }
}
