//! Steady-state pass-through shared by the decorator legs.
//!
//! Once negotiation is over most legs forward reads, writes and half-closes
//! to their next hop unchanged, keeping their own state machine in step.

use crate::{
    flow::{DataFlow, DataHandler, EventHandler, FlowState, FsmCell},
    utils::{Buffer, CancelToken},
    Error, Result,
};

use std::{cell::RefCell, rc::Rc};

/// User-facing tokens of the operations currently in flight.
#[derive(Default)]
pub(crate) struct Ops {
    read: RefCell<Option<CancelToken>>,
    write: RefCell<Option<CancelToken>>,
}

impl Ops {
    pub fn set_read(&self, token: &CancelToken) {
        self.read.replace(Some(token.clone_for_callback()));
    }

    pub fn set_write(&self, token: &CancelToken) {
        self.write.replace(Some(token.clone_for_callback()));
    }

    pub fn cancel_read(&self) {
        if let Some(token) = self.read.take() {
            token.cancel();
        }
    }

    pub fn cancel_write(&self) {
        if let Some(token) = self.write.take() {
            token.cancel();
        }
    }

    pub fn cancel_all(&self) {
        self.cancel_read();
        self.cancel_write();
    }
}

/// A leg that keeps a state machine and the tokens of its pending operations.
pub(crate) trait Tracked: 'static {
    fn fsm(&self) -> &FsmCell;
    fn ops(&self) -> &Ops;
    fn session_id(&self) -> u64;
}

/// A [`Tracked`] leg whose steady state is its next hop's.
pub(crate) trait Relayed: Tracked {
    fn next(&self) -> &dyn DataFlow;
}

/// Records the outcome of a read in `this`'s state machine.
///
/// A failed read poisons the leg; the write in flight is canceled so the
/// failure reaches the caller once.
pub(crate) fn finish_read<T: Tracked + ?Sized>(this: &T, result: &Result<Buffer>) {
    match result {
        Ok(_) => this.fsm().update(|m| m.read_end()),
        Err(Error::Eof)
            if matches!(
                this.fsm().get().state(),
                FlowState::Established | FlowState::Closing
            ) =>
        {
            this.fsm().update(|m| m.read_closed())
        }
        Err(e) => {
            log::debug!("[{}] read failed: {}", this.session_id(), e);
            this.fsm().update(|m| m.errored());
            this.ops().cancel_write();
        }
    }
}

pub(crate) fn finish_write<T: Tracked + ?Sized>(this: &T, result: &Result<()>) {
    match result {
        Ok(()) => this.fsm().update(|m| m.write_end()),
        Err(e) => {
            log::debug!("[{}] write failed: {}", this.session_id(), e);
            this.fsm().update(|m| m.errored());
            this.ops().cancel_read();
        }
    }
}

/// Takes at most `max` bytes off the front of `queue`, or all of it when
/// `max` is 0.
pub(crate) fn take_front(queue: &mut Vec<u8>, max: usize) -> Vec<u8> {
    if max == 0 || max >= queue.len() {
        return std::mem::take(queue);
    }
    let rest = queue.split_off(max);
    std::mem::replace(queue, rest)
}

pub(crate) fn read<T: Relayed>(this: &Rc<T>, buffer: Buffer, handler: DataHandler) -> CancelToken {
    this.fsm().update(|m| m.read_begin());

    let token = CancelToken::new();
    let handler = token.guard(handler);
    let weak = Rc::downgrade(this);
    this.next().read(
        buffer,
        Box::new(move |result: Result<Buffer>| {
            let Some(this) = weak.upgrade() else {
                return;
            };
            finish_read(&*this, &result);
            drop(this);
            handler.call(result);
        }),
    );
    this.ops().set_read(&token);
    token
}

pub(crate) fn write<T: Relayed>(this: &Rc<T>, buffer: Buffer, handler: EventHandler) -> CancelToken {
    this.fsm().update(|m| m.write_begin());

    let token = CancelToken::new();
    let handler = token.guard(handler);
    let weak = Rc::downgrade(this);
    this.next().write(
        buffer,
        Box::new(move |result: Result<()>| {
            let Some(this) = weak.upgrade() else {
                return;
            };
            finish_write(&*this, &result);
            drop(this);
            handler.call(result);
        }),
    );
    this.ops().set_write(&token);
    token
}

pub(crate) fn close_write<T: Relayed>(this: &Rc<T>, handler: EventHandler) -> CancelToken {
    this.fsm().update(|m| m.write_close_begin());
    this.ops().cancel_write();

    let token = CancelToken::new();
    let handler = token.guard(handler);
    let weak = Rc::downgrade(this);
    this.next().close_write(Box::new(move |result: Result<()>| {
        let Some(this) = weak.upgrade() else {
            return;
        };
        match &result {
            Ok(()) => this.fsm().update(|m| m.write_close_end()),
            Err(_) => this.fsm().update(|m| m.errored()),
        }
        drop(this);
        handler.call(result);
    }));
    this.ops().set_write(&token);
    token
}
