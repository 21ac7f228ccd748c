//! The composable read/write/connect contract every leg implements.
//!
//! A tunnel is a chain of legs: each leg owns its `next_hop` and ultimately
//! delegates I/O to it. Every operation returns a [`CancelToken`]; canceling it
//! guarantees the handler is never invoked. Handlers are never invoked from
//! inside the call that issued the operation.

#[cfg(test)]
pub(crate) mod mock;
pub(crate) mod relay;
mod state;
pub mod stream;

pub use state::{FlowState, FlowStateMachine, FsmCell, Role};
pub use stream::StreamFlow;

use crate::{
    utils::{Buffer, CancelToken, Endpoint, Session},
    Error, Result,
};

use std::rc::Rc;

pub type DataHandler = Box<dyn FnOnce(Result<Buffer>)>;
pub type EventHandler = Box<dyn FnOnce(Result<()>)>;

/// Reads use this many bytes when the caller passes an empty buffer.
pub const DEFAULT_READ_SIZE: usize = 8192;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    Stream,
    Packet,
}

pub trait DataFlow {
    /// Reads at most `buffer.len()` bytes (or [`DEFAULT_READ_SIZE`] when empty).
    /// End of stream is reported as [`Error::Eof`].
    fn read(&self, buffer: Buffer, handler: DataHandler) -> CancelToken;

    fn write(&self, buffer: Buffer, handler: EventHandler) -> CancelToken;

    /// Half-closes the write side. Cancels a write still in flight.
    fn close_write(&self, handler: EventHandler) -> CancelToken;

    fn state_machine(&self) -> FlowStateMachine;

    fn next_hop(&self) -> Option<&dyn DataFlow>;

    fn session(&self) -> Rc<Session>;

    fn data_type(&self) -> DataType {
        DataType::Stream
    }
}

/// Lets a `&dyn LocalDataFlow` or `&dyn RemoteDataFlow` be viewed as `&dyn DataFlow`.
pub trait AsDataFlow {
    fn as_data_flow(&self) -> &dyn DataFlow;
}

impl<T: DataFlow> AsDataFlow for T {
    fn as_data_flow(&self) -> &dyn DataFlow {
        self
    }
}

/// A leg facing the client.
pub trait LocalDataFlow: DataFlow + AsDataFlow {
    /// Negotiates until the destination is known and stored in the session.
    fn open(&self, handler: EventHandler) -> CancelToken;

    /// Finishes negotiation once the remote chain is connected.
    fn continue_open(&self, handler: EventHandler) -> CancelToken;

    /// Tells the client the destination could not be reached, then closes.
    fn report_error(&self, error: &Error, handler: EventHandler) -> CancelToken;
}

/// A leg facing the destination.
pub trait RemoteDataFlow: DataFlow + AsDataFlow {
    fn connect(&self, endpoint: Rc<Endpoint>, handler: EventHandler) -> CancelToken;

    fn connecting_to(&self) -> Option<Rc<Endpoint>>;
}
