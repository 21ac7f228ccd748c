//! Legs backed by a real byte stream.

use crate::{
    flow::{
        relay::{finish_read, finish_write, Ops, Tracked},
        DataFlow, DataHandler, EventHandler, FlowStateMachine, FsmCell, LocalDataFlow,
        RemoteDataFlow, Role, DEFAULT_READ_SIZE,
    },
    utils::{Buffer, CancelToken, Endpoint, Resolver, Session},
    Error, Result,
};

use std::{cell::RefCell, io, rc::Rc};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::Mutex,
    task::JoinHandle,
};

struct Io<S> {
    reader: Rc<Mutex<ReadHalf<S>>>,
    writer: Rc<Mutex<WriteHalf<S>>>,
}

impl<S> Clone for Io<S> {
    fn clone(&self) -> Self {
        Self {
            reader: self.reader.clone(),
            writer: self.writer.clone(),
        }
    }
}

#[derive(Default)]
struct Tasks {
    read: Option<JoinHandle<()>>,
    write: Option<JoinHandle<()>>,
    connect: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_write(&mut self) {
        if let Some(task) = self.write.take() {
            task.abort();
        }
    }
}

struct StreamInner<S> {
    session: Rc<Session>,
    fsm: FsmCell,
    ops: Ops,
    io: RefCell<Option<Io<S>>>,
    tasks: RefCell<Tasks>,
    resolver: Option<Rc<dyn Resolver>>,
    endpoint: RefCell<Option<Rc<Endpoint>>>,
}

impl<S: 'static> Tracked for StreamInner<S> {
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

impl<S> Drop for StreamInner<S> {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        for task in [tasks.read.take(), tasks.write.take(), tasks.connect.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

/// Bottom leg of a chain: moves bytes through a tokio stream.
pub struct StreamFlow<S> {
    inner: Rc<StreamInner<S>>,
}

impl<S> StreamFlow<S>
where
    S: AsyncRead + AsyncWrite + 'static,
{
    /// Wraps an accepted client connection.
    pub fn accepted(stream: S, session: Rc<Session>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            inner: Rc::new(StreamInner {
                session,
                fsm: FsmCell::new(Role::Local),
                ops: Ops::default(),
                io: RefCell::new(Some(Io {
                    reader: Rc::new(Mutex::new(reader)),
                    writer: Rc::new(Mutex::new(writer)),
                })),
                tasks: RefCell::default(),
                resolver: None,
                endpoint: RefCell::new(None),
            }),
        }
    }

    fn io(&self) -> Option<Io<S>> {
        self.inner.io.borrow().clone()
    }

    fn shutdown(&self, handler: EventHandler) -> CancelToken {
        let token = CancelToken::new();
        let handler = token.guard(handler);
        let Some(io) = self.io() else {
            handler.post(Err(not_connected()));
            return token;
        };

        let weak = Rc::downgrade(&self.inner);
        let task = tokio::task::spawn_local(async move {
            let result = io.writer.lock().await.shutdown().await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let result = match result {
                Ok(()) => {
                    inner.fsm.update(|m| m.write_close_end());
                    Ok(())
                }
                Err(e) => {
                    inner.fsm.update(|m| m.errored());
                    Err(e.into())
                }
            };
            drop(inner);
            handler.call(result);
        });
        self.inner.tasks.borrow_mut().write = Some(task);
        self.inner.ops.set_write(&token);
        token
    }
}

impl StreamFlow<TcpStream> {
    /// An unconnected remote leg that dials the endpoint given to `connect`.
    pub fn tcp(session: Rc<Session>, resolver: Rc<dyn Resolver>) -> Self {
        Self {
            inner: Rc::new(StreamInner {
                session,
                fsm: FsmCell::new(Role::Remote),
                ops: Ops::default(),
                io: RefCell::new(None),
                tasks: RefCell::default(),
                resolver: Some(resolver),
                endpoint: RefCell::new(None),
            }),
        }
    }
}

fn not_connected() -> Error {
    io::Error::from(io::ErrorKind::NotConnected).into()
}

async fn dial(endpoint: &Endpoint, resolver: &dyn Resolver) -> Result<TcpStream> {
    let addrs = endpoint.lookup(resolver).await?;

    let mut last_error = Error::Resolve(endpoint.hostname().to_string());
    for ip in addrs.iter() {
        match TcpStream::connect((*ip, endpoint.port())).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => {
                log::debug!("connect to {}:{} failed: {}", ip, endpoint.port(), e);
                last_error = e.into();
            }
        }
    }
    Err(last_error)
}

impl<S> DataFlow for StreamFlow<S>
where
    S: AsyncRead + AsyncWrite + 'static,
{
    fn read(&self, buffer: Buffer, handler: DataHandler) -> CancelToken {
        self.inner.fsm.update(|m| m.read_begin());

        let token = CancelToken::new();
        let handler = token.guard(handler);
        let Some(io) = self.io() else {
            self.inner.fsm.update(|m| m.errored());
            handler.post(Err(not_connected()));
            return token;
        };

        let mut buffer = if buffer.is_empty() {
            Buffer::new(DEFAULT_READ_SIZE)
        } else {
            buffer
        };
        let weak = Rc::downgrade(&self.inner);
        let task = tokio::task::spawn_local(async move {
            let result = io.reader.lock().await.read(&mut buffer).await;
            let result = match result {
                Ok(0) => Err(Error::Eof),
                Ok(n) => {
                    buffer.truncate(n);
                    Ok(buffer)
                }
                Err(e) => Err(e.into()),
            };

            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.tasks.borrow_mut().read = None;
            finish_read(&*inner, &result);
            drop(inner);
            handler.call(result);
        });
        self.inner.tasks.borrow_mut().read = Some(task);
        self.inner.ops.set_read(&token);
        token
    }

    fn write(&self, buffer: Buffer, handler: EventHandler) -> CancelToken {
        self.inner.fsm.update(|m| m.write_begin());

        let token = CancelToken::new();
        let handler = token.guard(handler);
        let Some(io) = self.io() else {
            self.inner.fsm.update(|m| m.errored());
            handler.post(Err(not_connected()));
            return token;
        };

        let weak = Rc::downgrade(&self.inner);
        let task = tokio::task::spawn_local(async move {
            let result = {
                let mut writer = io.writer.lock().await;
                match writer.write_all(&buffer).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                }
            };
            let result = result.map_err(Error::from);

            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.tasks.borrow_mut().write = None;
            finish_write(&*inner, &result);
            drop(inner);
            handler.call(result);
        });
        self.inner.tasks.borrow_mut().write = Some(task);
        self.inner.ops.set_write(&token);
        token
    }

    fn close_write(&self, handler: EventHandler) -> CancelToken {
        self.inner.fsm.update(|m| m.write_close_begin());
        self.inner.ops.cancel_write();
        self.inner.tasks.borrow_mut().abort_write();
        self.shutdown(handler)
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

impl<S> LocalDataFlow for StreamFlow<S>
where
    S: AsyncRead + AsyncWrite + 'static,
{
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
        log::debug!("[{}] closing client after {}", self.inner.session.id(), error);
        self.inner.ops.cancel_all();
        self.inner.tasks.borrow_mut().abort_write();
        let token = self.shutdown(handler);
        self.inner.fsm.update(|m| m.closed());
        token
    }
}

impl RemoteDataFlow for StreamFlow<TcpStream> {
    fn connect(&self, endpoint: Rc<Endpoint>, handler: EventHandler) -> CancelToken {
        self.inner.fsm.update(|m| m.connect_begin());
        self.inner.endpoint.replace(Some(endpoint.clone()));

        let token = CancelToken::new();
        let handler = token.guard(handler);
        let Some(resolver) = self.inner.resolver.clone() else {
            self.inner.fsm.update(|m| m.errored());
            handler.post(Err(not_connected()));
            return token;
        };

        let weak = Rc::downgrade(&self.inner);
        let task = tokio::task::spawn_local(async move {
            let result = dial(&endpoint, &*resolver).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.tasks.borrow_mut().connect = None;
            let result = match result {
                Ok(stream) => {
                    log::debug!("[{}] connected to {}", inner.session.id(), endpoint);
                    let (reader, writer) = tokio::io::split(stream);
                    inner.io.replace(Some(Io {
                        reader: Rc::new(Mutex::new(reader)),
                        writer: Rc::new(Mutex::new(writer)),
                    }));
                    inner.fsm.update(|m| m.connected());
                    Ok(())
                }
                Err(e) => {
                    inner.fsm.update(|m| m.errored());
                    Err(e)
                }
            };
            drop(inner);
            handler.call(result);
        });
        self.inner.tasks.borrow_mut().connect = Some(task);
        token
    }

    fn connecting_to(&self) -> Option<Rc<Endpoint>> {
        self.inner.endpoint.borrow().clone()
    }
}
