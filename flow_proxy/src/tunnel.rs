//! Drives one session: negotiates the local leg, connects a remote chain and
//! copies bytes both ways until both directions finish.

use crate::{
    flow::{DataFlow, LocalDataFlow, DEFAULT_READ_SIZE},
    outbound::Outbound,
    utils::{Buffer, CancelToken},
    Error, Result,
};

use std::{cell::Cell, io, rc::Rc, time::Duration};

use tokio::{sync::oneshot, time::Instant};

/// Cancels the wrapped operation when its waiter goes away.
struct CancelOnDrop(CancelToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Issues a callback-style operation and waits for its completion.
async fn complete<T, F>(start: F) -> Result<T>
where
    T: 'static,
    F: FnOnce(Box<dyn FnOnce(Result<T>)>) -> CancelToken,
{
    let (tx, rx) = oneshot::channel();
    let token = start(Box::new(move |result: Result<T>| {
        let _ = tx.send(result);
    }));
    let _guard = CancelOnDrop(token);
    match rx.await {
        Ok(result) => result,
        // the leg dropped the handler after reporting a failure elsewhere
        Err(_) => Err(io::Error::new(io::ErrorKind::Interrupted, "operation abandoned").into()),
    }
}

async fn within<T>(limit: Duration, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(Error::Timeout))
}

async fn forward(from: &dyn DataFlow, to: &dyn DataFlow, activity: &Cell<Instant>) -> Result<()> {
    loop {
        let data = match complete(|h| from.read(Buffer::new(DEFAULT_READ_SIZE), h)).await {
            Ok(data) => data,
            Err(Error::Eof) => {
                activity.set(Instant::now());
                if to.state_machine().can_close_write() {
                    complete(|h| to.close_write(h)).await?;
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        activity.set(Instant::now());
        complete(|h| to.write(data, h)).await?;
        activity.set(Instant::now());
    }
}

async fn idle(activity: &Cell<Instant>, timeout: Duration) {
    loop {
        let deadline = activity.get() + timeout;
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}

/// Runs one tunnel to completion. Errors are returned after they have been
/// reported to the client where the protocol allows it.
pub async fn run(
    local: Box<dyn LocalDataFlow>,
    outbound: Rc<dyn Outbound>,
    idle_timeout: Duration,
) -> Result<()> {
    let session = local.session();
    let id = session.id();

    within(idle_timeout, complete(|h| local.open(h))).await?;
    let endpoint = session
        .endpoint()
        .ok_or_else(|| Error::InvalidEndpoint("no destination negotiated".into()))?;

    let remote = outbound.build(&session)?;
    log::info!("[{}] connecting to {}", id, endpoint);
    let connected = within(idle_timeout, complete(|h| remote.connect(endpoint.clone(), h))).await;
    if let Err(e) = connected {
        log::warn!("[{}] connect to {} failed: {}", id, endpoint, e);
        if let Err(report) = complete(|h| local.report_error(&e, h)).await {
            log::debug!("[{}] could not report failure: {}", id, report);
        }
        return Err(e);
    }
    within(idle_timeout, complete(|h| local.continue_open(h))).await?;
    log::debug!("[{}] tunnel established", id);

    let activity = Cell::new(Instant::now());
    tokio::select! {
        result = async {
            tokio::try_join!(
                forward(local.as_data_flow(), remote.as_data_flow(), &activity),
                forward(remote.as_data_flow(), local.as_data_flow(), &activity),
            )
        } => {
            result?;
            log::debug!("[{}] tunnel finished", id);
            Ok(())
        }
        _ = idle(&activity, idle_timeout) => {
            log::debug!("[{}] tunnel idle for {:?}, closing", id, idle_timeout);
            Err(Error::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        flow::{
            mock::{local, settle, MockFlow, MockHandle},
            RemoteDataFlow, Role,
        },
        utils::{Endpoint, Session},
    };

    use std::cell::RefCell;

    struct Prepared(RefCell<Option<Box<dyn RemoteDataFlow>>>);

    impl Outbound for Prepared {
        fn build(&self, _: &Rc<Session>) -> Result<Box<dyn RemoteDataFlow>> {
            self.0
                .borrow_mut()
                .take()
                .ok_or_else(|| Error::InvalidConfig("built twice".into()))
        }
    }

    type Setup = (Box<dyn LocalDataFlow>, MockHandle, Rc<dyn Outbound>, MockHandle);

    fn setup(with_endpoint: bool) -> Setup {
        let session = Session::new();
        if with_endpoint {
            session.set_endpoint(Endpoint::new("example.com:80".parse().unwrap()));
        }
        let (client, client_h) = MockFlow::new(Role::Local, session);
        let (remote, remote_h) = MockFlow::remote();
        let remote: Box<dyn RemoteDataFlow> = Box::new(remote);
        let outbound: Rc<dyn Outbound> = Rc::new(Prepared(RefCell::new(Some(remote))));
        (Box::new(client), client_h, outbound, remote_h)
    }

    #[tokio::test(start_paused = true)]
    async fn copies_both_ways_until_both_close() {
        local(async {
            let (client, client_h, outbound, remote_h) = setup(true);
            let task = tokio::task::spawn_local(run(client, outbound, Duration::from_secs(300)));
            settle().await;
            assert_eq!(
                remote_h.connected_to().unwrap().to_string(),
                "example.com:80"
            );

            client_h.push(b"hello");
            remote_h.push(b"world");
            settle().await;
            assert_eq!(remote_h.written(), b"hello".to_vec());
            assert_eq!(client_h.written(), b"world".to_vec());

            client_h.push_eof();
            settle().await;
            assert!(remote_h.is_write_closed());
            assert!(!task.is_finished());

            remote_h.push_eof();
            task.await.unwrap().unwrap();
            assert!(client_h.is_write_closed());
        })
        .await;
    }

    #[tokio::test]
    async fn connect_failure_is_reported_to_client() {
        local(async {
            let (client, client_h, outbound, remote_h) = setup(true);
            remote_h.connect_result(Duration::ZERO, Err(Error::ConnectionFailed(5)));
            let result = run(client, outbound, Duration::from_secs(300)).await;
            assert!(matches!(result, Err(Error::ConnectionFailed(5))));
            assert!(matches!(client_h.reported(), Some(Error::ConnectionFailed(5))));
        })
        .await;
    }

    #[tokio::test]
    async fn missing_destination_stops_before_building() {
        local(async {
            let (client, _client_h, outbound, remote_h) = setup(false);
            let result = run(client, outbound, Duration::from_secs(300)).await;
            assert!(matches!(result, Err(Error::InvalidEndpoint(_))));
            assert_eq!(remote_h.connects(), 0);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_tunnel_times_out() {
        local(async {
            let (client, client_h, outbound, remote_h) = setup(true);
            let start = Instant::now();
            let task = tokio::task::spawn_local(run(client, outbound, Duration::from_secs(30)));

            tokio::time::sleep(Duration::from_secs(20)).await;
            client_h.push(b"ping");
            settle().await;
            assert_eq!(remote_h.written(), b"ping".to_vec());

            let result = task.await.unwrap();
            assert!(matches!(result, Err(Error::Timeout)));
            assert!(start.elapsed() >= Duration::from_secs(50));
        })
        .await;
    }

    #[tokio::test]
    async fn read_error_ends_the_tunnel() {
        local(async {
            let (client, client_h, outbound, _remote_h) = setup(true);
            let task = tokio::task::spawn_local(run(client, outbound, Duration::from_secs(300)));
            settle().await;
            client_h.push_error(Error::Timeout);
            assert!(matches!(task.await.unwrap(), Err(Error::Timeout)));
        })
        .await;
    }
}
