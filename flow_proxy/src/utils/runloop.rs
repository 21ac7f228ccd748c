use std::time::Duration;

use tokio::task::JoinHandle;

use super::CancelToken;

/// Defers `f` to a later turn of the local event loop.
///
/// Must be called from inside a `LocalSet`.
pub fn post<F>(f: F)
where
    F: FnOnce() + 'static,
{
    tokio::task::spawn_local(async move { f() });
}

/// A single cancelable delay. Dropping the timer cancels it.
#[derive(Default)]
pub struct Timer {
    token: Option<CancelToken>,
    task: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the timer, replacing any earlier schedule.
    pub fn wait<F>(&mut self, delay: Duration, f: F)
    where
        F: FnOnce() + 'static,
    {
        self.cancel();

        let token = CancelToken::new();
        let handler = token.guard(move |_: ()| f());
        self.task = Some(tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            handler.call(());
        }));
        self.token = Some(token);
    }

    pub fn cancel(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}
