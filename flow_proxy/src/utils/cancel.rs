use std::{cell::Cell, rc::Rc};

use super::runloop;

/// Cooperative cancellation flag shared by an operation's issuer and its completion.
///
/// Once canceled a token stays canceled; start a new operation with a new token.
#[derive(Clone, Default, Debug)]
pub struct CancelToken(Rc<Cell<bool>>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.set(true);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.get()
    }

    /// A linked handle observing the same flag, for capture inside a completion.
    pub fn clone_for_callback(&self) -> Self {
        Self(Rc::clone(&self.0))
    }

    /// Binds `f` to this token. The returned handler only runs while the token is live.
    pub fn guard<T, F>(&self, f: F) -> Guarded<T>
    where
        F: FnOnce(T) + 'static,
    {
        Guarded {
            token: self.clone_for_callback(),
            f: Box::new(f),
        }
    }
}

/// A one-shot completion that checks its token before doing anything.
pub struct Guarded<T> {
    token: CancelToken,
    f: Box<dyn FnOnce(T)>,
}

impl<T: 'static> Guarded<T> {
    /// Runs the handler unless canceled. Returns whether it ran.
    pub fn call(self, value: T) -> bool {
        if self.token.is_canceled() {
            return false;
        }
        (self.f)(value);
        true
    }

    /// Runs the handler on a later loop turn; the token is checked then, not now.
    pub fn post(self, value: T) {
        runloop::post(move || {
            self.call(value);
        });
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::mock::{local, settle};

    #[test]
    fn cancel_is_sticky() {
        let token = CancelToken::new();
        let linked = token.clone_for_callback();
        assert!(!linked.is_canceled());
        token.cancel();
        token.cancel();
        assert!(linked.is_canceled());
    }

    #[tokio::test]
    async fn canceled_completion_never_runs() {
        local(async {
            let calls = Rc::new(Cell::new(0));
            let token = CancelToken::new();
            let counter = calls.clone();
            token
                .guard(move |n: usize| counter.set(counter.get() + n))
                .post(1);
            token.cancel();
            settle().await;
            assert_eq!(calls.get(), 0);

            let token = CancelToken::new();
            let counter = calls.clone();
            token
                .guard(move |n: usize| counter.set(counter.get() + n))
                .post(2);
            settle().await;
            assert_eq!(calls.get(), 2);
        })
        .await;
    }

    #[test]
    fn call_reports_whether_it_ran() {
        let token = CancelToken::new();
        assert!(token.guard(|_: ()| {}).call(()));
        token.cancel();
        assert!(!token.guard(|_: ()| panic!("must not run")).call(()));
    }
}
