//! Deferred teardown guard
//!
//! A [`Counter`] tracks calls that are still in flight on some object and
//! runs the object's destructor once the owner has discarded it and every
//! in-flight call has returned.
//!
//! `before()` and `after()` must be paired, and `discard()` is called once
//! by the owner. The destructor fires the first time the count goes below
//! zero, which happens exactly when `discard()` and all outstanding
//! `after()` calls have landed.

use std::future::Future;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::trace;

type Destructor = Box<dyn FnOnce() + Send>;

struct State {
    in_flight: i64,
    destructor: Option<Destructor>,
}

/// In-flight call counter with a one-shot destructor
pub struct Counter {
    state: Mutex<State>,
    destroyed: watch::Sender<bool>,
}

/// Calls [`Counter::after`] when dropped
pub struct InFlight<'a> {
    counter: &'a Counter,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.after();
    }
}

impl Counter {
    /// Create a counter that runs `destructor` on teardown
    pub fn new<F>(destructor: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Counter {
            state: Mutex::new(State {
                in_flight: 0,
                destructor: Some(Box::new(destructor)),
            }),
            destroyed: watch::channel(false).0,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A call is starting
    pub fn before(&self) {
        let mut state = self.lock();
        if state.destructor.is_none() {
            trace!("Call started after teardown");
        }
        state.in_flight += 1;
    }

    /// A call has finished
    pub fn after(&self) {
        let destructor = {
            let mut state = self.lock();
            state.in_flight -= 1;
            if state.in_flight < 0 {
                state.destructor.take()
            } else {
                None
            }
        };

        if let Some(destructor) = destructor {
            destructor();
            self.destroyed.send_replace(true);
        }
    }

    /// The owner will issue no further calls
    pub fn discard(&self) {
        self.after();
    }

    /// Mark a call in flight until the returned guard is dropped
    pub fn enter(&self) -> InFlight<'_> {
        self.before();
        InFlight { counter: self }
    }

    /// Run `fut` as one in-flight call
    pub async fn wrap<F: Future>(&self, fut: F) -> F::Output {
        let _in_flight = self.enter();
        fut.await
    }

    /// Number of calls currently in flight
    pub fn in_flight(&self) -> i64 {
        self.lock().in_flight
    }

    /// Whether the destructor has run
    pub fn is_destroyed(&self) -> bool {
        *self.destroyed.borrow()
    }

    /// Wait until the destructor has run
    pub async fn destroyed(&self) {
        let mut rx = self.destroyed.subscribe();
        let _ = rx.wait_for(|destroyed| *destroyed).await;
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter")
            .field("in_flight", &self.in_flight())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
