//! Single-assignment [`Future`]/[`Promise`] pair with continuations.
//!
//! This mirrors the source library's `Future`/`Promise`: a promise is
//! completed at most once, continuations registered with [`Future::then`]
//! run in registration order, and — unless [`Future::via`] attaches a
//! target loop — they run synchronously in whichever thread completes the
//! promise. On top of that callback-oriented surface, `Future<T, E>` also
//! implements [`std::future::Future`] so callers can simply `.await` it; the
//! two surfaces share the same underlying cell (see design note in
//! `DESIGN.md` on coroutines vs. callbacks).
//!
//! Every [`Future`]/[`Promise`] instance the RPC layer hands out uses an
//! `Arc<T>` payload so that `Future<T, E>` stays `Clone`-able (needed for
//! fan-out: a burst of callers waiting on the same pending connect, or
//! multiple `.then()` registrations on one future) without requiring `T:
//! Clone`.

use std::{
    future::Future as StdFuture,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};

use crate::reactor::reactor_loop::LoopHandle;

type Continuation<T, E> = Box<dyn FnOnce(Result<T, E>) + Send>;

enum State<T, E> {
    Pending {
        continuations: Vec<Continuation<T, E>>,
        wakers: Vec<Waker>,
    },
    Ready(Result<T, E>),
}

struct Shared<T, E> {
    state: Mutex<State<T, E>>,
}

/// The writer half of a single-assignment result cell.
pub struct Promise<T, E> {
    inner: Arc<Shared<T, E>>,
}

/// The reader half: awaitable directly, or composable with [`Future::then`].
pub struct Future<T, E> {
    inner: Arc<Shared<T, E>>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> Clone for Future<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Creates a fresh, unresolved promise/future pair.
pub fn promise<T, E>() -> (Promise<T, E>, Future<T, E>)
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    let shared = Arc::new(Shared {
        state: Mutex::new(State::Pending {
            continuations: Vec::new(),
            wakers: Vec::new(),
        }),
    });
    (
        Promise {
            inner: Arc::clone(&shared),
        },
        Future { inner: shared },
    )
}

/// Returns an already-completed future.
pub fn ready<T, E>(value: T) -> Future<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    let (p, f) = promise();
    p.set_value(value);
    f
}

/// Returns an already-failed future.
pub fn failed<T, E>(err: E) -> Future<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    let (p, f) = promise();
    p.set_exception(err);
    f
}

impl<T, E> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Attempts to complete the promise with a value. Returns `false` if it
    /// was already completed by a racing path (reply vs. timeout vs.
    /// disconnect) — exactly one of those paths is expected to win.
    pub fn try_set_value(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    /// Attempts to complete the promise with an error. See
    /// [`Promise::try_set_value`].
    pub fn try_set_exception(&self, err: E) -> bool {
        self.complete(Err(err))
    }

    /// Completes the promise with a value. Calling this on an
    /// already-completed promise is a programming error: it is a fatal
    /// assertion in debug builds and a silent no-op in release, for an
    /// invariant that should never be violated if the rest of the system
    /// holds.
    pub fn set_value(&self, value: T) {
        let ok = self.try_set_value(value);
        debug_assert!(ok, "Promise::set_value called on an already-completed promise");
    }

    /// Completes the promise with an error. See [`Promise::set_value`].
    pub fn set_exception(&self, err: E) {
        let ok = self.try_set_exception(err);
        debug_assert!(
            ok,
            "Promise::set_exception called on an already-completed promise"
        );
    }

    fn complete(&self, result: Result<T, E>) -> bool {
        let (continuations, wakers) = {
            let mut guard = self.inner.state.lock().expect("promise mutex poisoned");
            match &*guard {
                State::Ready(_) => return false,
                State::Pending { .. } => {},
            }
            let prev = std::mem::replace(&mut *guard, State::Ready(result.clone()));
            match prev {
                State::Pending {
                    continuations,
                    wakers,
                } => (continuations, wakers),
                State::Ready(_) => unreachable!("checked above"),
            }
        };

        for waker in wakers {
            waker.wake();
        }
        for cont in continuations {
            cont(result.clone());
        }
        true
    }
}

/// Either a plain value or a chained future — the monadic-bind return type
/// of [`Future::then`].
pub enum Resolved<U, E> {
    Value(U),
    Chained(Future<U, E>),
}

impl<U, E> From<U> for Resolved<U, E> {
    fn from(v: U) -> Self {
        Resolved::Value(v)
    }
}

impl<U, E> From<Future<U, E>> for Resolved<U, E> {
    fn from(f: Future<U, E>) -> Self {
        Resolved::Chained(f)
    }
}

impl<T, E> Future<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// `true` once the cell has a value or an error.
    pub fn is_ready(&self) -> bool {
        matches!(
            &*self.inner.state.lock().expect("promise mutex poisoned"),
            State::Ready(_)
        )
    }

    /// Registers a raw completion callback. If the future is already
    /// complete it runs `f` immediately in the caller's thread; otherwise it
    /// is queued and runs — in registration order relative to other queued
    /// continuations — in whichever thread completes the promise.
    fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(Result<T, E>) + Send + 'static,
    {
        let mut guard = self.inner.state.lock().expect("promise mutex poisoned");
        match &mut *guard {
            State::Ready(result) => {
                let result = result.clone();
                drop(guard);
                f(result);
            },
            State::Pending { continuations, .. } => {
                continuations.push(Box::new(f));
            },
        }
    }

    /// Registers a continuation. `f` receives the outcome and returns either
    /// a plain value or another `Future` to chain onto (monadic bind).
    pub fn then<U, F, R>(&self, f: F) -> Future<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Result<T, E>) -> R + Send + 'static,
        R: Into<Resolved<U, E>>,
    {
        let (target, out) = promise::<U, E>();
        self.on_complete(move |result| match f(result).into() {
            Resolved::Value(v) => {
                target.try_set_value(v);
            },
            Resolved::Chained(inner) => {
                inner.on_complete(move |res| match res {
                    Ok(v) => {
                        target.try_set_value(v);
                    },
                    Err(e) => {
                        target.try_set_exception(e);
                    },
                });
            },
        });
        out
    }

    /// Races this future against a `dur`-long timer scheduled on `handle`.
    /// Whichever resolves first wins; the loser's result is dropped.
    /// `on_timeout` is called at most once, only if the timer wins the race.
    pub fn within(&self, dur: std::time::Duration, handle: &LoopHandle, on_timeout: impl FnOnce() -> E + Send + 'static) -> Future<T, E> {
        let (out_promise, out) = promise::<T, E>();

        let p1 = out_promise.clone();
        self.on_complete(move |result| match result {
            Ok(v) => {
                p1.try_set_value(v);
            },
            Err(e) => {
                p1.try_set_exception(e);
            },
        });

        let mut on_timeout = Some(on_timeout);
        let p2 = out_promise;
        handle.schedule_after(dur, move || {
            if let Some(f) = on_timeout.take() {
                p2.try_set_exception(f());
            }
        });

        out
    }

    /// Returns a future whose continuations are posted as a task to `handle`
    /// instead of running inline in the completing thread.
    pub fn via(&self, handle: LoopHandle) -> Future<T, E> {
        let (target, out) = promise::<T, E>();
        self.on_complete(move |result| {
            handle.execute(move || match result {
                Ok(v) => {
                    target.try_set_value(v);
                },
                Err(e) => {
                    target.try_set_exception(e);
                },
            });
        });
        out
    }
}

impl<T, E> StdFuture for Future<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.inner.state.lock().expect("promise mutex poisoned");
        match &mut *guard {
            State::Ready(result) => Poll::Ready(result.clone()),
            State::Pending { wakers, .. } => {
                wakers.push(cx.waker().clone());
                Poll::Pending
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;

    #[test]
    fn set_value_then_is_ready() {
        let (p, f) = promise::<i32, String>();
        assert!(!f.is_ready());
        p.set_value(41);
        assert!(f.is_ready());
    }

    #[test]
    fn second_completion_is_rejected() {
        let (p, f) = promise::<i32, String>();
        assert!(p.try_set_value(1));
        assert!(!p.try_set_value(2));
        assert_eq!(f.is_ready(), true);
    }

    #[test]
    fn then_runs_immediately_when_already_ready() {
        let (p, f) = promise::<i32, String>();
        p.set_value(10);
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let chained: Future<i32, String> = f.then(move |r| {
            ran2.store(true, Ordering::SeqCst);
            r.unwrap_or(0) + 1
        });
        assert!(ran.load(Ordering::SeqCst));
        assert!(chained.is_ready());
    }

    #[test]
    fn continuations_fire_in_registration_order() {
        let (p, f) = promise::<i32, String>();
        let order = Arc::new(StdMutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            f.then(move |_| {
                order.lock().expect("order mutex poisoned").push(i);
                0
            });
        }
        p.set_value(1);
        assert_eq!(*order.lock().expect("order mutex poisoned"), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn future_is_directly_awaitable() {
        let (p, f) = promise::<&'static str, String>();
        p.set_value("hello");
        assert_eq!(f.await, Ok("hello"));
    }

    #[test]
    fn ready_and_failed_helpers() {
        let f: Future<i32, String> = ready(5);
        assert_eq!(f.is_ready(), true);
        let g: Future<i32, String> = failed("boom".to_string());
        assert!(g.is_ready());
    }

    #[tokio::test]
    async fn within_resolves_with_the_value_when_it_beats_the_timer() {
        let (lp, handle) = crate::reactor::reactor_loop::Loop::new();
        std::thread::spawn(move || lp.run());

        let (p, f) = promise::<i32, String>();
        p.set_value(7);
        let raced = f.within(std::time::Duration::from_secs(10), &handle, || "timed out".to_string());
        assert_eq!(raced.await, Ok(7));
        handle.stop();
    }

    #[tokio::test]
    async fn within_resolves_with_timeout_when_the_future_never_completes() {
        let (lp, handle) = crate::reactor::reactor_loop::Loop::new();
        std::thread::spawn(move || lp.run());

        let (_p, f) = promise::<i32, String>();
        let raced = f.within(std::time::Duration::from_millis(20), &handle, || "timed out".to_string());
        assert_eq!(raced.await, Err("timed out".to_string()));
        handle.stop();
    }
}
