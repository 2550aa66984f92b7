//! Cancellable one-shot and repeating timers.
//!
//! Timers are spawned as plain `tokio::time::sleep`-backed tasks on the
//! owning loop's current-thread runtime rather than through a hand-rolled
//! min-heap: tokio's own timer wheel already gives us that, and duplicating
//! it would just be reinventing what the runtime provides.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// A handle returned by `LoopHandle::schedule_after`/`schedule_after_with_repeat`.
/// Dropping it does not cancel the timer; call [`TimerToken::cancel`]
/// explicitly. Cancelling an already-fired (non-repeating) timer is a no-op.
#[derive(Debug, Clone)]
pub struct TimerToken {
    cancel: CancellationToken,
}

impl TimerToken {
    pub(crate) fn new() -> (Self, CancellationToken) {
        let cancel = CancellationToken::new();
        (
            Self {
                cancel: cancel.clone(),
            },
            cancel,
        )
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// How many times a repeating timer should fire. `Finite(0)` fires never,
/// matching `ScheduleAfterWithRepeat<0>` being a no-op in the source.
#[derive(Debug, Clone, Copy)]
pub enum RepeatCount {
    Finite(u64),
    Forever,
}

impl RepeatCount {
    pub fn once() -> Self {
        RepeatCount::Finite(1)
    }
}

/// Runs `cb` every `period` against a fixed schedule anchored at the call
/// time, so slow callbacks or scheduler jitter don't accumulate drift: each
/// tick waits until `start + k * period`, not `last_tick + period`.
pub(crate) async fn run_repeating(
    period: Duration,
    count: RepeatCount,
    cancel: CancellationToken,
    mut cb: impl FnMut(u64) + Send + 'static,
) {
    let start = tokio::time::Instant::now();
    let mut tick: u64 = 0;
    loop {
        match count {
            RepeatCount::Finite(n) if tick >= n => return,
            _ => {},
        }
        let deadline = start + period * (tick as u32 + 1);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {},
        }
        tick += 1;
        cb(tick);
    }
}
