//! A fixed-size pool of loops, each on its own OS thread.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread::JoinHandle,
};

use tracing::info;

use crate::reactor::reactor_loop::{Loop, LoopHandle};

/// `size` loops, round-robin dispatched via [`LoopGroup::next`]. Cheap to
/// clone — every clone shares the same underlying thread pool, the way the
/// source library's pool handles are passed around by value.
#[derive(Clone)]
pub struct LoopGroup {
    handles: Arc<Vec<LoopHandle>>,
    cursor: Arc<AtomicUsize>,
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl LoopGroup {
    /// Spawns `size` loops, each on its own thread, and starts running them
    /// immediately. `size` must be at least 1.
    pub fn start(size: usize) -> Self {
        assert!(size > 0, "LoopGroup size must be at least 1");

        let mut handles = Vec::with_capacity(size);
        let mut loops = Vec::with_capacity(size);
        for _ in 0..size {
            let (lp, handle) = Loop::new();
            handles.push(handle);
            loops.push(lp);
        }

        let threads = loops
            .into_iter()
            .enumerate()
            .map(|(i, lp)| {
                std::thread::Builder::new()
                    .name(format!("reactor-loop-{i}"))
                    .spawn(move || lp.run())
                    .expect("failed to spawn loop thread")
            })
            .collect();

        info!(size, "loop group started");
        Self {
            handles: Arc::new(handles),
            cursor: Arc::new(AtomicUsize::new(0)),
            threads: Arc::new(Mutex::new(threads)),
        }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Returns the next loop handle in round-robin order.
    pub fn next(&self) -> LoopHandle {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        self.handles[i].clone()
    }

    pub fn handles(&self) -> &[LoopHandle] {
        &self.handles
    }

    /// Signals every loop in the group to stop its task pump. Does not
    /// block; call [`LoopGroup::wait`] to join the threads.
    pub fn stop(&self) {
        for h in self.handles.iter() {
            h.stop();
        }
    }

    /// Blocks until every loop thread has exited. Safe to call more than
    /// once; later calls are no-ops once the threads have been joined.
    pub fn wait(&self) {
        let mut threads = self.threads.lock().expect("threads mutex poisoned");
        for t in threads.drain(..) {
            let _ = t.join();
        }
    }
}
