//! The event loop, loop groups, and timers.

pub mod group;
pub mod reactor_loop;
pub mod timer;

pub use group::LoopGroup;
pub use reactor_loop::{Loop, LoopHandle};
pub use timer::{RepeatCount, TimerToken};
