//! Single-assignment result cell with continuations (§4.F).

mod promise;

pub use promise::{Future, Promise, Resolved, failed, promise, ready};
