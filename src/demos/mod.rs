//! Sample services shipped alongside the library, wired up by `src/main.rs`.
//! Not part of the core reactor/RPC API; kept separate so the library crate
//! itself stays free of any one protocol's opinions.

pub mod echo_service;
