//! WHATWG Streams for async Rust: readable, writable and transform streams
//! with backpressure, plus `pipe_to`, `pipe_through` and `tee`.
//!
//! Every stream is a cheap handle over shared state. Builders hand back the
//! stream together with the future that drives its source or sink, so any
//! executor can run it.

pub mod platform;
pub mod streams;

pub use streams::*;
