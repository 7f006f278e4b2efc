//! Backpressure-aware streams: a readable stream, a writable stream, and a
//! transform stream coupling one of each.
//!
//! Every stream is driven by a future that the caller spawns on an executor
//! of their choice (see the `spawn`/`prepare` methods on the builders).
//! Readers and writers are exclusive-lock capabilities over a stream; data
//! flows `Source -> ReadableStream -> reader -> writer -> WritableStream -> Sink`,
//! and `pipe_to`/`pipe_through` drive that loop for you.

mod platform;
pub mod streams;

pub use streams::*;
