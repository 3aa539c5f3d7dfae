//! Keeps mirror repositories in step with their upstreams.

pub mod worker;

pub use worker::MirrorWorker;
