//! Build execution: commit checkout, sandboxed command running, the
//! out-of-process builder, its supervision, and the dispatch loop.

pub mod builder;
pub mod controller;
pub mod git;
pub mod processor;
pub mod runner;
