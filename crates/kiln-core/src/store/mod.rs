//! Durable state: the SQLite build store and the on-disk workspace store.
//!
//! The two stores are deliberately independent; the dispatcher reconciles
//! them every tick. Nothing in here spans both with a transaction.

pub mod db;
pub mod fs;
pub mod logs;
