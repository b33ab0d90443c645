//! crawl-relay: the delivery core of a distributed crawler.
//!
//! A shared, leased, priority-ordered request backlog; fingerprint dedup;
//! buffered request/item writers with retry; a collector feeding dispatch
//! loops; and an optional batch task state machine over SQL task tables.

pub mod prelude;

pub mod backlog;
pub mod buffer;
pub mod collector;
pub mod common;
pub mod dedup;
pub mod engine;
pub mod errors;
pub mod utils;
