//! Write-behind buffers between the dispatch loops and shared storage.
//!
//! [`RequestBuffer`] batches follow-up requests into the backlog;
//! [`ItemBuffer`] batches items into storage pipelines. Both release backlog
//! members of finished requests and run deferred callbacks once the data they
//! depend on has been flushed.

pub mod item_buffer;
pub mod request_buffer;

pub use item_buffer::{BufferEntry, FailedItems, ItemBuffer, ItemBufferSettings, TableBatch};
pub use request_buffer::{RequestBuffer, RequestBufferSettings};
