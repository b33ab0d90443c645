// Traits
pub use crate::backlog::{Backlog, JobStore};
pub use crate::common::interface::{
    AlertLevel, ConsolePipeline, Downloader, LogNotifier, Notifier, Parser, StoragePipeline,
};
pub use crate::dedup::DedupFilter;
pub use crate::engine::TaskStore;

// Models
pub use crate::common::config::{BatchConfig, Config, SpiderConfig};
pub use crate::common::model::{
    BatchRecord, Callback, Item, Request, Response, TaskCounts, TaskRow, TaskState, Yield,
    YieldStream, boxed_callback, callback, empty, yields,
};

// Runtime
pub use crate::backlog::{MemoryBacklog, RedisBacklog};
pub use crate::engine::{MemoryTaskStore, Scheduler, SqlTaskStore, update_task_state};

// Errors
pub use crate::errors::{BoxError, Error, ErrorKind, ParserError, Result};

pub use async_trait::async_trait;
