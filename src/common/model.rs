pub mod item;
pub mod request;
pub mod response;
pub mod task;
pub mod yields;

pub use item::Item;
pub use request::Request;
pub use response::Response;
pub use task::{BatchRecord, TaskCounts, TaskRow, TaskState};
pub use yields::{Callback, Yield, YieldStream, boxed_callback, callback, empty, yields};
