pub mod downloader;
pub mod notifier;
pub mod parser;
pub mod pipeline;

pub use downloader::Downloader;
pub use notifier::{AlertLevel, LogNotifier, Notifier};
pub use parser::Parser;
pub use pipeline::{ConsolePipeline, StoragePipeline};
