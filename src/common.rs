pub mod config;
pub mod downloader;
pub mod interface;
pub mod model;
pub mod registry;
pub mod stats;
