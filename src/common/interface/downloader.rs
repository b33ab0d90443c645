use async_trait::async_trait;

use crate::common::model::{Request, Response};
use crate::errors::Result;

#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, request: &Request) -> Result<Response>;

    /// Returns pooled resources (e.g. a rendering browser) held for
    /// `request`. Called after every attempt whatever its outcome.
    async fn release(&self, _request: &Request) {}
}
