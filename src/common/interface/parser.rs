use async_trait::async_trait;

use crate::common::model::{Request, Response, TaskRow, Yield, YieldStream, empty, yields};
use crate::errors::{Error, Result};

/// User crawl logic.
///
/// Every method producing results returns a lazily evaluated
/// [`YieldStream`]; the dispatch loop pulls values one at a time and routes
/// each as it arrives.
#[async_trait]
pub trait Parser: Send + Sync {
    /// Registry key, matched against `Request::parser_name`.
    fn name(&self) -> &str;

    /// Seed requests. `task` is the claimed task row in batch mode.
    fn start_requests<'a>(&'a self, _task: Option<&'a TaskRow>) -> YieldStream<'a> {
        empty()
    }

    /// Handles a response when the request names no callback.
    fn parse<'a>(&'a self, request: &'a Request, response: &'a Response) -> YieldStream<'a>;

    /// Named callbacks (`Request::callback`). `None` for unknown names.
    fn dispatch_callback<'a>(
        &'a self,
        _name: &str,
        _request: &'a Request,
        _response: &'a Response,
    ) -> Option<YieldStream<'a>> {
        None
    }

    /// Rejecting a response ends the attempt without counting it as an error.
    async fn validate(&self, _request: &Request, _response: &Response) -> Result<bool> {
        Ok(true)
    }

    /// Last chance to rewrite a request before it is downloaded.
    async fn download_midware(&self, request: Request) -> Result<Request> {
        Ok(request)
    }

    /// Runs when an attempt fails. Yielded requests replace the failing one for
    /// the retry decision; yielding none suppresses the retry.
    fn exception_request<'a>(
        &'a self,
        request: &'a Request,
        _response: Option<&'a Response>,
        _error: &'a Error,
    ) -> YieldStream<'a> {
        yields([Yield::Request(request.clone())])
    }

    /// Runs once retries are exhausted. Yielded requests are parked as failed
    /// requests when that is enabled.
    fn failed_request<'a>(
        &'a self,
        request: &'a Request,
        _response: Option<&'a Response>,
        _error: &'a Error,
    ) -> YieldStream<'a> {
        yields([Yield::Request(request.clone())])
    }

    /// Called once when the scheduler stops.
    async fn close(&self) {}
}
