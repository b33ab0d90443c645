use futures::StreamExt;
use futures::future::{BoxFuture, FutureExt};
use log::{debug, error, warn};
use metrics::counter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::Instrument;

use crate::backlog::JobStore;
use crate::buffer::{BufferEntry, ItemBuffer, RequestBuffer};
use crate::collector::Collector;
use crate::common::config::Config;
use crate::common::interface::{Downloader, Parser};
use crate::common::model::{Request, Response, Yield, YieldStream};
use crate::common::registry::ParserSet;
use crate::common::stats::SpiderStats;
use crate::engine::cache::ResponseCache;
use crate::errors::{Error, ParserError, Result};

const POLL_WAIT: Duration = Duration::from_secs(1);

/// Everything a dispatch loop routes into, shared by all loops of a process.
pub struct DispatchContext {
    pub config: Arc<Config>,
    pub parsers: Arc<ParserSet>,
    pub downloader: Arc<dyn Downloader>,
    pub collector: Arc<Collector>,
    pub request_buffer: Arc<RequestBuffer>,
    pub item_buffer: Arc<ItemBuffer>,
    pub job_store: Arc<dyn JobStore>,
    pub stats: Arc<SpiderStats>,
    pub cache: Option<Arc<ResponseCache>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastYield {
    Request,
    Item,
}

/// Bookkeeping over the yields of one attempt.
#[derive(Debug, Default)]
pub struct Routed {
    last: Option<LastYield>,
    pub produced_item: bool,
    pub requests: usize,
    pub items: usize,
}

impl DispatchContext {
    /// Routes one yielded value. A synchronous follow-up request is handed
    /// back to the caller instead of being buffered.
    pub async fn route(&self, value: Yield, parser: &dyn Parser, routed: &mut Routed) -> Result<Option<Request>> {
        match value {
            Yield::Request(mut request) => {
                if request.parser_name.is_none() {
                    request.parser_name = Some(parser.name().to_string());
                }
                routed.last = Some(LastYield::Request);
                routed.requests += 1;
                if request.request_sync {
                    return Ok(Some(request));
                }
                self.request_buffer.put_request(request).await;
            }
            Yield::Item(item) => {
                routed.last = Some(LastYield::Item);
                routed.produced_item = true;
                routed.items += 1;
                self.item_buffer.put(item).await;
            }
            Yield::Callback(callback) => match routed.last {
                Some(LastYield::Item) => self.item_buffer.put(BufferEntry::Callback(callback)).await,
                _ => self.request_buffer.put_callback(callback).await,
            },
            Yield::None => {}
            Yield::Invalid(desc) => return Err(Error::invalid_yield(desc)),
        }
        Ok(None)
    }

    /// Routes seed yields (`start_requests`). Nothing is leased yet, so
    /// synchronous requests are buffered like any other.
    pub async fn route_seed(&self, mut stream: YieldStream<'_>, parser: &dyn Parser) -> Result<Routed> {
        let mut routed = Routed::default();
        while let Some(value) = stream.next().await {
            if let Some(request) = self.route(value?, parser, &mut routed).await? {
                self.request_buffer.put_request(request).await;
            }
        }
        Ok(routed)
    }
}

/// State carried through one dispatch attempt, kept for the error hooks.
struct Attempt {
    request: Request,
    response: Option<Response>,
}

enum Outcome {
    Parsed,
    Rejected,
}

/// One dispatch loop: takes requests off the collector and runs them through
/// download, validation, parsing and result routing.
pub struct ParserControl {
    id: usize,
    ctx: Arc<DispatchContext>,
    busy: AtomicBool,
    stop: AtomicBool,
}

impl ParserControl {
    pub fn new(id: usize, ctx: Arc<DispatchContext>) -> Self {
        Self {
            id,
            ctx,
            busy: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub async fn run(self: Arc<Self>) {
        debug!("dispatch loop {} started", self.id);
        let pause = self.ctx.config.spider.sleep_time();
        while !self.stop.load(Ordering::SeqCst) {
            let Some(request) = self.ctx.collector.get_request(POLL_WAIT).await else {
                continue;
            };
            self.busy.store(true, Ordering::SeqCst);
            self.process(request).await;
            self.busy.store(false, Ordering::SeqCst);
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }
        debug!("dispatch loop {} stopped", self.id);
    }

    /// Dispatches one request to completion, including retries handed back
    /// to the request buffer and release of its backlog member. Returns
    /// whether any item was produced.
    pub fn process<'a>(&'a self, request: Request) -> BoxFuture<'a, bool> {
        let span = tracing::info_span!(
            "request",
            fingerprint = %request.fingerprint(),
            url = %request.url,
            retry = request.retry_times
        );
        self.process_inner(request).instrument(span).boxed()
    }

    async fn process_inner(&self, mut request: Request) -> bool {
        let ctx = &self.ctx;
        ctx.stats.record_attempt();
        let member = request.take_backlog_member();

        let parser = match ctx.parsers.resolve(request.parser_name.as_deref()) {
            Ok(parser) => parser,
            Err(e) => {
                error!("{e}, dropping {}", request.url);
                ctx.stats.record_failed(request.parser_label());
                self.release(member, false).await;
                return false;
            }
        };

        let mut routed = Routed::default();
        let mut attempt = Attempt {
            request,
            response: None,
        };
        match self.attempt(parser.as_ref(), &mut attempt, &mut routed).await {
            Ok(Outcome::Parsed) => {
                ctx.stats.record_success(parser.name());
            }
            Ok(Outcome::Rejected) => {
                debug!("response of {} rejected by {}", attempt.request.url, parser.name());
            }
            Err(e) => {
                ctx.stats.record_failed(parser.name());
                self.handle_error(parser.as_ref(), &attempt, e, &mut routed).await;
            }
        }

        ctx.downloader.release(&attempt.request).await;
        self.release(member, routed.produced_item).await;
        routed.produced_item
    }

    async fn attempt(&self, parser: &dyn Parser, attempt: &mut Attempt, routed: &mut Routed) -> Result<Outcome> {
        attempt.request = parser.download_midware(attempt.request.clone()).await?;
        let response = if attempt.request.auto_request {
            self.fetch(&attempt.request).await?
        } else {
            Response::empty(attempt.request.url.clone())
        };
        attempt.response = Some(response);
        let request = &attempt.request;
        let Some(response) = attempt.response.as_ref() else {
            return Ok(Outcome::Rejected);
        };

        if !parser.validate(request, response).await? {
            return Ok(Outcome::Rejected);
        }

        let mut stream = match &request.callback {
            Some(name) => parser
                .dispatch_callback(name, request, response)
                .ok_or_else(|| ParserError::CallbackNotFound(name.clone()))?,
            None => parser.parse(request, response),
        };
        while let Some(value) = stream.next().await {
            if let Some(sync) = self.ctx.route(value?, parser, routed).await? {
                routed.produced_item |= self.process(sync).await;
            }
        }

        if let Some(cache) = &self.ctx.cache {
            if request.auto_request && !response.from_cache {
                if let Err(e) = cache.put(&request.fingerprint(), response).await {
                    warn!("caching response of {} failed: {e}", request.url);
                }
            }
        }
        Ok(Outcome::Parsed)
    }

    async fn fetch(&self, request: &Request) -> Result<Response> {
        if let Some(cache) = &self.ctx.cache {
            match cache.get(&request.fingerprint()).await {
                Ok(Some(response)) => return Ok(response),
                Ok(None) => {}
                Err(e) => warn!("response cache lookup failed: {e}"),
            }
        }
        let response = self.ctx.downloader.download(request).await?;
        counter!("spider_download_total", "parser" => request.parser_label().to_string()).increment(1);
        Ok(response)
    }

    /// RETRY or TERMINAL_FAILURE for a failed attempt.
    async fn handle_error(&self, parser: &dyn Parser, attempt: &Attempt, error: Error, routed: &mut Routed) {
        let max_retry = self.ctx.config.spider.max_retry_times;
        let request = &attempt.request;
        let response = attempt.response.as_ref();

        if error.is_fatal() {
            error!("{} yielded an invalid value for {}: {error}", parser.name(), request.url);
            self.terminal_failure(parser, request.clone(), response, &error, routed).await;
            return;
        }

        let candidates = match self
            .collect_hook(parser, parser.exception_request(request, response, &error), routed)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                error!("{} exception hook failed, deciding on {} as is: {e}", parser.name(), request.url);
                vec![request.clone()]
            }
        };
        if candidates.is_empty() {
            debug!("retry of {} suppressed by exception hook", request.url);
        }
        for candidate in candidates {
            if candidate.retry_times < max_retry && !candidate.is_abandoned {
                let retry = candidate.rearm_for_retry();
                warn!(
                    "retry {} ({}/{}): {error}",
                    retry.url, retry.retry_times, max_retry
                );
                self.ctx.request_buffer.put_request(retry).await;
            } else {
                self.terminal_failure(parser, candidate, response, &error, routed).await;
            }
        }
    }

    async fn terminal_failure(
        &self,
        parser: &dyn Parser,
        request: Request,
        response: Option<&Response>,
        error: &Error,
        routed: &mut Routed,
    ) {
        error!(
            "giving up on {} after {} retries: {error}",
            request.url, request.retry_times
        );
        let hooked = self
            .collect_hook(parser, parser.failed_request(&request, response, error), routed)
            .await;
        let failed = match hooked {
            Ok(failed) => failed,
            Err(e) => {
                error!("{} failed-request hook failed for {}: {e}", parser.name(), request.url);
                vec![request]
            }
        };
        if !self.ctx.config.spider.save_failed_request {
            return;
        }
        for request in failed {
            let member = match request.to_member() {
                Ok(member) => member,
                Err(e) => {
                    error!("cannot persist failed request {}: {e}", request.url);
                    continue;
                }
            };
            if let Err(e) = self.ctx.job_store.park_failed_request(&member, request.score()).await {
                error!("persisting failed request {} failed: {e}", request.url);
            }
        }
    }

    /// Drains a hook stream: requests are returned, everything else routed.
    /// A failing stream discards the requests collected so far.
    async fn collect_hook(
        &self,
        parser: &dyn Parser,
        mut stream: YieldStream<'_>,
        routed: &mut Routed,
    ) -> Result<Vec<Request>> {
        let mut requests = Vec::new();
        while let Some(value) = stream.next().await {
            match value? {
                Yield::Request(request) => requests.push(request),
                other => {
                    if let Err(e) = self.ctx.route(other, parser, routed).await {
                        error!("{} hook yielded an unusable value: {e}", parser.name());
                    }
                }
            }
        }
        Ok(requests)
    }

    /// Marks the attempt done in the backlog. With items pending, the delete
    /// waits for them to be stored.
    async fn release(&self, member: Option<String>, produced_item: bool) {
        let Some(member) = member else {
            return;
        };
        if produced_item {
            self.ctx.item_buffer.put(BufferEntry::DeleteRequest(member)).await;
        } else {
            self.ctx.request_buffer.put_del_request(member).await;
        }
    }
}
