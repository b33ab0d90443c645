use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backlog::{Backlog, JobStore, MemoryBacklog, RedisBacklog};
use crate::buffer::{ItemBuffer, ItemBufferSettings, RequestBuffer, RequestBufferSettings};
use crate::collector::Collector;
use crate::common::config::Config;
use crate::common::downloader::HttpDownloader;
use crate::common::interface::{Downloader, LogNotifier, Notifier, Parser, StoragePipeline};
use crate::common::model::Request;
use crate::common::model::request::MAX_PRIORITY;
use crate::common::registry::{FilterRegistry, ParserRegistry, ParserSet, PipelineRegistry};
use crate::common::stats::{SpiderStats, StatsSnapshot};
use crate::dedup::Dedup;
use crate::engine::batch::BatchController;
use crate::engine::cache::ResponseCache;
use crate::engine::health::{HealthMonitor, STATUS_END_TIME, STATUS_START_TIME};
use crate::engine::parser_control::{DispatchContext, ParserControl};
use crate::engine::task_store::{SqlTaskStore, TaskStore};
use crate::errors::{ConfigError, Result};
use crate::utils::connector::{create_redis_pool, sql_connection};
use crate::utils::logger::{LoggerConfig, init_logger};
use crate::utils::redis_lock::LockManager;
use crate::utils::timestamp;

const IDLE_SAMPLES: u32 = 3;
const IDLE_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
/// Scores from here up are lease deadlines (unix seconds), not priorities.
const LEASE_SCORE_FLOOR: f64 = (MAX_PRIORITY + 1) as f64;
const SEED_LOCK_TTL_SECS: u64 = 300;

struct Running {
    ctx: Arc<DispatchContext>,
    controls: Vec<Arc<ParserControl>>,
    batch: Option<Arc<BatchController>>,
    shutdown: watch::Sender<bool>,
    dispatch_handles: Vec<JoinHandle<()>>,
    buffer_handles: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

/// Wires the backlog, buffers, collector and dispatch loops of one job and
/// runs them until the job goes idle.
pub struct Scheduler {
    config: Arc<Config>,
    parsers: ParserSet,
    pipelines: Vec<Arc<dyn StoragePipeline>>,
    downloader: Option<Arc<dyn Downloader>>,
    notifier: Arc<dyn Notifier>,
    task_store: Option<Arc<dyn TaskStore>>,
    filters: Option<Arc<FilterRegistry>>,
    pool: Option<deadpool_redis::Pool>,
    backlog: Arc<dyn Backlog>,
    job_store: Arc<dyn JobStore>,
    related_backlog: Option<Arc<dyn Backlog>>,
    stats: Arc<SpiderStats>,
    running: Option<Running>,
}

impl Scheduler {
    /// Validates `config` and connects the backlog: redis when configured,
    /// process memory otherwise.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        if config.logger.enabled {
            init_logger(LoggerConfig::from(&config.logger))?;
        }
        let pool = config.redis.as_ref().map(create_redis_pool).transpose()?;
        let mut related_backlog: Option<Arc<dyn Backlog>> = None;
        let (backlog, job_store): (Arc<dyn Backlog>, Arc<dyn JobStore>) = match &pool {
            Some(pool) => {
                let redis = Arc::new(RedisBacklog::new(pool.clone(), &config.name));
                if let Some(job) = config.batch.as_ref().and_then(|b| b.related_job.as_deref()) {
                    let related: Arc<dyn Backlog> = Arc::new(RedisBacklog::new(pool.clone(), job));
                    related_backlog = Some(related);
                }
                let backlog: Arc<dyn Backlog> = redis.clone();
                let job_store: Arc<dyn JobStore> = redis;
                (backlog, job_store)
            }
            None => {
                let memory = Arc::new(MemoryBacklog::new());
                let backlog: Arc<dyn Backlog> = memory.clone();
                let job_store: Arc<dyn JobStore> = memory;
                (backlog, job_store)
            }
        };
        Ok(Self {
            config: Arc::new(config),
            parsers: ParserSet::new(),
            pipelines: Vec::new(),
            downloader: None,
            notifier: Arc::new(LogNotifier),
            task_store: None,
            filters: None,
            pool,
            backlog,
            job_store,
            related_backlog,
            stats: Arc::new(SpiderStats::new()),
            running: None,
        })
    }

    /// Replaces the backlog and job store, e.g. with a shared in-memory one.
    pub fn with_backlog<B>(mut self, backlog: Arc<B>) -> Self
    where
        B: Backlog + JobStore + 'static,
    {
        self.backlog = backlog.clone();
        self.job_store = backlog;
        self
    }

    pub fn with_related_backlog(mut self, backlog: Arc<dyn Backlog>) -> Self {
        self.related_backlog = Some(backlog);
        self
    }

    pub fn with_downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.task_store = Some(store);
        self
    }

    /// Registry for custom dedup strategy names.
    pub fn with_filter_registry(mut self, registry: Arc<FilterRegistry>) -> Self {
        self.filters = Some(registry);
        self
    }

    pub fn add_parser(&mut self, parser: Arc<dyn Parser>) -> &mut Self {
        self.parsers.add(parser);
        self
    }

    pub fn add_pipeline(&mut self, pipeline: Arc<dyn StoragePipeline>) -> &mut Self {
        self.pipelines.push(pipeline);
        self
    }

    /// Adds the parser registered as `name`.
    pub fn add_registered_parser(&mut self, registry: &ParserRegistry, name: &str) -> Result<&mut Self> {
        let parser = registry.build(name, &self.config)?;
        Ok(self.add_parser(parser))
    }

    pub fn add_registered_pipeline(&mut self, registry: &PipelineRegistry, name: &str) -> Result<&mut Self> {
        let pipeline = registry.build(name, &self.config)?;
        Ok(self.add_pipeline(pipeline))
    }

    pub fn backlog(&self) -> Arc<dyn Backlog> {
        self.backlog.clone()
    }

    pub fn job_store(&self) -> Arc<dyn JobStore> {
        self.job_store.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    fn dedup(&self, kind: &str, enabled: bool) -> Result<Option<Arc<Dedup>>> {
        if !enabled {
            return Ok(None);
        }
        let namespace = format!("{}:{kind}", self.config.name);
        let dedup = Dedup::get_or_init(&namespace, || {
            Dedup::from_config(&namespace, &self.config, self.pool.clone(), self.filters.as_deref())
        })?;
        Ok(Some(dedup))
    }

    fn request_buffer(&self) -> Result<Arc<RequestBuffer>> {
        let dedup = self.dedup("request", self.config.spider.request_filter_enable)?;
        Ok(Arc::new(RequestBuffer::new(
            self.backlog.clone(),
            dedup,
            RequestBufferSettings::from(&self.config.spider),
        )))
    }

    /// Writes `requests` straight into the backlog. Goes through the running
    /// request buffer when started.
    pub async fn seed(&self, requests: impl IntoIterator<Item = Request>) -> Result<usize> {
        let buffer = match &self.running {
            Some(running) => running.ctx.request_buffer.clone(),
            None => self.request_buffer()?,
        };
        for request in requests {
            buffer.put_request(request).await;
        }
        buffer.flush().await
    }

    /// Moves up to `limit` parked failed requests back into the backlog
    /// with their retry count reset.
    pub async fn replay_failed_requests(&self, limit: usize) -> Result<usize> {
        let members = self.job_store.take_failed_requests(limit).await?;
        let mut entries = Vec::with_capacity(members.len());
        for member in members {
            match Request::from_member(&member) {
                Ok(mut request) => {
                    request.retry_times = 0;
                    request.filter_repeat = false;
                    request.take_backlog_member();
                    entries.push((request.to_member()?, request.score()));
                }
                Err(e) => warn!("dropping malformed failed request: {e}"),
            }
        }
        if !entries.is_empty() {
            self.backlog.enqueue(&entries).await?;
            info!("replayed {} failed requests", entries.len());
        }
        Ok(entries.len())
    }

    /// Resubmits up to `limit` persisted failed item batches through the
    /// running item buffer.
    pub async fn recover_failed_items(&self, limit: usize) -> Result<usize> {
        match &self.running {
            Some(running) => running.ctx.item_buffer.recover_failed_items(limit).await,
            None => Err(ConfigError::Invalid("scheduler is not running".into()).into()),
        }
    }

    /// Rescores leases that expired before this process started back to
    /// their request priority.
    pub async fn reclaim_expired_leases(&self) -> Result<usize> {
        let chunk = self.config.spider.backlog_chunk_size.max(1);
        let hold = timestamp() + self.config.spider.lease_timeout().as_secs_f64();
        let mut reclaimed = 0;
        loop {
            let members = self
                .backlog
                .lease_range(LEASE_SCORE_FLOOR, timestamp(), hold, chunk)
                .await?;
            if members.is_empty() {
                break;
            }
            let mut entries = Vec::with_capacity(members.len());
            for member in members {
                match Request::from_member(&member) {
                    Ok(request) => {
                        let score = request.score();
                        entries.push((member, score));
                    }
                    // left under the new lease
                    Err(e) => warn!("skipping malformed backlog member: {e}"),
                }
            }
            reclaimed += entries.len();
            self.backlog.enqueue(&entries).await?;
        }
        if reclaimed > 0 {
            info!("reclaimed {reclaimed} expired leases");
        }
        Ok(reclaimed)
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        if self.parsers.is_empty() {
            return Err(ConfigError::Invalid("no parser registered".into()).into());
        }
        let config = self.config.clone();
        let spider = &config.spider;
        info!(
            "starting {} with {} dispatch loops, parsers: {:?}",
            config.name, spider.thread_count, self.parsers
        );

        if spider.reclaim_on_start {
            self.reclaim_expired_leases().await?;
        }

        if let (Some(batch), None, Some(db)) = (&config.batch, &self.task_store, &config.db) {
            let conn = sql_connection(db).await?;
            self.task_store = Some(Arc::new(SqlTaskStore::new(conn, batch.clone())));
        }

        let request_buffer = self.request_buffer()?;
        let mut item_buffer = ItemBuffer::new(
            ItemBufferSettings::from(spider),
            self.backlog.clone(),
            self.job_store.clone(),
        )
        .with_pipelines(self.pipelines.clone())
        .with_dedup(self.dedup("item", spider.item_filter_enable)?)
        .with_notifier(self.notifier.clone());
        if let (Some(batch), Some(store)) = (&config.batch, &self.task_store) {
            item_buffer = item_buffer.with_task_store(batch.task_table.clone(), store.clone());
        }
        let item_buffer = Arc::new(item_buffer);

        let downloader = match &self.downloader {
            Some(downloader) => downloader.clone(),
            None => Arc::new(HttpDownloader::new()?) as Arc<dyn Downloader>,
        };
        let cache = (spider.response_cache_secs > 0).then(|| {
            Arc::new(ResponseCache::new(
                self.pool.clone(),
                &config.name,
                Duration::from_secs(spider.response_cache_secs),
            ))
        });
        let collector = Arc::new(Collector::new(self.backlog.clone(), spider));

        let parsers = std::mem::take(&mut self.parsers);
        let ctx = Arc::new(DispatchContext {
            config: config.clone(),
            parsers: Arc::new(parsers),
            downloader,
            collector: collector.clone(),
            request_buffer: request_buffer.clone(),
            item_buffer: item_buffer.clone(),
            job_store: self.job_store.clone(),
            stats: self.stats.clone(),
            cache,
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let buffer_handles = vec![
            tokio::spawn(request_buffer.clone().run()),
            tokio::spawn(item_buffer.clone().run()),
        ];
        let mut background = vec![tokio::spawn(collector.clone().run())];

        let controls: Vec<Arc<ParserControl>> = (0..spider.thread_count)
            .map(|id| Arc::new(ParserControl::new(id, ctx.clone())))
            .collect();
        let dispatch_handles = controls.iter().map(|c| tokio::spawn(c.clone().run())).collect();

        let health = Arc::new(HealthMonitor::new(
            config.name.clone(),
            config.health.clone(),
            self.backlog.clone(),
            self.job_store.clone(),
            self.stats.clone(),
            self.notifier.clone(),
        ));
        background.push(tokio::spawn(health.clone().run_heartbeat(shutdown_rx.clone())));
        background.push(tokio::spawn(health.run_checks(shutdown_rx.clone())));

        let batch = match (&config.batch, &self.task_store) {
            (Some(batch_config), Some(store)) => {
                let mut controller = BatchController::new(
                    batch_config.clone(),
                    store.clone(),
                    self.backlog.clone(),
                    LockManager::new(self.pool.clone(), &config.name),
                    ctx.clone(),
                );
                if let Some(related) = &self.related_backlog {
                    controller = controller.with_related_backlog(related.clone());
                }
                let controller = Arc::new(controller);
                background.push(tokio::spawn(controller.clone().run(shutdown_rx.clone())));
                Some(controller)
            }
            (Some(_), None) => {
                warn!("batch configured without a task store, running as a plain job");
                None
            }
            _ => None,
        };

        if let Err(e) = self
            .job_store
            .set_status(STATUS_START_TIME, &timestamp().to_string())
            .await
        {
            warn!("recording start time failed: {e}");
        }

        let shutdown_tx = shutdown.clone();
        background.push(tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("received Ctrl+C, shutting down");
                let _ = shutdown_tx.send(true);
            }
        }));

        self.running = Some(Running {
            ctx,
            controls,
            batch,
            shutdown,
            dispatch_handles,
            buffer_handles,
            background,
        });

        let batch_mode = self.running.as_ref().is_some_and(|r| r.batch.is_some());
        if !batch_mode {
            self.seed_start_requests().await?;
        }
        Ok(())
    }

    /// Runs every parser's `start_requests` once, cluster-wide, when the
    /// backlog is empty.
    async fn seed_start_requests(&self) -> Result<()> {
        let Some(running) = &self.running else {
            return Ok(());
        };
        let locks = LockManager::new(self.pool.clone(), &self.config.name);
        let ctx = running.ctx.clone();
        let backlog = self.backlog.clone();
        let seeded = locks
            .with_lock("start_requests", SEED_LOCK_TTL_SECS, Duration::ZERO, async move {
                if backlog.total().await? > 0 {
                    info!("backlog not empty, skipping start_requests");
                    return Ok(0);
                }
                let mut requests = 0;
                for parser in ctx.parsers.all() {
                    let routed = ctx
                        .route_seed(parser.start_requests(None), parser.as_ref())
                        .await?;
                    requests += routed.requests;
                }
                ctx.request_buffer.flush().await?;
                Ok::<usize, crate::errors::Error>(requests)
            })
            .await?;
        match seeded {
            Some(Ok(n)) => info!("seeded {n} start requests"),
            Some(Err(e)) => error!("start_requests failed: {e}"),
            None => info!("another node is seeding start_requests"),
        }
        Ok(())
    }

    /// One idle sample: nothing leased, queued, buffered or in flight.
    pub async fn is_idle(&self) -> Result<bool> {
        let Some(running) = &self.running else {
            return Ok(true);
        };
        let ctx = &running.ctx;
        if ctx.collector.is_collecting()
            || ctx.collector.queue_len() > 0
            || running.controls.iter().any(|c| c.is_busy())
            || ctx.request_buffer.is_flushing()
            || ctx.item_buffer.is_flushing()
        {
            return Ok(false);
        }
        if ctx.request_buffer.queued_count().await > 0 || ctx.item_buffer.queued_count().await > 0 {
            return Ok(false);
        }
        if ctx.collector.backlog_count().await? > 0 {
            return Ok(false);
        }
        match &running.batch {
            Some(batch) => batch.is_idle().await,
            None => Ok(true),
        }
    }

    /// Starts if needed and blocks until the job is idle (or forever with
    /// `keep_alive`) or Ctrl+C, then stops.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        let mut shutdown = match &self.running {
            Some(running) => running.shutdown.subscribe(),
            None => return Ok(()),
        };
        let mut ticker = tokio::time::interval(IDLE_SAMPLE_INTERVAL);
        let mut idle_samples = 0;
        let mut announced = false;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            match self.is_idle().await {
                Ok(true) => idle_samples += 1,
                Ok(false) => {
                    idle_samples = 0;
                    announced = false;
                }
                Err(e) => {
                    error!("idle check failed: {e}");
                    idle_samples = 0;
                }
            }
            if idle_samples < IDLE_SAMPLES {
                continue;
            }
            if !self.config.spider.keep_alive {
                info!("{} has no work left", self.config.name);
                break;
            }
            if !announced {
                info!("{} idle, waiting for new requests", self.config.name);
                announced = true;
            }
            idle_samples = 0;
        }
        self.stop().await
    }

    /// Stops the dispatch loops, drains both buffers and closes parsers and
    /// pipelines.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        let _ = running.shutdown.send(true);
        running.ctx.collector.stop();
        for control in &running.controls {
            control.stop();
        }
        for handle in running.dispatch_handles {
            if let Err(e) = handle.await {
                error!("dispatch loop panicked: {e}");
            }
        }

        running.ctx.request_buffer.stop();
        running.ctx.item_buffer.stop();
        for handle in running.buffer_handles {
            if let Err(e) = handle.await {
                error!("buffer loop panicked: {e}");
            }
        }
        for handle in &running.background {
            handle.abort();
        }
        for handle in running.background {
            let _ = handle.await;
        }
        drop(running.controls);
        drop(running.batch);

        for parser in running.ctx.parsers.all() {
            parser.close().await;
        }
        running.ctx.item_buffer.close_pipelines().await;
        if let Err(e) = self
            .job_store
            .set_status(STATUS_END_TIME, &timestamp().to_string())
            .await
        {
            warn!("recording end time failed: {e}");
        }

        // parsers go back so the scheduler can be started again
        if let Some(parsers) = Arc::into_inner(running.ctx).map(|ctx| ctx.parsers) {
            if let Some(parsers) = Arc::into_inner(parsers) {
                self.parsers = parsers;
            }
        }
        let stats = self.stats.snapshot();
        info!(
            "{} stopped: {} succeeded, {} failed",
            self.config.name, stats.success, stats.failed
        );
        Ok(())
    }
}
