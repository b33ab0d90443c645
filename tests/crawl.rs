use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crawl_relay::engine::health::{STATUS_END_TIME, STATUS_START_TIME};
use crawl_relay::errors::DownloadError;
use crawl_relay::prelude::*;

const RUN_LIMIT: Duration = Duration::from_secs(60);

/// Serves every url except the ones containing `broken`.
#[derive(Default)]
struct FakeDownloader {
    calls: AtomicUsize,
    broken_calls: AtomicUsize,
}

#[async_trait]
impl Downloader for FakeDownloader {
    async fn download(&self, request: &Request) -> Result<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if request.url.contains("broken") {
            self.broken_calls.fetch_add(1, Ordering::SeqCst);
            return Err(DownloadError::DownloadFailed("connection reset".into()).into());
        }
        Ok(Response::new(request.url.clone(), 200, "<html></html>"))
    }
}

#[derive(Default)]
struct CollectPipeline {
    saved: Mutex<Vec<Map<String, Value>>>,
}

#[async_trait]
impl StoragePipeline for CollectPipeline {
    fn name(&self) -> &str {
        "collect"
    }

    async fn save_items(&self, _table: &str, items: &[Map<String, Value>]) -> bool {
        self.saved.lock().await.extend_from_slice(items);
        true
    }

    async fn update_items(&self, _table: &str, _items: &[Map<String, Value>], _keys: &[String]) -> bool {
        true
    }
}

/// A listing page linking to detail pages, each detail page yields one item.
struct SiteParser {
    details: Vec<&'static str>,
}

impl Parser for SiteParser {
    fn name(&self) -> &str {
        "site"
    }

    fn start_requests<'a>(&'a self, _task: Option<&'a TaskRow>) -> YieldStream<'a> {
        yields([Yield::Request(Request::new("https://example.com/list"))])
    }

    fn parse<'a>(&'a self, request: &'a Request, _response: &'a Response) -> YieldStream<'a> {
        if request.url.ends_with("/list") {
            let links = self
                .details
                .iter()
                .map(|path| Yield::Request(Request::new(format!("https://example.com/{path}")).with_priority(10)));
            return yields(links.collect::<Vec<_>>());
        }
        yields([Yield::Item(Item::new("pages").with("url", request.url.clone()))])
    }
}

fn fast_config(name: &str) -> Config {
    let mut config = Config::new(name);
    config.spider.thread_count = 2;
    config.spider.collector_interval_ms = 20;
    config.spider.request_flush_interval_ms = 20;
    config.spider.item_flush_interval_ms = 20;
    config.spider.sleep_time_ms = 0;
    config.dedup.strategy = "memory".to_string();
    config
}

async fn saved_urls(pipeline: &CollectPipeline) -> Vec<String> {
    let mut urls: Vec<String> = pipeline
        .saved
        .lock()
        .await
        .iter()
        .filter_map(|row| row.get("url").and_then(Value::as_str).map(str::to_string))
        .collect();
    urls.sort();
    urls
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crawl_runs_to_idle_and_stops() {
    let downloader = Arc::new(FakeDownloader::default());
    let pipeline = Arc::new(CollectPipeline::default());
    let mut scheduler = Scheduler::new(fast_config("crawl_e2e"))
        .unwrap()
        .with_downloader(downloader.clone());
    scheduler
        .add_parser(Arc::new(SiteParser {
            details: vec!["a", "b", "c"],
        }))
        .add_pipeline(pipeline.clone());

    tokio::time::timeout(RUN_LIMIT, scheduler.run())
        .await
        .expect("crawl did not go idle")
        .unwrap();

    assert!(!scheduler.is_running());
    assert_eq!(downloader.calls.load(Ordering::SeqCst), 4);
    assert_eq!(
        saved_urls(&pipeline).await,
        vec![
            "https://example.com/a",
            "https://example.com/b",
            "https://example.com/c"
        ]
    );
    assert_eq!(scheduler.backlog().total().await.unwrap(), 0);

    let stats = scheduler.stats();
    assert_eq!(stats.success, 4);
    assert_eq!(stats.failed, 0);

    let job_store = scheduler.job_store();
    assert!(job_store.get_status(STATUS_START_TIME).await.unwrap().is_some());
    assert!(job_store.get_status(STATUS_END_TIME).await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_links_are_downloaded_once() {
    let downloader = Arc::new(FakeDownloader::default());
    let pipeline = Arc::new(CollectPipeline::default());
    let mut config = fast_config("crawl_dedup");
    config.spider.request_filter_enable = true;
    let mut scheduler = Scheduler::new(config).unwrap().with_downloader(downloader.clone());
    scheduler
        .add_parser(Arc::new(SiteParser {
            details: vec!["a", "b", "a", "b"],
        }))
        .add_pipeline(pipeline.clone());

    tokio::time::timeout(RUN_LIMIT, scheduler.run())
        .await
        .expect("crawl did not go idle")
        .unwrap();

    assert_eq!(downloader.calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        saved_urls(&pipeline).await,
        vec!["https://example.com/a", "https://example.com/b"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exhausted_request_is_parked_and_replayed() {
    let downloader = Arc::new(FakeDownloader::default());
    let pipeline = Arc::new(CollectPipeline::default());
    let mut config = fast_config("crawl_failed");
    config.spider.max_retry_times = 2;
    config.spider.save_failed_request = true;
    let mut scheduler = Scheduler::new(config).unwrap().with_downloader(downloader.clone());
    scheduler
        .add_parser(Arc::new(SiteParser {
            details: vec!["ok", "broken"],
        }))
        .add_pipeline(pipeline.clone());

    tokio::time::timeout(RUN_LIMIT, scheduler.run())
        .await
        .expect("crawl did not go idle")
        .unwrap();

    // first attempt plus two retries
    assert_eq!(downloader.broken_calls.load(Ordering::SeqCst), 3);
    assert_eq!(saved_urls(&pipeline).await, vec!["https://example.com/ok"]);
    // every failed attempt counts
    let stats = scheduler.stats();
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.success, 2);

    let job_store = scheduler.job_store();
    assert_eq!(job_store.failed_request_count().await.unwrap(), 1);

    assert_eq!(scheduler.replay_failed_requests(10).await.unwrap(), 1);
    assert_eq!(job_store.failed_request_count().await.unwrap(), 0);
    let backlog = scheduler.backlog();
    assert_eq!(backlog.total().await.unwrap(), 1);
    let member = backlog.lease(f64::MAX, 0.0, 10).await.unwrap().remove(0);
    let replayed = Request::from_member(&member).unwrap();
    assert_eq!(replayed.url, "https://example.com/broken");
    assert_eq!(replayed.retry_times, 0);
}

#[tokio::test]
async fn test_start_requires_a_parser() {
    let mut scheduler = Scheduler::new(fast_config("crawl_no_parser")).unwrap();
    assert!(scheduler.start().await.is_err());
    assert!(!scheduler.is_running());
}

#[tokio::test]
async fn test_parsers_and_pipelines_added_by_name() {
    use crawl_relay::common::registry::{ParserRegistry, PipelineRegistry};

    let parsers = ParserRegistry::new("parser");
    parsers.register("site", |_config: &Config| {
        Ok(Arc::new(SiteParser { details: vec![] }) as Arc<dyn Parser>)
    });
    let pipelines = PipelineRegistry::new("pipeline");
    pipelines.register("console", |_config: &Config| {
        Ok(Arc::new(ConsolePipeline) as Arc<dyn StoragePipeline>)
    });

    let mut scheduler = Scheduler::new(fast_config("crawl_registry")).unwrap();
    assert!(scheduler.add_registered_parser(&parsers, "site").is_ok());
    assert!(scheduler.add_registered_pipeline(&pipelines, "console").is_ok());
    assert!(scheduler.add_registered_parser(&parsers, "missing").is_err());
}
