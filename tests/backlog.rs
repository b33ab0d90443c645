use std::collections::HashSet;
use std::sync::Arc;

use crawl_relay::buffer::{RequestBuffer, RequestBufferSettings};
use crawl_relay::common::model::request::MAX_PRIORITY;
use crawl_relay::dedup::{Dedup, MemoryFilter};
use crawl_relay::prelude::*;
use crawl_relay::utils::timestamp;

async fn fill(backlog: &MemoryBacklog, n: usize) {
    let entries: Vec<(String, f64)> = (0..n)
        .map(|i| {
            let request = Request::new(format!("https://example.com/{i}")).with_priority(i as i64);
            (request.to_member().unwrap(), request.score())
        })
        .collect();
    backlog.enqueue(&entries).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_leases_never_overlap() {
    let backlog = Arc::new(MemoryBacklog::new());
    fill(&backlog, 100).await;

    let now = timestamp();
    let mut workers = Vec::new();
    for _ in 0..4 {
        let backlog = backlog.clone();
        workers.push(tokio::spawn(async move {
            let mut leased = Vec::new();
            loop {
                let members = backlog.lease(now, now + 600.0, 7).await.unwrap();
                if members.is_empty() {
                    break leased;
                }
                leased.extend(members);
            }
        }));
    }

    let mut all = Vec::new();
    for worker in workers {
        all.extend(worker.await.unwrap());
    }
    let unique: HashSet<&String> = all.iter().collect();
    assert_eq!(all.len(), 100);
    assert_eq!(unique.len(), 100);
    // leased members stay until removed
    assert_eq!(backlog.total().await.unwrap(), 100);
}

#[tokio::test]
async fn test_expired_lease_is_leased_again() {
    let backlog = MemoryBacklog::new();
    fill(&backlog, 1).await;
    let now = timestamp();

    let first = backlog.lease(now, now + 60.0, 10).await.unwrap();
    assert_eq!(first.len(), 1);
    assert!(backlog.lease(now, now + 60.0, 10).await.unwrap().is_empty());

    // as seen by a node after the deadline
    let later = now + 61.0;
    let second = backlog.lease(later, later + 60.0, 10).await.unwrap();
    assert_eq!(second, first);
}

#[tokio::test]
async fn test_reflushing_the_same_requests_is_idempotent() {
    let backlog = Arc::new(MemoryBacklog::new());
    let dedup = Arc::new(Dedup::new("reflush:request", Arc::new(MemoryFilter::new())));
    let buffer = RequestBuffer::new(backlog.clone(), Some(dedup), RequestBufferSettings::default());

    for _ in 0..2 {
        for i in 0..3 {
            buffer
                .put_request(Request::new(format!("https://example.com/{i}")))
                .await;
        }
        buffer.flush().await.unwrap();
        assert_eq!(backlog.total().await.unwrap(), 3);
    }

    // without dedup the members themselves collapse
    let plain = RequestBuffer::new(backlog.clone(), None, RequestBufferSettings::default());
    for i in 0..3 {
        plain
            .put_request(Request::new(format!("https://example.com/{i}")))
            .await;
    }
    plain.flush().await.unwrap();
    assert_eq!(backlog.total().await.unwrap(), 3);
}

#[tokio::test]
async fn test_expired_leases_reclaimed_to_priority() {
    let backlog = Arc::new(MemoryBacklog::new());
    let request = Request::new("https://example.com/lost").with_priority(7);
    let member = request.to_member().unwrap();
    // a lease whose deadline passed while no node was running
    backlog
        .enqueue(&[(member.clone(), timestamp() - 30.0)])
        .await
        .unwrap();
    let fresh = Request::new("https://example.com/fresh").with_priority(3);
    backlog
        .enqueue(&[(fresh.to_member().unwrap(), fresh.score())])
        .await
        .unwrap();
    // the largest priority still reads as a priority
    let last = Request::new("https://example.com/last").with_priority(i64::MAX);
    backlog
        .enqueue(&[(last.to_member().unwrap(), last.score())])
        .await
        .unwrap();

    let scheduler = Scheduler::new(Config::new("reclaim")).unwrap().with_backlog(backlog.clone());
    assert_eq!(scheduler.reclaim_expired_leases().await.unwrap(), 1);
    assert_eq!(backlog.score_of(&member).await, Some(7.0));
    assert_eq!(backlog.score_of(&fresh.to_member().unwrap()).await, Some(3.0));
    assert_eq!(
        backlog.score_of(&last.to_member().unwrap()).await,
        Some(MAX_PRIORITY as f64)
    );
}
