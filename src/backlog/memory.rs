use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{Backlog, JobStore};
use crate::errors::Result;

#[derive(Default)]
struct State {
    // member -> (score, insertion sequence)
    requests: HashMap<String, (f64, u64)>,
    seq: u64,
    failed_requests: HashMap<String, (f64, u64)>,
    failed_items: Vec<String>,
    status: HashMap<String, String>,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

fn in_range(score: f64, min: f64, max: f64) -> bool {
    score >= min && score <= max
}

/// Single-process backlog with the same semantics as the redis one.
#[derive(Default)]
pub struct MemoryBacklog {
    state: Mutex<State>,
}

impl MemoryBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn score_of(&self, member: &str) -> Option<f64> {
        self.state.lock().await.requests.get(member).map(|(s, _)| *s)
    }

    /// All members, lowest score first.
    pub async fn members(&self) -> Vec<(String, f64)> {
        let state = self.state.lock().await;
        let mut all: Vec<(&String, &(f64, u64))> = state.requests.iter().collect();
        all.sort_by(|a, b| a.1.0.total_cmp(&b.1.0).then(a.1.1.cmp(&b.1.1)));
        all.into_iter().map(|(m, (s, _))| (m.clone(), *s)).collect()
    }
}

#[async_trait]
impl Backlog for MemoryBacklog {
    async fn enqueue(&self, entries: &[(String, f64)]) -> Result<()> {
        let mut state = self.state.lock().await;
        for (member, score) in entries {
            let existing = state.requests.get(member).map(|(_, seq)| *seq);
            let seq = match existing {
                Some(seq) => seq,
                None => state.next_seq(),
            };
            state.requests.insert(member.clone(), (*score, seq));
        }
        Ok(())
    }

    async fn lease_range(
        &self,
        ready_after: f64,
        ready_before: f64,
        new_ready_at: f64,
        max_count: usize,
    ) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        let mut ready: Vec<(String, f64, u64)> = state
            .requests
            .iter()
            .filter(|(_, (score, _))| in_range(*score, ready_after, ready_before))
            .map(|(m, (score, seq))| (m.clone(), *score, *seq))
            .collect();
        ready.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.2.cmp(&b.2)));
        ready.truncate(max_count);

        let mut leased = Vec::with_capacity(ready.len());
        for (member, _, seq) in ready {
            state.requests.insert(member.clone(), (new_ready_at, seq));
            leased.push(member);
        }
        Ok(leased)
    }

    async fn remove(&self, members: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        for member in members {
            state.requests.remove(member);
        }
        Ok(())
    }

    async fn count(&self, ready_after: f64, ready_before: f64) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .requests
            .values()
            .filter(|(score, _)| in_range(*score, ready_after, ready_before))
            .count() as u64)
    }
}

#[async_trait]
impl JobStore for MemoryBacklog {
    async fn park_failed_request(&self, member: &str, score: f64) -> Result<()> {
        let mut state = self.state.lock().await;
        let seq = state.next_seq();
        state
            .failed_requests
            .insert(member.to_string(), (score, seq));
        Ok(())
    }

    async fn failed_request_count(&self) -> Result<u64> {
        Ok(self.state.lock().await.failed_requests.len() as u64)
    }

    async fn take_failed_requests(&self, limit: usize) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        let mut all: Vec<(String, f64, u64)> = state
            .failed_requests
            .iter()
            .map(|(m, (s, q))| (m.clone(), *s, *q))
            .collect();
        all.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.2.cmp(&b.2)));
        all.truncate(limit);
        for (member, _, _) in &all {
            state.failed_requests.remove(member);
        }
        Ok(all.into_iter().map(|(m, _, _)| m).collect())
    }

    async fn park_failed_items(&self, payload: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.failed_items.iter().any(|p| p == payload) {
            state.failed_items.push(payload.to_string());
        }
        Ok(())
    }

    async fn failed_items(&self, limit: usize) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state.failed_items.iter().take(limit).cloned().collect())
    }

    async fn remove_failed_items(&self, payload: &str) -> Result<()> {
        self.state.lock().await.failed_items.retain(|p| p != payload);
        Ok(())
    }

    async fn set_status(&self, field: &str, value: &str) -> Result<()> {
        self.state
            .lock()
            .await
            .status
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn get_status(&self, field: &str) -> Result<Option<String>> {
        Ok(self.state.lock().await.status.get(field).cloned())
    }
}
