use async_trait::async_trait;
use dashmap::DashSet;

use super::DedupFilter;
use crate::errors::Result;

/// Exact set held in process memory; forgotten on restart.
#[derive(Debug, Default)]
pub struct MemoryFilter {
    seen: DashSet<String>,
}

impl MemoryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[async_trait]
impl DedupFilter for MemoryFilter {
    async fn contains_many(&self, fingerprints: &[String]) -> Result<Vec<bool>> {
        Ok(fingerprints.iter().map(|fp| self.seen.contains(fp)).collect())
    }

    async fn add_many(&self, fingerprints: &[String]) -> Result<Vec<bool>> {
        Ok(fingerprints
            .iter()
            .map(|fp| self.seen.insert(fp.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exact_membership() {
        let filter = MemoryFilter::new();
        let batch = vec!["x".to_string(), "x".to_string()];
        assert_eq!(filter.add_many(&batch).await.unwrap(), vec![true, false]);
        assert_eq!(filter.len(), 1);
        assert_eq!(
            filter.contains_many(&["x".to_string(), "y".to_string()]).await.unwrap(),
            vec![true, false]
        );
    }
}
