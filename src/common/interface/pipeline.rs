use async_trait::async_trait;
use log::info;
use serde_json::{Map, Value};

/// Destination of item batches.
///
/// Both operations report success as a bool; a `false` from any pipeline
/// fails the whole partition and it is retried later.
#[async_trait]
pub trait StoragePipeline: Send + Sync {
    fn name(&self) -> &str;

    async fn save_items(&self, table: &str, items: &[Map<String, Value>]) -> bool;

    async fn update_items(
        &self,
        table: &str,
        items: &[Map<String, Value>],
        update_keys: &[String],
    ) -> bool;

    async fn close(&self) {}
}

/// Logs every batch instead of storing it.
#[derive(Debug, Default)]
pub struct ConsolePipeline;

#[async_trait]
impl StoragePipeline for ConsolePipeline {
    fn name(&self) -> &str {
        "console"
    }

    async fn save_items(&self, table: &str, items: &[Map<String, Value>]) -> bool {
        info!("save table={} items={}", table, items.len());
        for item in items {
            info!("{}", Value::Object(item.clone()));
        }
        true
    }

    async fn update_items(
        &self,
        table: &str,
        items: &[Map<String, Value>],
        update_keys: &[String],
    ) -> bool {
        info!(
            "update table={} items={} keys={:?}",
            table,
            items.len(),
            update_keys
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_console_pipeline_accepts_everything() {
        let pipeline = ConsolePipeline;
        let mut row = Map::new();
        row.insert("title".into(), "hello".into());
        assert!(pipeline.save_items("news", &[row.clone()]).await);
        assert!(pipeline.update_items("news", &[row], &["title".into()]).await);
    }
}
