use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::utils::encrypt::fingerprint;

/// A record bound for storage pipelines.
///
/// An item carrying `update_keys` is an update: pipelines set those columns
/// on rows matched by the item's remaining identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub table: String,
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_keys: Option<Vec<String>>,
    /// Fields making up the fingerprint; all fields when `None`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_keys: Option<Vec<String>>,
}

impl Item {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            fields: Map::new(),
            update_keys: None,
            unique_keys: None,
        }
    }

    pub fn from_fields(table: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            table: table.into(),
            fields,
            update_keys: None,
            unique_keys: None,
        }
    }

    /// An update of `update_keys` on `table`.
    pub fn update(table: impl Into<String>, fields: Map<String, Value>, update_keys: Vec<String>) -> Self {
        Self {
            table: table.into(),
            fields,
            update_keys: Some(update_keys),
            unique_keys: None,
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn with_unique_keys<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        self.unique_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_update(&self) -> bool {
        self.update_keys.is_some()
    }

    pub fn fingerprint(&self) -> String {
        let mut parts = vec![self.table.clone()];
        match &self.unique_keys {
            Some(keys) => {
                for key in keys {
                    parts.push(key.clone());
                    parts.push(self.fields.get(key).map(|v| v.to_string()).unwrap_or_default());
                }
            }
            None => {
                let mut keys: Vec<&String> = self.fields.keys().collect();
                keys.sort();
                for key in keys {
                    parts.push(key.clone());
                    parts.push(self.fields[key.as_str()].to_string());
                }
            }
        }
        fingerprint(&parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_field_order_independent() {
        let a = Item::new("news").with("title", "t").with("url", "u");
        let b = Item::new("news").with("url", "u").with("title", "t");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), Item::new("other").with("title", "t").with("url", "u").fingerprint());
    }

    #[test]
    fn test_unique_keys_limit_identity() {
        let a = Item::new("news").with("url", "u").with("crawl_time", 1).with_unique_keys(["url"]);
        let b = Item::new("news").with("url", "u").with("crawl_time", 2).with_unique_keys(["url"]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_update_item() {
        let mut fields = Map::new();
        fields.insert("id".into(), 7.into());
        fields.insert("state".into(), 1.into());
        let item = Item::update("task", fields, vec!["state".into()]);
        assert!(item.is_update());
        assert_eq!(item.get("id"), Some(&Value::from(7)));
    }
}
