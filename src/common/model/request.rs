use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::errors::{RequestError, Result};
use crate::utils::encrypt::fingerprint;

/// Score used when a request does not set its own priority.
pub const DEFAULT_PRIORITY: i64 = 300;

/// Highest usable priority. Backlog scores above it are lease deadlines in
/// unix seconds, so larger priorities are clamped down to it.
pub const MAX_PRIORITY: i64 = 999_999_999;

fn default_method() -> String {
    "GET".to_string()
}

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

fn default_true() -> bool {
    true
}

fn is_true(v: &bool) -> bool {
    *v
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

fn is_default_method(v: &String) -> bool {
    v.eq_ignore_ascii_case("GET")
}

fn is_default_priority(v: &i64) -> bool {
    *v == DEFAULT_PRIORITY
}

/// A unit of crawl work.
///
/// Stored in the backlog as a flat JSON record holding only non-default
/// attributes; user attributes set with [`Request::with_meta`] are flattened
/// next to the framework fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub url: String,
    #[serde(default = "default_method", skip_serializing_if = "is_default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    /// Lower is sooner. Doubles as the backlog score of a fresh request;
    /// capped at [`MAX_PRIORITY`].
    #[serde(default = "default_priority", skip_serializing_if = "is_default_priority")]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_times: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parser_name: Option<String>,
    /// Name of the parser callback handling the response; `None` means `parse`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub filter_repeat: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_abandoned: bool,
    /// Whether the framework downloads the url before parsing
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub auto_request: bool,
    /// Dispatched inline by the producing worker instead of going through the backlog
    #[serde(default, skip_serializing_if = "is_false")]
    pub request_sync: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub render: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Fingerprint override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
    #[serde(flatten)]
    pub meta: Map<String, Value>,

    #[serde(skip)]
    backlog_member: Option<String>,
    #[serde(skip)]
    fingerprint_cache: OnceCell<String>,
}

impl Request {
    pub fn new(url: impl Into<String>) -> Self {
        Request {
            url: url.into(),
            method: default_method(),
            params: None,
            headers: None,
            body: None,
            json: None,
            priority: DEFAULT_PRIORITY,
            retry_times: 0,
            parser_name: None,
            callback: None,
            filter_repeat: true,
            is_abandoned: false,
            auto_request: true,
            request_sync: false,
            render: false,
            timeout_secs: None,
            unique_key: None,
            meta: Map::new(),
            backlog_member: None,
            fingerprint_cache: OnceCell::new(),
        }
    }

    pub fn with_method(mut self, method: impl AsRef<str>) -> Self {
        self.method = method.as_ref().to_uppercase();
        self.fingerprint_cache = OnceCell::new();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority.min(MAX_PRIORITY);
        self
    }

    pub fn with_parser(mut self, parser_name: impl Into<String>) -> Self {
        self.parser_name = Some(parser_name.into());
        self
    }

    pub fn with_callback(mut self, callback: impl Into<String>) -> Self {
        self.callback = Some(callback.into());
        self
    }

    pub fn with_params<K: Into<String>, V: Into<String>>(
        mut self,
        params: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        let map = self.params.get_or_insert_with(BTreeMap::new);
        for (k, v) in params {
            map.insert(k.into(), v.into());
        }
        self.fingerprint_cache = OnceCell::new();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self.fingerprint_cache = OnceCell::new();
        self
    }

    pub fn with_json<T: Serialize + ?Sized>(mut self, json: &T) -> Result<Self> {
        self.json = Some(serde_json::to_value(json)?);
        self.fingerprint_cache = OnceCell::new();
        Ok(self)
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_filter_repeat(mut self, filter_repeat: bool) -> Self {
        self.filter_repeat = filter_repeat;
        self
    }

    pub fn with_auto_request(mut self, auto_request: bool) -> Self {
        self.auto_request = auto_request;
        self
    }

    pub fn with_sync(mut self, request_sync: bool) -> Self {
        self.request_sync = request_sync;
        self
    }

    pub fn with_unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self.fingerprint_cache = OnceCell::new();
        self
    }

    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.meta.get(key)
    }

    /// Identity hash over method, url, params, body and json.
    pub fn fingerprint(&self) -> String {
        self.fingerprint_cache
            .get_or_init(|| {
                if let Some(key) = &self.unique_key {
                    return fingerprint(&[key.as_str()]);
                }
                let params = self
                    .params
                    .as_ref()
                    .map(|p| serde_json::to_string(p).unwrap_or_default())
                    .unwrap_or_default();
                let json = self
                    .json
                    .as_ref()
                    .map(|j| j.to_string())
                    .unwrap_or_default();
                fingerprint(&[
                    self.method.to_uppercase().as_str(),
                    self.url.as_str(),
                    params.as_str(),
                    self.body.as_deref().unwrap_or_default(),
                    json.as_str(),
                ])
            })
            .clone()
    }

    /// Backlog score of a fresh enqueue.
    pub fn score(&self) -> f64 {
        self.priority.min(MAX_PRIORITY) as f64
    }

    pub fn to_member(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| RequestError::Serialize(e.into()).into())
    }

    /// Decodes a backlog member, remembering the raw member for later removal.
    pub fn from_member(member: &str) -> Result<Self> {
        let mut request: Request =
            serde_json::from_str(member).map_err(|e| RequestError::Malformed(e.into()))?;
        request.backlog_member = Some(member.to_string());
        Ok(request)
    }

    /// The raw backlog member this request was leased as, if any.
    pub fn backlog_member(&self) -> Option<&str> {
        self.backlog_member.as_deref()
    }

    pub(crate) fn take_backlog_member(&mut self) -> Option<String> {
        self.backlog_member.take()
    }

    /// Next attempt of this request: one more retry, dedup bypassed.
    pub fn rearm_for_retry(mut self) -> Self {
        self.retry_times += 1;
        self.filter_repeat = false;
        self.backlog_member = None;
        self
    }

    pub fn parser_label(&self) -> &str {
        self.parser_name.as_deref().unwrap_or("default")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fresh_request_serializes_compactly() {
        let member = Request::new("https://example.com/list").to_member().unwrap();
        assert_eq!(member, r#"{"url":"https://example.com/list"}"#);
    }

    #[test]
    fn test_member_round_trip_keeps_user_fields() {
        let req = Request::new("https://example.com/item/1")
            .with_priority(5)
            .with_parser("detail")
            .with_callback("parse_detail")
            .with_meta("category", "books")
            .with_meta("page", 3);
        let mut req = req;
        req.retry_times = 2;

        let member = req.to_member().unwrap();
        let back = Request::from_member(&member).unwrap();
        assert_eq!(back.priority, 5);
        assert_eq!(back.parser_name.as_deref(), Some("detail"));
        assert_eq!(back.callback.as_deref(), Some("parse_detail"));
        assert_eq!(back.retry_times, 2);
        assert_eq!(back.meta("category"), Some(&json!("books")));
        assert_eq!(back.meta("page"), Some(&json!(3)));
        assert_eq!(back.backlog_member(), Some(member.as_str()));
        assert_eq!(back.fingerprint(), req.fingerprint());
        assert_eq!(back.to_member().unwrap(), member);
    }

    #[test]
    fn test_fingerprint_ignores_priority_and_meta() {
        let a = Request::new("https://a.com").with_priority(1).with_meta("x", 1);
        let b = Request::new("https://a.com").with_priority(9);
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = Request::new("https://a.com").with_params([("page", "2")]);
        assert_ne!(a.fingerprint(), c.fingerprint());

        let d = Request::new("https://a.com").with_method("post");
        assert_ne!(a.fingerprint(), d.fingerprint());
    }

    #[test]
    fn test_unique_key_overrides_fingerprint() {
        let a = Request::new("https://a.com?ts=1").with_unique_key("a");
        let b = Request::new("https://a.com?ts=2").with_unique_key("a");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_rearm_for_retry() {
        let req = Request::from_member(r#"{"url":"https://a.com","retry_times":3}"#).unwrap();
        let next = req.rearm_for_retry();
        assert_eq!(next.retry_times, 4);
        assert!(!next.filter_repeat);
        assert!(next.backlog_member().is_none());
        assert!(next.to_member().unwrap().contains(r#""filter_repeat":false"#));
    }

    #[test]
    fn test_priority_capped_below_lease_deadlines() {
        let req = Request::new("https://a.com").with_priority(i64::MAX);
        assert_eq!(req.priority, MAX_PRIORITY);

        // hand-written members are capped when scored
        let req = Request::from_member(r#"{"url":"https://a.com","priority":5000000000}"#).unwrap();
        assert_eq!(req.score(), MAX_PRIORITY as f64);
    }

    #[test]
    fn test_malformed_member() {
        let err = Request::from_member("not json").unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Request);
    }
}
