use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{ParserError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub url: String,
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Vec<u8>,
    /// Served from the response cache instead of the network
    #[serde(default)]
    pub from_cache: bool,
}

impl Response {
    pub fn new(url: impl Into<String>, status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            url: url.into(),
            status,
            headers: BTreeMap::new(),
            body: body.into(),
            from_cache: false,
        }
    }

    /// Placeholder passed to parsers for requests that skip the download.
    pub fn empty(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| ParserError::ParseError(e.into()).into())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_body() {
        let resp = Response::new("https://a.com", 200, br#"{"n":1}"#.to_vec());
        let v: serde_json::Value = resp.json().unwrap();
        assert_eq!(v["n"], 1);
        assert!(resp.is_success());
    }

    #[test]
    fn test_bad_json_is_parser_error() {
        let resp = Response::new("https://a.com", 200, "<html>");
        let err = resp.json::<serde_json::Value>().unwrap_err();
        assert!(err.is_parser());
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut resp = Response::empty("https://a.com");
        resp.headers.insert("Content-Type".into(), "text/html".into());
        assert_eq!(resp.header("content-type"), Some("text/html"));
        assert!(!resp.is_success());
    }
}
