use async_trait::async_trait;
use reqwest::Method;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::common::interface::Downloader;
use crate::common::model::{Request, Response};
use crate::errors::{RequestError, Result};

const DEFAULT_TIMEOUT_SECS: u64 = 22;

/// Plain HTTP downloader over a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .gzip(true)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, request: &Request) -> Result<Response> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| RequestError::InvalidMethod(request.method.clone()))?;
        let mut builder = self.client.request(method, &request.url);
        if let Some(params) = &request.params {
            builder = builder.query(params);
        }
        if let Some(headers) = &request.headers {
            for (k, v) in headers {
                builder = builder.header(k, v);
            }
        }
        if let Some(json) = &request.json {
            builder = builder.json(json);
        } else if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(secs) = request.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let url = resp.url().to_string();
        let headers: BTreeMap<String, String> = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = resp.bytes().await?.to_vec();

        Ok(Response {
            url,
            status,
            headers,
            body,
            from_cache: false,
        })
    }
}
