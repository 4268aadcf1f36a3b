use std::io::Read;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_RANGE, ETAG, IF_RANGE, LAST_MODIFIED,
    RANGE,
};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetRequest {
    pub url: String,
    /// Ask for `bytes=N-`.
    pub range_start: Option<u64>,
    /// Validator sent as `If-Range` so a changed resource comes back whole.
    pub if_range: Option<String>,
}

impl NetRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            range_start: None,
            if_range: None,
        }
    }

    pub fn resume_from(mut self, offset: u64, validator: Option<String>) -> Self {
        self.range_start = Some(offset);
        self.if_range = validator;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    pub status_code: u16,
    pub content_length: Option<u64>,
    pub content_range: Option<ContentRange>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl ResponseMeta {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Size of the whole remote resource, when the server told us.
    pub fn resource_size(&self) -> Option<u64> {
        match (self.status_code, self.content_range) {
            (206, Some(range)) => range.total,
            (206, None) => None,
            _ => self.content_length,
        }
    }
}

pub struct NetResponse {
    pub meta: ResponseMeta,
    pub body: Box<dyn Read + Send>,
}

/// Blocking HTTP surface shared by transfers and the asset cache.
pub trait NetClient: Send + Sync {
    /// Used before a fresh transfer to learn its size.
    fn head(&self, req: &NetRequest) -> CoreResult<ResponseMeta>;
    fn get(&self, req: &NetRequest) -> CoreResult<NetResponse>;
}

#[derive(Clone)]
pub struct ReqwestNetClient {
    client: Client,
}

impl ReqwestNetClient {
    pub fn new(
        user_agent: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> CoreResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        Ok(Self { client })
    }

    fn request_headers(&self, req: &NetRequest) -> CoreResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(start) = req.range_start {
            let value = format!("bytes={}-", start);
            headers.insert(
                RANGE,
                HeaderValue::from_str(&value)
                    .map_err(|err| CoreError::InvalidRequest(err.to_string()))?,
            );
            if let Some(validator) = &req.if_range {
                if let Ok(value) = HeaderValue::from_str(validator) {
                    headers.insert(IF_RANGE, value);
                }
            }
        }
        Ok(headers)
    }

    fn send(&self, builder: RequestBuilder) -> CoreResult<Response> {
        builder.send().map_err(map_reqwest_error)
    }
}

impl NetClient for ReqwestNetClient {
    fn head(&self, req: &NetRequest) -> CoreResult<ResponseMeta> {
        let builder = self.client.head(&req.url).headers(self.request_headers(req)?);
        let resp = self.send(builder)?;
        Ok(response_meta(&resp))
    }

    fn get(&self, req: &NetRequest) -> CoreResult<NetResponse> {
        let builder = self.client.get(&req.url).headers(self.request_headers(req)?);
        let resp = self.send(builder)?;
        Ok(NetResponse {
            meta: response_meta(&resp),
            body: Box::new(resp),
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> CoreError {
    if err.is_builder() {
        CoreError::InvalidRequest(err.to_string())
    } else if let Some(status) = err.status() {
        CoreError::HttpStatus(status.as_u16())
    } else {
        CoreError::Network(err.to_string())
    }
}

fn response_meta(resp: &Response) -> ResponseMeta {
    let headers = resp.headers();
    let text = |name: HeaderName| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string())
    };
    ResponseMeta {
        status_code: resp.status().as_u16(),
        content_length: text(CONTENT_LENGTH).and_then(|value| value.parse::<u64>().ok()),
        content_range: text(CONTENT_RANGE).and_then(|value| parse_content_range(&value)),
        etag: text(ETAG),
        last_modified: text(LAST_MODIFIED),
    }
}

/// Parses `bytes START-END/TOTAL` (TOTAL may be `*`).
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, total) = rest.split_once('/')?;
    let (start, end) = span.trim().split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let end = end.trim().parse::<u64>().ok()?;
    if end < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        raw => Some(raw.parse::<u64>().ok()?),
    };
    Some(ContentRange { start, end, total })
}
