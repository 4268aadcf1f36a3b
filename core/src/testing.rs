//! In-memory HTTP double shared by the unit tests and the queue scenarios.

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};
use crate::net::{ContentRange, NetClient, NetRequest, NetResponse, ResponseMeta};

#[derive(Debug, Clone)]
pub struct FakeResource {
    body: Vec<u8>,
    etag: Option<String>,
    last_modified: Option<String>,
    ranges: bool,
    ignore_if_range: bool,
    announced_len: Option<u64>,
    fail_after: Option<usize>,
    transient_failures: u32,
    chunk_delay: Option<Duration>,
}

impl FakeResource {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            etag: None,
            last_modified: None,
            ranges: true,
            ignore_if_range: false,
            announced_len: None,
            fail_after: None,
            transient_failures: 0,
            chunk_delay: None,
        }
    }

    pub fn etag(mut self, etag: &str) -> Self {
        self.etag = Some(etag.to_string());
        self
    }

    pub fn last_modified(mut self, date: &str) -> Self {
        self.last_modified = Some(date.to_string());
        self
    }

    pub fn without_ranges(mut self) -> Self {
        self.ranges = false;
        self
    }

    /// Serve the range even when `If-Range` no longer matches.
    pub fn ignore_if_range(mut self) -> Self {
        self.ignore_if_range = true;
        self
    }

    pub fn announce_len(mut self, len: u64) -> Self {
        self.announced_len = Some(len);
        self
    }

    /// The next GET resets the connection after `bytes` body bytes.
    pub fn fail_after(mut self, bytes: usize) -> Self {
        self.fail_after = Some(bytes);
        self
    }

    /// The next `count` GETs answer 503.
    pub fn transient_failures(mut self, count: u32) -> Self {
        self.transient_failures = count;
        self
    }

    /// Each body read blocks this long, so tests can catch a transfer mid-flight.
    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }
}

#[derive(Default)]
pub struct FakeNet {
    resources: Mutex<HashMap<String, FakeResource>>,
    log: Mutex<Vec<NetRequest>>,
}

impl FakeNet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &str, resource: FakeResource) {
        self.resources
            .lock()
            .unwrap()
            .insert(url.to_string(), resource);
    }

    pub fn requests(&self) -> Vec<NetRequest> {
        self.log.lock().unwrap().clone()
    }

    pub fn hits(&self, url: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|req| req.url == url)
            .count()
    }

    /// A HEAD (`consume == false`) sees the resource without using up its
    /// scripted failures.
    fn respond(&self, req: &NetRequest, consume: bool) -> CoreResult<(ResponseMeta, Vec<u8>, Option<usize>, Option<Duration>)> {
        let mut resources = self.resources.lock().unwrap();
        let Some(resource) = resources.get_mut(&req.url) else {
            return Ok((
                ResponseMeta {
                    status_code: 404,
                    ..ResponseMeta::default()
                },
                Vec::new(),
                None,
                None,
            ));
        };
        if resource.transient_failures > 0 {
            if consume {
                resource.transient_failures -= 1;
            }
            return Err(CoreError::HttpStatus(503));
        }
        let fail_after = if consume {
            resource.fail_after.take()
        } else {
            None
        };
        let total = resource.body.len() as u64;
        let current = resource.etag.as_ref().or(resource.last_modified.as_ref());
        let validator_ok = match (&req.if_range, current) {
            (None, _) => true,
            (Some(sent), Some(current)) => sent == current || resource.ignore_if_range,
            (Some(_), None) => resource.ignore_if_range,
        };
        let mut meta = ResponseMeta {
            etag: resource.etag.clone(),
            last_modified: resource.last_modified.clone(),
            ..ResponseMeta::default()
        };
        match req.range_start {
            Some(start) if resource.ranges && validator_ok => {
                if start >= total {
                    meta.status_code = 416;
                    return Ok((meta, Vec::new(), None, None));
                }
                let body = resource.body[start as usize..].to_vec();
                meta.status_code = 206;
                meta.content_length = Some(body.len() as u64);
                meta.content_range = Some(ContentRange {
                    start,
                    end: total - 1,
                    total: Some(total),
                });
                Ok((meta, body, fail_after, resource.chunk_delay))
            }
            _ => {
                meta.status_code = 200;
                meta.content_length = Some(resource.announced_len.unwrap_or(total));
                Ok((meta, resource.body.clone(), fail_after, resource.chunk_delay))
            }
        }
    }
}

impl NetClient for FakeNet {
    fn head(&self, req: &NetRequest) -> CoreResult<ResponseMeta> {
        let (meta, _, _, _) = self.respond(req, false)?;
        Ok(meta)
    }

    fn get(&self, req: &NetRequest) -> CoreResult<NetResponse> {
        self.log.lock().unwrap().push(req.clone());
        let (meta, body, fail_after, delay) = self.respond(req, true)?;
        if !meta.is_success() && meta.status_code != 416 {
            return Err(CoreError::HttpStatus(meta.status_code));
        }
        Ok(NetResponse {
            meta,
            body: Box::new(FakeBody {
                data: body,
                pos: 0,
                fail_after,
                delay,
            }),
        })
    }
}

struct FakeBody {
    data: Vec<u8>,
    pos: usize,
    fail_after: Option<usize>,
    delay: Option<Duration>,
}

impl Read for FakeBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        let mut end = self.data.len();
        if let Some(limit) = self.fail_after {
            if self.pos >= limit {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"));
            }
            end = end.min(limit);
        }
        let count = buf.len().min(end - self.pos);
        buf[..count].copy_from_slice(&self.data[self.pos..self.pos + count]);
        self.pos += count;
        Ok(count)
    }
}
