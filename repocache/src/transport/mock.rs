//! Scripted fetcher for unit tests.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use url::Url;

use super::{FetchedResource, Fetcher};
use crate::error::{ProxyError, ProxyResult};

/// What the upstream does for one URL.
#[derive(Debug, Clone)]
pub(crate) enum Script {
    Absent,
    Fail(String),
    Serve(Upstream),
}

#[derive(Debug, Clone)]
pub(crate) struct Upstream {
    pub body: Vec<u8>,
    pub declared_length: Option<u64>,
    pub last_modified: Option<SystemTime>,
    pub content_type: Option<String>,
}

impl Upstream {
    pub fn new(body: &[u8], last_modified: SystemTime) -> Self {
        Self {
            body: body.to_vec(),
            declared_length: Some(body.len() as u64),
            last_modified: Some(last_modified),
            content_type: Some("application/octet-stream".to_string()),
        }
    }

    pub fn with_declared_length(mut self, length: u64) -> Self {
        self.declared_length = Some(length);
        self
    }

    pub fn without_last_modified(mut self) -> Self {
        self.last_modified = None;
        self
    }
}

#[derive(Debug, Default)]
pub(crate) struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, Script>>,
    fetches: AtomicUsize,
    bodies: AtomicUsize,
    downloads: Arc<AtomicUsize>,
    delay: Duration,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep inside every fetch, widening race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(self, url: &str, script: Script) -> Self {
        self.scripts.lock().insert(url.to_string(), script);
        self
    }

    pub fn set(&self, url: &str, script: Script) {
        self.scripts.lock().insert(url.to_string(), script);
    }

    /// Number of fetch calls.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of fetches that returned a modified body.
    pub fn bodies(&self) -> usize {
        self.bodies.load(Ordering::SeqCst)
    }

    /// Number of fetched resources whose body was actually read.
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch(
        &self,
        url: &Url,
        local_last_modified: Option<SystemTime>,
        _user_agent: Option<&str>,
    ) -> ProxyResult<Box<dyn FetchedResource>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }

        let script = self.scripts.lock().get(url.as_str()).cloned();
        match script {
            None | Some(Script::Absent) => Err(ProxyError::ResourceUnavailable(url.to_string())),
            Some(Script::Fail(reason)) => Err(ProxyError::transfer(url.as_str(), reason)),
            Some(Script::Serve(upstream)) => {
                let modified = match (local_last_modified, upstream.last_modified) {
                    (Some(local), Some(remote)) => remote > local,
                    (Some(_), None) => true,
                    (None, _) => true,
                };
                if modified {
                    self.bodies.fetch_add(1, Ordering::SeqCst);
                }
                Ok(Box::new(ScriptedResource {
                    modified,
                    body: Cursor::new(if modified { upstream.body } else { Vec::new() }),
                    content_length: upstream.declared_length,
                    content_type: upstream.content_type,
                    last_modified: upstream.last_modified,
                    downloads: Arc::clone(&self.downloads),
                }))
            }
        }
    }
}

struct ScriptedResource {
    modified: bool,
    body: Cursor<Vec<u8>>,
    content_length: Option<u64>,
    content_type: Option<String>,
    last_modified: Option<SystemTime>,
    downloads: Arc<AtomicUsize>,
}

impl FetchedResource for ScriptedResource {
    fn is_modified(&self) -> bool {
        self.modified
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    fn body(&mut self) -> &mut dyn Read {
        &mut self.body
    }

    fn close(self: Box<Self>) -> ProxyResult<()> {
        if self.body.position() > 0 {
            self.downloads.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
