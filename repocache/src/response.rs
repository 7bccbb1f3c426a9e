//! Response sinks.
//!
//! The orchestrator writes response metadata into a [`ResponseHead`] and the
//! body through [`std::io::Write`]. A sink *commits* once the first bytes
//! actually leave the process; after that, headers are frozen and a failed
//! transfer can no longer be retried on another mirror.
//!
//! [`BufferedResponse`] is the in-memory sink: it holds back up to
//! `buffer_size` bytes before committing, which lets the finder discard a
//! failed attempt that only got as far as the buffer.

use std::io::{self, Write};
use std::time::SystemTime;

use reqwest::StatusCode;

/// Default number of body bytes held back before a response commits.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Status and entity headers of an outgoing response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub last_modified: Option<SystemTime>,
}

impl Default for ResponseHead {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            content_type: None,
            content_length: None,
            last_modified: None,
        }
    }
}

/// Destination of one response.
///
/// `flush` commits the head even when no body bytes were written, which is
/// how a bodiless 304 goes out.
pub trait ResponseSink: Write {
    /// Mutable access to the head. Changes after commit are ignored.
    fn head_mut(&mut self) -> &mut ResponseHead;

    /// Whether any part of the response has left the process.
    fn is_committed(&self) -> bool;

    /// Drop the head and any held-back body bytes.
    ///
    /// Has no effect on data already committed.
    fn reset(&mut self);
}

/// In-memory response that commits after `buffer_size` bytes.
#[derive(Debug)]
pub struct BufferedResponse {
    head: ResponseHead,
    pending: Vec<u8>,
    buffer_size: usize,
    committed_head: Option<ResponseHead>,
    body: Vec<u8>,
}

impl Default for BufferedResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferedResponse {
    pub fn new() -> Self {
        Self {
            head: ResponseHead::default(),
            pending: Vec::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            committed_head: None,
            body: Vec::new(),
        }
    }

    /// Set how many bytes are held back before committing.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// The committed head, or the pending one if nothing was committed.
    pub fn head(&self) -> &ResponseHead {
        self.committed_head.as_ref().unwrap_or(&self.head)
    }

    pub fn status(&self) -> StatusCode {
        self.head().status
    }

    /// Committed body bytes followed by any held-back bytes.
    pub fn body(&self) -> Vec<u8> {
        let mut body = self.body.clone();
        body.extend_from_slice(&self.pending);
        body
    }

    fn commit(&mut self) {
        if self.committed_head.is_none() {
            self.committed_head = Some(self.head.clone());
        }
        self.body.append(&mut self.pending);
    }
}

impl Write for BufferedResponse {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        if self.committed_head.is_some() || self.pending.len() > self.buffer_size {
            self.commit();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.commit();
        Ok(())
    }
}

impl ResponseSink for BufferedResponse {
    fn head_mut(&mut self) -> &mut ResponseHead {
        &mut self.head
    }

    fn is_committed(&self) -> bool {
        self.committed_head.is_some()
    }

    fn reset(&mut self) {
        self.head = ResponseHead::default();
        self.pending.clear();
    }
}
