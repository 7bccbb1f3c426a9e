//! HTTP front end.
//!
//! Every `GET` is turned into a [`RequestedData`] and handed to the finder on
//! the blocking pool. The finder writes into a [`ChannelSink`], which ships
//! the response head through a oneshot channel and the body as a stream of
//! chunks:
//!
//! ```text
//!   axum handler                       spawn_blocking
//!   ────────────                       ──────────────
//!   build RequestedData  ──────────▶   finder.find_and_serve(sink)
//!   await head  ◀──── oneshot ──────   sink commits (first flush/overflow)
//!   stream body ◀──── mpsc ─────────   sink writes chunks
//! ```
//!
//! Failures before the sink commits become a plain error response with the
//! status from [`ProxyError::status_code`]. Failures after commit abort the
//! body stream, which drops the client connection.

use std::io::{self, Write};
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST, IF_MODIFIED_SINCE, LAST_MODIFIED, USER_AGENT};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use repocache::app::ProxyApp;
use repocache::finder::RepoFinder;
use repocache::request::RequestedData;
use repocache::response::{ResponseHead, ResponseSink, DEFAULT_BUFFER_SIZE};
use repocache::util::{format_http_date, parse_http_date};
use repocache::{ProxyError, ProxyResult};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

use crate::error::CliError;

/// Body chunks buffered between the blocking writer and the client.
const BODY_CHANNEL_CAPACITY: usize = 16;

/// Shared handler state.
#[derive(Clone)]
pub struct ServerState {
    finder: Arc<RepoFinder>,
    next_request_id: Arc<AtomicU64>,
}

impl ServerState {
    pub fn new(finder: Arc<RepoFinder>) -> Self {
        Self {
            finder,
            next_request_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

/// Build the router serving every path.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/*path", get(handle))
        .with_state(state)
}

/// Listen on the configured address until Ctrl-C or engine shutdown.
pub async fn serve(app: &ProxyApp) -> Result<(), CliError> {
    let settings = &app.config().server;
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| CliError::Bind {
            addr: addr.clone(),
            source,
        })?;
    info!(%addr, "Listening");

    let shutdown = app.shutdown_token();
    axum::serve(listener, router(ServerState::new(app.finder())))
        .with_graceful_shutdown(wait_for_shutdown(shutdown))
        .await
        .map_err(CliError::Serve)?;

    info!("Listener stopped");
    Ok(())
}

async fn wait_for_shutdown(token: CancellationToken) {
    tokio::select! {
        biased;

        _ = token.cancelled() => {}
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Interrupt received, shutting down"),
                Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C"),
            }
            token.cancel();
        }
    }
}

async fn handle(State(state): State<ServerState>, uri: Uri, headers: HeaderMap) -> Response {
    let id = state.next_request_id.fetch_add(1, Ordering::Relaxed);
    let span = info_span!("request", id, path = uri.path());

    let request = match build_request(&uri, &headers) {
        Ok(request) => request,
        Err(e) => {
            span.in_scope(|| debug!(error = %e, "Rejected request"));
            return error_response(&e);
        }
    };

    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, mut body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    let finder = Arc::clone(&state.finder);

    tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        let mut sink = ChannelSink::new(head_tx, body_tx);
        let result = finder.find_and_serve(&request, &mut sink);
        match &result {
            Ok(outcome) => debug!(from_cache = outcome.from_cache(), "Served"),
            Err(e) => info!(error = %e, "Request failed"),
        }
        sink.finish(result.map(|_| ()));
    });

    match head_rx.await {
        Ok(Ok(head)) => {
            let body = futures::stream::unfold(body_rx, |mut rx| async move {
                rx.recv().await.map(|chunk| (chunk, rx))
            });
            build_response(&head, Body::from_stream(body))
        }
        Ok(Err((status, message))) => {
            body_rx.close();
            (status, message).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Translate an incoming request into the engine's request model.
///
/// The path is handed over still encoded; [`RequestedData::parse`] decodes it.
/// The origin comes from an absolute-form URI when a client uses the proxy
/// explicitly, otherwise from the `Host` header.
fn build_request(uri: &Uri, headers: &HeaderMap) -> ProxyResult<RequestedData> {
    let mut request = RequestedData::parse(uri.path())?;

    let authority = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| header_str(headers, HOST.as_str()).map(str::to_string));
    if let Some(authority) = authority {
        let scheme = uri.scheme_str().unwrap_or("http");
        request = request.with_origin(scheme, &authority)?;
    }

    if let Some(agent) = header_str(headers, USER_AGENT.as_str()) {
        request = request.with_user_agent(agent);
    }
    if let Some(since) = header_str(headers, IF_MODIFIED_SINCE.as_str()).and_then(parse_http_date) {
        request = request.with_if_modified_since(since);
    }
    Ok(request)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn build_response(head: &ResponseHead, body: Body) -> Response {
    let mut builder = Response::builder().status(head.status);
    if let Some(content_type) = &head.content_type {
        builder = builder.header(CONTENT_TYPE, content_type.as_str());
    }
    if let Some(length) = head.content_length {
        builder = builder.header(CONTENT_LENGTH, length);
    }
    if let Some(modified) = head.last_modified {
        builder = builder.header(LAST_MODIFIED, format_http_date(modified));
    }
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn error_response(error: &ProxyError) -> Response {
    (error.status_code(), error.to_string()).into_response()
}

type HeadResult = Result<ResponseHead, (StatusCode, String)>;

/// Sink bridging the blocking finder and the async response body.
///
/// Holds back up to [`DEFAULT_BUFFER_SIZE`] bytes so that an attempt which
/// fails early can still be retried on the next mirror.
pub struct ChannelSink {
    head: ResponseHead,
    head_tx: Option<oneshot::Sender<HeadResult>>,
    body_tx: mpsc::Sender<io::Result<Bytes>>,
    pending: Vec<u8>,
}

impl ChannelSink {
    pub fn new(head_tx: oneshot::Sender<HeadResult>, body_tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        Self {
            head: ResponseHead::default(),
            head_tx: Some(head_tx),
            body_tx,
            pending: Vec::new(),
        }
    }

    fn commit(&mut self) -> io::Result<()> {
        if let Some(head_tx) = self.head_tx.take() {
            head_tx
                .send(Ok(self.head.clone()))
                .map_err(|_| client_gone())?;
        }
        if !self.pending.is_empty() {
            let chunk = Bytes::from(mem::take(&mut self.pending));
            self.body_tx.blocking_send(Ok(chunk)).map_err(|_| client_gone())?;
        }
        Ok(())
    }

    /// Deliver the final result of the request.
    pub fn finish(mut self, result: ProxyResult<()>) {
        match result {
            Ok(()) => {
                if let Err(e) = self.commit() {
                    debug!(error = %e, "Client went away before completion");
                }
            }
            Err(e) => match self.head_tx.take() {
                Some(head_tx) => {
                    let _ = head_tx.send(Err((e.status_code(), e.to_string())));
                }
                None => {
                    let _ = self
                        .body_tx
                        .blocking_send(Err(io::Error::new(io::ErrorKind::Other, e.to_string())));
                }
            },
        }
    }
}

fn client_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected")
}

impl Write for ChannelSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        if self.head_tx.is_none() || self.pending.len() > DEFAULT_BUFFER_SIZE {
            self.commit()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.commit()
    }
}

impl ResponseSink for ChannelSink {
    fn head_mut(&mut self) -> &mut ResponseHead {
        &mut self.head
    }

    fn is_committed(&self) -> bool {
        self.head_tx.is_none()
    }

    fn reset(&mut self) {
        if self.head_tx.is_some() {
            self.head = ResponseHead::default();
            self.pending.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read as _};
    use std::net::TcpListener;
    use std::thread;

    use axum::http::HeaderValue;
    use repocache::config::{BackendConfig, ProxyConfig};
    use repocache::package::BackendType;
    use tempfile::TempDir;

    fn channels() -> (
        ChannelSink,
        oneshot::Receiver<HeadResult>,
        mpsc::Receiver<io::Result<Bytes>>,
    ) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        (ChannelSink::new(head_tx, body_tx), head_rx, body_rx)
    }

    #[test]
    fn test_build_request_uses_host_header() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("deb.debian.org"));
        headers.insert(USER_AGENT, HeaderValue::from_static("Debian APT-HTTP/1.3"));
        headers.insert(
            IF_MODIFIED_SINCE,
            HeaderValue::from_static("Sun, 06 Nov 1994 08:49:37 GMT"),
        );
        let uri = Uri::from_static("/debian/dists/stable/Release");

        let request = build_request(&uri, &headers).unwrap();

        assert_eq!(request.backend(), "debian");
        assert_eq!(request.target(), "/dists/stable/Release");
        assert_eq!(request.host(), Some("deb.debian.org"));
        assert_eq!(request.user_agent(), Some("Debian APT-HTTP/1.3"));
        assert!(request.if_modified_since().is_some());
    }

    #[test]
    fn test_build_request_prefers_absolute_uri() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("ignored.example"));
        let uri: Uri = "http://ftp.de.debian.org/debian/pool/main/a/apt/apt_2.6.1_amd64.deb"
            .parse()
            .unwrap();

        let request = build_request(&uri, &headers).unwrap();

        assert_eq!(request.host(), Some("ftp.de.debian.org"));
        assert_eq!(request.file_name(), "apt_2.6.1_amd64.deb");
    }

    #[test]
    fn test_build_request_decodes_path() {
        let uri = Uri::from_static("/debian/pool/main/p/pkg/pkg_1.0%7erc1-1_all.deb");

        let request = build_request(&uri, &HeaderMap::new()).unwrap();

        assert_eq!(request.target(), "/pool/main/p/pkg/pkg_1.0~rc1-1_all.deb");
        assert_eq!(request.file_name(), "pkg_1.0~rc1-1_all.deb");
    }

    #[test]
    fn test_build_request_rejects_encoded_traversal() {
        let uri = Uri::from_static("/debian/%2e%2e/%2e%2e/etc/passwd");
        let err = build_request(&uri, &HeaderMap::new()).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_build_request_ignores_bad_date() {
        let mut headers = HeaderMap::new();
        headers.insert(IF_MODIFIED_SINCE, HeaderValue::from_static("yesterday"));
        let uri = Uri::from_static("/debian/dists/stable/Release");

        let request = build_request(&uri, &headers).unwrap();

        assert!(request.if_modified_since().is_none());
        assert!(request.host().is_none());
    }

    #[test]
    fn test_build_request_rejects_traversal() {
        let uri = Uri::from_static("/debian/../etc/passwd");
        let err = build_request(&uri, &HeaderMap::new()).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_sink_holds_small_body_until_flush() {
        let (mut sink, mut head_rx, mut body_rx) = channels();
        sink.head_mut().status = StatusCode::OK;
        sink.write_all(b"hello").unwrap();

        assert!(!sink.is_committed());
        assert!(head_rx.try_recv().is_err());

        sink.flush().unwrap();
        assert!(sink.is_committed());
        assert_eq!(head_rx.try_recv().unwrap().unwrap().status, StatusCode::OK);
        assert_eq!(body_rx.try_recv().unwrap().unwrap(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_sink_commits_on_overflow() {
        let (mut sink, mut head_rx, mut body_rx) = channels();
        sink.write_all(&vec![7u8; DEFAULT_BUFFER_SIZE + 1]).unwrap();

        assert!(sink.is_committed());
        assert!(head_rx.try_recv().unwrap().is_ok());
        assert_eq!(body_rx.try_recv().unwrap().unwrap().len(), DEFAULT_BUFFER_SIZE + 1);
    }

    #[test]
    fn test_sink_reset_discards_uncommitted_attempt() {
        let (mut sink, mut head_rx, mut body_rx) = channels();
        sink.head_mut().content_length = Some(99);
        sink.write_all(b"partial").unwrap();
        sink.reset();
        sink.write_all(b"second").unwrap();
        sink.flush().unwrap();

        let head = head_rx.try_recv().unwrap().unwrap();
        assert_eq!(head.content_length, None);
        assert_eq!(body_rx.try_recv().unwrap().unwrap(), Bytes::from_static(b"second"));
    }

    #[test]
    fn test_sink_reports_error_before_commit() {
        let (sink, mut head_rx, _body_rx) = channels();
        sink.finish(Err(ProxyError::ResourceUnavailable("/debian/x".to_string())));

        let (status, message) = head_rx.try_recv().unwrap().unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(message.contains("/debian/x"));
    }

    #[test]
    fn test_sink_aborts_stream_after_commit() {
        let (mut sink, _head_rx, mut body_rx) = channels();
        sink.write_all(b"data").unwrap();
        sink.flush().unwrap();
        sink.finish(Err(ProxyError::IncompleteTransfer {
            url: "http://mirror/debian/x".to_string(),
            expected: 10,
            received: 4,
        }));

        assert!(body_rx.try_recv().unwrap().is_ok());
        assert!(body_rx.try_recv().unwrap().is_err());
    }

    /// Serve one canned HTTP response on a local port.
    fn serve_once(body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 && line != "\r\n" {
                line.clear();
            }
            let mut stream = stream;
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nLast-Modified: Sun, 06 Nov 1994 08:49:37 GMT\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            )
            .unwrap();
        });
        port
    }

    #[test]
    fn test_handle_streams_upstream_body() {
        let port = serve_once("package bytes");
        let temp = TempDir::new().unwrap();
        let config = ProxyConfig::new(temp.path()).with_backend(
            BackendConfig::new("debian", BackendType::Deb)
                .with_url(format!("http://127.0.0.1:{}/debian", port)),
        );
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let mut app = ProxyApp::start(config, runtime.handle()).unwrap();
        let state = ServerState::new(app.finder());

        let response = runtime.block_on(handle(
            State(state),
            Uri::from_static("/debian/pool/main/h/hello/hello_2.10-3_amd64.deb"),
            HeaderMap::new(),
        ));

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(LAST_MODIFIED).unwrap(),
            "Sun, 06 Nov 1994 08:49:37 GMT"
        );
        let body = runtime
            .block_on(axum::body::to_bytes(response.into_body(), usize::MAX))
            .unwrap();
        assert_eq!(&body[..], b"package bytes");

        let cached = temp
            .path()
            .join("debian/pool/main/h/hello/hello_2.10-3_amd64.deb");
        let mut stored = String::new();
        std::fs::File::open(cached)
            .unwrap()
            .read_to_string(&mut stored)
            .unwrap();
        assert_eq!(stored, "package bytes");

        runtime.block_on(app.shutdown());
    }

    #[test]
    fn test_handle_unknown_backend_is_bad_request() {
        let temp = TempDir::new().unwrap();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let mut app = ProxyApp::start(ProxyConfig::new(temp.path()), runtime.handle()).unwrap();
        let state = ServerState::new(app.finder());

        let response = runtime.block_on(handle(
            State(state),
            Uri::from_static("/nowhere/file"),
            HeaderMap::new(),
        ));

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        runtime.block_on(app.shutdown());
    }
}
