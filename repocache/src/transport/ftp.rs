//! Anonymous FTP transport.
//!
//! Each fetch opens its own control connection: login as `anonymous`,
//! passive mode, binary type, `LIST` of exactly the target path. The
//! listing decides existence and freshness; `RETR` only runs when the
//! remote file is newer than the local copy.

use std::io::{self, Read};
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use percent_encoding::percent_decode_str;
use suppaftp::list::File as ListEntry;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode, Status};
use tracing::{debug, warn};
use url::Url;

use super::{FetchedResource, Fetcher};
use crate::config::FtpSettings;
use crate::error::{ProxyError, ProxyResult};

const DEFAULT_FTP_PORT: u16 = 21;

/// Passive-mode anonymous FTP fetcher.
#[derive(Debug, Clone)]
pub struct FtpFetcher {
    connect_timeout: Duration,
    socket_timeout: Duration,
    data_timeout: Duration,
}

impl FtpFetcher {
    pub fn new(settings: &FtpSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout,
            socket_timeout: settings.socket_timeout,
            data_timeout: settings.data_timeout,
        }
    }

    fn connect(&self, url: &Url) -> ProxyResult<FtpStream> {
        let address = socket_address(url)?;
        let stream = FtpStream::connect_timeout(address, self.connect_timeout)
            .map_err(|e| ProxyError::transfer(url.as_str(), e))?;
        stream
            .get_ref()
            .set_read_timeout(Some(self.socket_timeout))?;
        Ok(stream)
    }

    fn open(
        &self,
        stream: &mut FtpStream,
        url: &Url,
        local_last_modified: Option<SystemTime>,
    ) -> ProxyResult<(ListEntry, Option<Box<dyn Read + Send>>)> {
        let failed = |e: FtpError| ProxyError::transfer(url.as_str(), e);
        let path = percent_decode_str(url.path()).decode_utf8_lossy();

        let password = crate::user_agent();
        stream
            .login("anonymous", password.as_str())
            .map_err(failed)?;
        stream.set_mode(Mode::Passive);
        stream.transfer_type(FileType::Binary).map_err(failed)?;

        let listing = match stream.list(Some(path.as_ref())) {
            Ok(lines) => lines,
            Err(FtpError::UnexpectedResponse(response))
                if response.status == Status::FileUnavailable =>
            {
                Vec::new()
            }
            Err(e) => return Err(failed(e)),
        };
        let entry = single_entry(url, &listing)?;

        if !is_newer(entry.modified(), local_last_modified) {
            return Ok((entry, None));
        }

        let data = stream.retr_as_stream(path.as_ref()).map_err(failed)?;
        data.get_ref().set_read_timeout(Some(self.data_timeout))?;
        Ok((entry, Some(Box::new(data))))
    }
}

impl Fetcher for FtpFetcher {
    fn fetch(
        &self,
        url: &Url,
        local_last_modified: Option<SystemTime>,
        _user_agent: Option<&str>,
    ) -> ProxyResult<Box<dyn FetchedResource>> {
        let mut stream = self.connect(url)?;

        match self.open(&mut stream, url, local_last_modified) {
            Ok((entry, data)) => {
                debug!(url = %url, modified = data.is_some(), "FTP listing resolved");
                Ok(Box::new(FtpResource {
                    modified: data.is_some(),
                    content_length: Some(entry.size() as u64),
                    last_modified: Some(entry.modified()),
                    retrieving: data.is_some(),
                    data: data.unwrap_or_else(|| Box::new(io::empty())),
                    stream,
                }))
            }
            Err(e) => {
                let _ = stream.quit();
                Err(e)
            }
        }
    }
}

fn socket_address(url: &Url) -> ProxyResult<SocketAddr> {
    let host = url
        .host_str()
        .ok_or_else(|| ProxyError::transfer(url.as_str(), "URL has no host"))?;
    let port = url.port().unwrap_or(DEFAULT_FTP_PORT);

    (host, port)
        .to_socket_addrs()
        .map_err(|e| ProxyError::transfer(url.as_str(), e))?
        .next()
        .ok_or_else(|| ProxyError::transfer(url.as_str(), "host did not resolve"))
}

/// The listing for a single path must contain exactly one file.
fn single_entry(url: &Url, listing: &[String]) -> ProxyResult<ListEntry> {
    let entries: Vec<&String> = listing.iter().filter(|line| !line.trim().is_empty()).collect();

    match entries.as_slice() {
        [] => Err(ProxyError::ResourceUnavailable(url.to_string())),
        [line] => ListEntry::from_str(line).map_err(|e| {
            ProxyError::transfer(url.as_str(), format!("unparseable listing '{}': {}", line, e))
        }),
        many => Err(ProxyError::transfer(
            url.as_str(),
            format!("ambiguous listing: {} entries", many.len()),
        )),
    }
}

/// Remote is newer when there is no local copy or its stamp is strictly later.
fn is_newer(remote: SystemTime, local: Option<SystemTime>) -> bool {
    local.map_or(true, |local| remote > local)
}

/// An open FTP session, possibly mid-`RETR`.
struct FtpResource {
    stream: FtpStream,
    data: Box<dyn Read + Send>,
    retrieving: bool,
    modified: bool,
    content_length: Option<u64>,
    last_modified: Option<SystemTime>,
}

impl FetchedResource for FtpResource {
    fn is_modified(&self) -> bool {
        self.modified
    }

    fn content_type(&self) -> Option<&str> {
        None
    }

    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    fn body(&mut self) -> &mut dyn Read {
        &mut self.data
    }

    fn close(self: Box<Self>) -> ProxyResult<()> {
        let FtpResource {
            mut stream,
            data,
            retrieving,
            ..
        } = *self;

        if retrieving {
            if let Err(e) = stream.finalize_retr_stream(data) {
                warn!(error = %e, "FTP transfer did not finish cleanly");
            }
        }

        stream
            .quit()
            .map_err(|e| ProxyError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))
    }
}
