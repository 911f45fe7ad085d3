//! Conditional download of remote catalog and archive files.

use crate::error::{ChainError, Result};
use reqwest::blocking::Client;
use reqwest::header::LAST_MODIFIED;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// How files are fetched from a remote catalog.
pub trait Transport {
    /// `Last-Modified` of the remote resource, if the server reports one.
    fn last_modified(&self, url: &str) -> Result<Option<SystemTime>>;

    /// Stream the resource body into `dest`, returning the bytes written.
    fn download(&self, url: &str, dest: &mut dyn Write) -> Result<u64>;
}

/// Transport over HTTP(S).
#[derive(Clone, Debug, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Transport for HttpTransport {
    fn last_modified(&self, url: &str) -> Result<Option<SystemTime>> {
        let response = self.client.head(url).send()?.error_for_status()?;
        Ok(response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_http_date))
    }

    fn download(&self, url: &str, dest: &mut dyn Write) -> Result<u64> {
        let mut response = self.client.get(url).send()?.error_for_status()?;
        Ok(response.copy_to(dest)?)
    }
}

/// Parse an HTTP date such as `Wed, 21 Oct 2015 07:28:00 GMT`.
pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    chrono::DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(SystemTime::from)
}

/// What [`fetch_cached_file`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Downloaded a fresh copy.
    Fetched,
    /// The cached copy is current.
    Cached,
    /// The remote could not be reached; the existing cache was kept.
    StaleFallback,
}

/// Make sure `dest` holds a current copy of `url`.
///
/// An existing cache is only replaced when the remote `Last-Modified` is
/// strictly newer than the cache's mtime. If the remote cannot be reached the
/// cache is used as is; without a cache the failure is returned.
pub fn fetch_cached_file(transport: &dyn Transport, url: &str, dest: &Path) -> Result<FetchOutcome> {
    let cached = fs::metadata(dest).and_then(|m| m.modified()).ok();

    if let Some(cached) = cached {
        match transport.last_modified(url) {
            Ok(Some(remote)) if remote <= cached => {
                debug!(url, path = %dest.display(), "cache is current");
                return Ok(FetchOutcome::Cached);
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(url, "no Last-Modified header, keeping cache");
                return Ok(FetchOutcome::Cached);
            }
            Err(e) => {
                warn!(url, error = %e, "remote unreachable, using cached copy");
                return Ok(FetchOutcome::StaleFallback);
            }
        }
    }

    match download_to(transport, url, dest) {
        Ok(bytes) => {
            info!(url, path = %dest.display(), bytes, "fetched");
            Ok(FetchOutcome::Fetched)
        }
        Err(e) if cached.is_some() => {
            warn!(url, error = %e, "download failed, using cached copy");
            Ok(FetchOutcome::StaleFallback)
        }
        Err(e) => Err(e),
    }
}

/// Download next to `dest` and rename into place, so a failed transfer never
/// clobbers the cache.
fn download_to(transport: &dyn Transport, url: &str, dest: &Path) -> Result<u64> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let partial = partial_path(dest);

    let result: Result<u64> = File::create(&partial)
        .map_err(ChainError::from)
        .and_then(|file| {
            let mut writer = BufWriter::new(file);
            let bytes = transport.download(url, &mut writer)?;
            writer.flush()?;
            Ok(bytes)
        });

    match result {
        Ok(bytes) => {
            fs::rename(&partial, dest)?;
            Ok(bytes)
        }
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(e)
        }
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}
