use std::fs;
use std::io::{self, Read};
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::debug;

use crate::config::RepositorySource;
use crate::domain::{
    manifest_file_name, resource_file_name, ResourceCategory, ResourceKind, SiteId,
};
use crate::error::WindsolError;

/// Transport seam to the remote resource repository. One implementation
/// per repository flavor; tests substitute their own.
pub trait Fetcher: Send + Sync {
    /// One site's resource file, as raw bytes.
    fn fetch(
        &self,
        category: ResourceCategory,
        kind: ResourceKind,
        site_id: SiteId,
    ) -> Result<Vec<u8>, WindsolError>;

    /// The per-category site manifest.
    fn fetch_manifest(&self, category: ResourceCategory) -> Result<Vec<u8>, WindsolError>;
}

/// Repository-backed fetcher chosen from configuration at startup.
pub enum RepositoryFetcher {
    Http(HttpFetcher),
    Fs(FsFetcher),
}

impl RepositoryFetcher {
    pub fn from_source(source: &RepositorySource) -> Result<Self, WindsolError> {
        match source {
            RepositorySource::Http { url, timeout_secs } => {
                Ok(Self::Http(HttpFetcher::new(url.clone(), *timeout_secs)?))
            }
            RepositorySource::Filesystem { root } => Ok(Self::Fs(FsFetcher::new(root.clone()))),
        }
    }
}

impl Fetcher for RepositoryFetcher {
    fn fetch(
        &self,
        category: ResourceCategory,
        kind: ResourceKind,
        site_id: SiteId,
    ) -> Result<Vec<u8>, WindsolError> {
        match self {
            Self::Http(fetcher) => fetcher.fetch(category, kind, site_id),
            Self::Fs(fetcher) => fetcher.fetch(category, kind, site_id),
        }
    }

    fn fetch_manifest(&self, category: ResourceCategory) -> Result<Vec<u8>, WindsolError> {
        match self {
            Self::Http(fetcher) => fetcher.fetch_manifest(category),
            Self::Fs(fetcher) => fetcher.fetch_manifest(category),
        }
    }
}

/// HTTP repository client. Retries transient failures with a short
/// linear backoff; per-request timeout comes from configuration.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    base_url: String,
}

impl HttpFetcher {
    pub fn new(base_url: String, timeout_secs: u64) -> Result<Self, WindsolError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("windsol/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| WindsolError::FetchHttp(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|err| WindsolError::FetchHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, WindsolError> {
        let response = self.send_with_retries(|| self.client.get(url))?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Err(WindsolError::FetchMissing(url.to_string()));
        }
        if !status.is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "repository request failed".to_string());
            return Err(WindsolError::FetchStatus {
                status: status.as_u16(),
                message,
            });
        }
        let bytes = response
            .bytes()
            .map_err(|err| WindsolError::FetchHttp(err.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<reqwest::blocking::Response, WindsolError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(WindsolError::FetchHttp(err.to_string()));
                }
            }
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(
        &self,
        category: ResourceCategory,
        kind: ResourceKind,
        site_id: SiteId,
    ) -> Result<Vec<u8>, WindsolError> {
        let name = resource_file_name(category, kind, site_id);
        let url = format!("{}/{category}/{name}", self.base_url);
        debug!("fetching {}", url);
        self.get_bytes(&url)
    }

    /// Manifests may be hosted gzipped; both the plain name and a `.gz`
    /// sibling are accepted, decompressed transparently.
    fn fetch_manifest(&self, category: ResourceCategory) -> Result<Vec<u8>, WindsolError> {
        let name = manifest_file_name(category);
        let url = format!("{}/{category}/{name}", self.base_url);
        let bytes = match self.get_bytes(&url) {
            Ok(bytes) => bytes,
            Err(WindsolError::FetchMissing(_)) => self.get_bytes(&format!("{url}.gz"))?,
            Err(err) => return Err(err),
        };
        gunzip_if_compressed(bytes).map_err(|err| WindsolError::FetchHttp(err.to_string()))
    }
}

/// Local or mounted repository mirror, read with plain file access.
#[derive(Debug, Clone)]
pub struct FsFetcher {
    root: Utf8PathBuf,
}

impl FsFetcher {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn read(&self, category: ResourceCategory, name: &str) -> Result<Vec<u8>, WindsolError> {
        let path = self.root.join(category.as_str()).join(name);
        if !path.as_std_path().is_file() {
            return Err(WindsolError::FetchMissing(path.to_string()));
        }
        fs::read(path.as_std_path()).map_err(|err| WindsolError::Filesystem(err.to_string()))
    }
}

impl Fetcher for FsFetcher {
    fn fetch(
        &self,
        category: ResourceCategory,
        kind: ResourceKind,
        site_id: SiteId,
    ) -> Result<Vec<u8>, WindsolError> {
        self.read(category, &resource_file_name(category, kind, site_id))
    }

    fn fetch_manifest(&self, category: ResourceCategory) -> Result<Vec<u8>, WindsolError> {
        let name = manifest_file_name(category);
        let bytes = match self.read(category, &name) {
            Ok(bytes) => bytes,
            Err(WindsolError::FetchMissing(_)) => self.read(category, &format!("{name}.gz"))?,
            Err(err) => return Err(err),
        };
        gunzip_if_compressed(bytes).map_err(|err| WindsolError::Filesystem(err.to_string()))
    }
}

fn gunzip_if_compressed(bytes: Vec<u8>) -> io::Result<Vec<u8>> {
    if !bytes.starts_with(&[0x1f, 0x8b]) {
        return Ok(bytes);
    }
    let mut decoder = GzDecoder::new(bytes.as_slice());
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
