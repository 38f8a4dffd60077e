//! Connection and cadence parameters for the update client, fixed at
//! startup. Everything after construction is a read-only view.

use std::time::Duration;

use thiserror::Error;

use crate::common::version::SIZEOF_APP_DESC;

pub const INFO_PATH: &str = "/info";
pub const STATIC_PATH: &str = "/static";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_HTTP_REQUEST_SIZE: usize = 8192;
pub const DEFAULT_MAX_CHUNK_RETRIES: u32 = 3;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid server url `{0}`")]
    InvalidUrl(String),
    #[error("unsupported scheme `{0}`, expected http or https")]
    UnsupportedScheme(String),
    #[error("max http request size {0} cannot cover the {SIZEOF_APP_DESC} byte descriptor")]
    RequestSizeTooSmall(usize),
    #[error("invalid image filename `{0}`")]
    InvalidFilename(String),
}

/// Immutable client configuration.
///
/// The server is expected to expose `GET /info` (plain text image filename,
/// empty when nothing is staged) and `GET /static/{filename}` with `Range`
/// support.
#[derive(Clone, Debug)]
pub struct UpdateConfig {
    base_url: String,
    trust_anchor: Option<Vec<u8>>,
    max_http_request_size: usize,
    poll_interval: Duration,
    chunk_timeout: Duration,
    max_chunk_retries: u32,
}

impl UpdateConfig {
    /// Validates and normalizes the server url; a missing port becomes the
    /// scheme default.
    pub fn new(server_url: &str) -> Result<Self, ConfigError> {
        let uri = server_url
            .parse::<hyper::Uri>()
            .map_err(|_| ConfigError::InvalidUrl(server_url.to_owned()))?;
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| ConfigError::InvalidUrl(server_url.to_owned()))?;
        let default_port = match scheme {
            "https" => 443,
            "http" => 80,
            other => return Err(ConfigError::UnsupportedScheme(other.to_owned())),
        };
        let authority = uri
            .authority()
            .ok_or_else(|| ConfigError::InvalidUrl(server_url.to_owned()))?;

        let mut base_url = format!("{}://{}", scheme, authority);
        if authority.port().is_none() {
            base_url.push_str(&format!(":{}", default_port));
        }
        let path = uri.path().trim_end_matches('/');
        if !path.is_empty() {
            base_url.push_str(path);
        }

        Ok(Self {
            base_url,
            trust_anchor: None,
            max_http_request_size: DEFAULT_MAX_HTTP_REQUEST_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
            max_chunk_retries: DEFAULT_MAX_CHUNK_RETRIES,
        })
    }

    /// PEM encoded certificate the server must present, overriding the
    /// platform roots.
    pub fn with_trust_anchor(mut self, pem: Vec<u8>) -> Self {
        self.trust_anchor = Some(pem);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    pub fn with_max_chunk_retries(mut self, retries: u32) -> Self {
        self.max_chunk_retries = retries;
        self
    }

    /// Upper bound on the bytes requested per ranged request. Must at least
    /// cover the application descriptor.
    pub fn with_max_http_request_size(mut self, size: usize) -> Result<Self, ConfigError> {
        if size < SIZEOF_APP_DESC {
            return Err(ConfigError::RequestSizeTooSmall(size));
        }
        self.max_http_request_size = size;
        Ok(self)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn trust_anchor(&self) -> Option<&[u8]> {
        self.trust_anchor.as_deref()
    }

    pub fn max_http_request_size(&self) -> usize {
        self.max_http_request_size
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn chunk_timeout(&self) -> Duration {
        self.chunk_timeout
    }

    pub fn max_chunk_retries(&self) -> u32 {
        self.max_chunk_retries
    }

    pub fn info_uri(&self) -> Result<hyper::Uri, ConfigError> {
        format!("{}{}", self.base_url, INFO_PATH)
            .parse()
            .map_err(|_| ConfigError::InvalidUrl(self.base_url.clone()))
    }

    /// Image endpoint for a filename announced by `/info`. The filename is a
    /// single path segment; anything else from the server is rejected.
    pub fn image_uri(&self, filename: &str) -> Result<hyper::Uri, ConfigError> {
        if filename.is_empty()
            || filename.contains(['/', '\\'])
            || filename.starts_with('.')
            || filename.chars().any(|c| c.is_ascii_control())
        {
            return Err(ConfigError::InvalidFilename(filename.to_owned()));
        }
        format!("{}{}/{}", self.base_url, STATIC_PATH, filename)
            .parse()
            .map_err(|_| ConfigError::InvalidFilename(filename.to_owned()))
    }
}
