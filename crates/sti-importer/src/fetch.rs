//! Fetching source content
//!
//! A [`Locator`] names where a source unit lives: a URL (`http`, `https`,
//! `ftp`) or a local file. [`RemoteFetcher`] turns a locator into the unit's
//! full text. HTTP bodies are decoded with the configured charset unless the
//! server names one, FTP and file content must be UTF-8.

use crate::error::{ImportError, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;
use suppaftp::FtpStream;
use tracing::{debug, info, warn};
use url::Url;

/// Default charset for HTTP bodies without a declared charset
pub const DEFAULT_CHARSET: &str = "utf-8";

const DEFAULT_TIMEOUT_SECS: u64 = 300;
const FTP_DEFAULT_PORT: u16 = 21;

/// Where a source unit's content lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Url(Url),
    File(PathBuf),
}

impl Locator {
    /// Parse a URL, or treat the input as a file path when it has no scheme
    ///
    /// `file://` URLs become file locators. Any other scheme is kept as a URL
    /// and rejected at fetch time.
    pub fn parse(raw: &str) -> Self {
        match Url::parse(raw) {
            // Single letter "schemes" are drive letters, not URLs.
            Ok(url) if url.scheme().len() > 1 => {
                if url.scheme() == "file" {
                    if let Ok(path) = url.to_file_path() {
                        return Locator::File(path);
                    }
                }
                Locator::Url(url)
            }
            _ => Locator::File(PathBuf::from(raw)),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Url(url) => write!(f, "{}", url),
            Locator::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Full text content of the unit at `locator`
    async fn fetch(&self, locator: &Locator) -> Result<String>;
}

/// Fetches over HTTP(S) and FTP, and reads local files
#[derive(Debug, Clone)]
pub struct RemoteFetcher {
    client: Client,
    charset: String,
}

impl RemoteFetcher {
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sti-importer/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ImportError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            charset: DEFAULT_CHARSET.to_string(),
        })
    }

    /// Charset for HTTP bodies that do not declare one
    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    async fn fetch_http(&self, url: &Url) -> Result<String> {
        debug!(url = %url, "Fetching over HTTP");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ImportError::fetch(url, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImportError::fetch(url, format!("HTTP {}", status)));
        }

        let body = response
            .text_with_charset(&self.charset)
            .await
            .map_err(|e| ImportError::fetch(url, e.to_string()))?;
        info!("Fetched {} ({} bytes)", url, body.len());
        Ok(body)
    }

    async fn fetch_ftp(&self, url: &Url) -> Result<String> {
        let target = FtpTarget::from_url(url)?;
        let data = tokio::task::spawn_blocking(move || target.download())
            .await
            .map_err(|e| ImportError::fetch(url, format!("FTP download task panicked: {}", e)))?
            .map_err(|e| ImportError::fetch(url, e))?;

        info!("Fetched {} ({} bytes)", url, data.len());
        String::from_utf8(data)
            .map_err(|e| ImportError::format(format!("{} is not valid UTF-8: {}", url, e)))
    }
}

#[async_trait]
impl ContentFetcher for RemoteFetcher {
    async fn fetch(&self, locator: &Locator) -> Result<String> {
        match locator {
            Locator::File(path) => tokio::fs::read_to_string(path)
                .await
                .map_err(|e| ImportError::fetch(locator, e.to_string())),
            Locator::Url(url) => match url.scheme() {
                "http" | "https" => self.fetch_http(url).await,
                "ftp" => self.fetch_ftp(url).await,
                other => Err(ImportError::UnsupportedScheme(other.to_string())),
            },
        }
    }
}

/// Connection details of one FTP download
#[derive(Debug, Clone)]
struct FtpTarget {
    host: String,
    port: u16,
    username: String,
    password: String,
    path: String,
}

impl FtpTarget {
    fn from_url(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| ImportError::fetch(url, "FTP URL has no host"))?
            .to_string();

        let username = match url.username() {
            "" => "anonymous".to_string(),
            user => urlencoding::decode(user)
                .map(|u| u.into_owned())
                .unwrap_or_else(|_| user.to_string()),
        };
        let password = url
            .password()
            .map(|p| {
                urlencoding::decode(p)
                    .map(|p| p.into_owned())
                    .unwrap_or_else(|_| p.to_string())
            })
            .unwrap_or_else(|| "anonymous@".to_string());

        Ok(Self {
            host,
            port: url.port().unwrap_or(FTP_DEFAULT_PORT),
            username,
            password,
            path: url.path().to_string(),
        })
    }

    fn download(&self) -> std::result::Result<Vec<u8>, String> {
        debug!("Connecting to FTP server: {}:{}", self.host, self.port);
        let mut ftp_stream = FtpStream::connect(format!("{}:{}", self.host, self.port))
            .map_err(|e| format!("Failed to connect to FTP server: {}", e))?;

        ftp_stream.set_mode(suppaftp::Mode::ExtendedPassive);

        ftp_stream
            .login(&self.username, &self.password)
            .map_err(|e| format!("Failed to login to FTP server: {}", e))?;
        ftp_stream
            .transfer_type(suppaftp::types::FileType::Binary)
            .map_err(|e| format!("Failed to set binary mode: {}", e))?;

        let mut reader = ftp_stream
            .retr_as_buffer(&self.path)
            .map_err(|e| format!("Failed to download file {}: {}", self.path, e))?;
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| format!("Failed to read file data: {}", e))?;

        if let Err(e) = ftp_stream.quit() {
            warn!("Failed to quit FTP session gracefully: {}", e);
        }

        Ok(data)
    }
}
