//! FTP session helpers
//!
//! `suppaftp`'s blocking client runs inside `spawn_blocking`. Every operation
//! opens its own short session (connect, EPSV, login, binary) so entries can
//! be opened independently of the directory walk, and retries with a linear
//! backoff before giving up.

use std::io::{Cursor, Read};
use std::time::Duration;
use suppaftp::FtpStream;
use tracing::{debug, warn};

use super::ProviderError;

/// Connection parameters for one FTP endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Attempts per operation before the error is returned
    pub max_retries: u32,
    /// Delay before retry `n` is `n * retry_delay`
    pub retry_delay: Duration,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 21,
            username: "anonymous".to_string(),
            password: "scanetl@localhost".to_string(),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// One line of a `LIST` response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpListing {
    pub name: String,
    pub is_directory: bool,
    pub size: Option<u64>,
}

impl FtpListing {
    /// Parse a Unix-style `LIST` line:
    /// `-rw-r--r--   1 ftp ftp  1234 Jan 15 12:00 hosts.csv`
    pub fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 9 {
            return None;
        }

        // names may contain spaces: everything after the time/year column
        let name = parts[8..].join(" ");
        if name == "." || name == ".." {
            return None;
        }

        Some(Self {
            name,
            is_directory: parts[0].starts_with('d'),
            size: parts[4].parse().ok(),
        })
    }
}

/// Client for one FTP endpoint
#[derive(Debug, Clone)]
pub struct FtpClient {
    config: FtpConfig,
}

impl FtpClient {
    pub fn new(config: FtpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FtpConfig {
        &self.config
    }

    /// Log in and out once to prove the endpoint is reachable.
    ///
    /// Not retried: connection failure at init time is fatal to the stage.
    pub async fn check(&self) -> Result<(), ProviderError> {
        let config = self.config.clone();
        run_blocking(move || {
            let mut stream = open_session(&config)?;
            if let Err(e) = stream.quit() {
                warn!("Failed to quit FTP session gracefully: {}", e);
            }
            Ok(())
        })
        .await
    }

    pub async fn list(&self, path: &str) -> Result<Vec<FtpListing>, ProviderError> {
        let path = path.to_string();
        self.with_retry("LIST", &path.clone(), move |config| {
            let mut stream = open_session(config)?;
            let lines = stream
                .list(Some(&path))
                .map_err(|e| ProviderError::Ftp(format!("LIST {}: {}", path, e)))?;
            if let Err(e) = stream.quit() {
                warn!("Failed to quit FTP session gracefully: {}", e);
            }
            Ok(lines.iter().filter_map(|l| FtpListing::parse(l)).collect())
        })
        .await
    }

    pub async fn download(&self, path: &str) -> Result<Vec<u8>, ProviderError> {
        let path = path.to_string();
        self.with_retry("RETR", &path.clone(), move |config| {
            let mut stream = open_session(config)?;
            let mut reader = stream
                .retr_as_buffer(&path)
                .map_err(|e| ProviderError::Ftp(format!("RETR {}: {}", path, e)))?;
            let mut data = Vec::new();
            reader
                .read_to_end(&mut data)
                .map_err(|e| ProviderError::io(path.clone(), e))?;
            if let Err(e) = stream.quit() {
                warn!("Failed to quit FTP session gracefully: {}", e);
            }
            debug!("Downloaded {} bytes from {}", data.len(), path);
            Ok(data)
        })
        .await
    }

    /// Store `data` at `path`, creating missing parent directories
    pub async fn upload(&self, path: &str, data: Vec<u8>) -> Result<u64, ProviderError> {
        let path = path.to_string();
        self.with_retry("STOR", &path.clone(), move |config| {
            let mut stream = open_session(config)?;
            if let Some((parent, _)) = path.rsplit_once('/') {
                let mut current = String::new();
                for segment in parent.split('/').filter(|s| !s.is_empty()) {
                    current.push('/');
                    current.push_str(segment);
                    // already-existing directories make MKD fail; that is fine
                    let _ = stream.mkdir(&current);
                }
            }
            let written = stream
                .put_file(&path, &mut Cursor::new(data.clone()))
                .map_err(|e| ProviderError::Ftp(format!("STOR {}: {}", path, e)))?;
            if let Err(e) = stream.quit() {
                warn!("Failed to quit FTP session gracefully: {}", e);
            }
            Ok(written)
        })
        .await
    }

    async fn with_retry<T, F>(&self, op: &str, path: &str, f: F) -> Result<T, ProviderError>
    where
        T: Send + 'static,
        F: Fn(&FtpConfig) -> Result<T, ProviderError> + Send + Sync + Clone + 'static,
    {
        let attempts = self.config.max_retries.max(1);
        let mut attempt = 1;
        loop {
            debug!("{} attempt {}/{} for: {}", op, attempt, attempts, path);
            let config = self.config.clone();
            let f = f.clone();
            match run_blocking(move || f(&config)).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    let delay = self.config.retry_delay * attempt;
                    warn!(
                        "{} attempt {}/{} failed: {}. Retrying in {:?}...",
                        op, attempt, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }
}

fn open_session(config: &FtpConfig) -> Result<FtpStream, ProviderError> {
    debug!("Connecting to FTP server: {}:{}", config.host, config.port);
    let mut stream = FtpStream::connect(format!("{}:{}", config.host, config.port))
        .map_err(|e| ProviderError::Ftp(format!("connect {}: {}", config.host, e)))?;

    // Extended passive mode behaves better behind NAT
    stream.set_mode(suppaftp::Mode::ExtendedPassive);

    stream
        .login(&config.username, &config.password)
        .map_err(|e| ProviderError::Ftp(format!("login as {}: {}", config.username, e)))?;
    stream
        .transfer_type(suppaftp::types::FileType::Binary)
        .map_err(|e| ProviderError::Ftp(format!("binary mode: {}", e)))?;
    Ok(stream)
}

async fn run_blocking<T, F>(f: F) -> Result<T, ProviderError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ProviderError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProviderError::Task(format!("FTP task failed: {}", e)))?
}
