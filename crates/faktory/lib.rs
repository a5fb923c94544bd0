//! Faktory network transport for mbj job enqueueing.
//!
//! [`FaktoryClient`] speaks the line-based Faktory work protocol over TCP and
//! implements [`mbj_core::Transport`], so it plugs into the Faktory adapter:
//!
//! ```rust,no_run
//! use mbj_core::{Client, Config};
//! use mbj_faktory::FaktoryClient;
//! use std::sync::Arc;
//!
//! # fn main() -> mbj_core::Result<()> {
//! let config = Config::builder()
//!     .faktory_url("tcp://:secret@localhost:7419")
//!     .strict(false)
//!     .build()?;
//! let transport = FaktoryClient::from_config(&config)?;
//! let client = Client::builder()
//!     .config(config)
//!     .faktory(Some(Arc::new(transport)))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use mbj_core::{Config, MbjError, Result, Transport};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, trace, warn};
use url::Url;

/// Port Faktory listens on when the URL names none.
pub const DEFAULT_PORT: u16 = 7419;

/// Largest bulk reply accepted from the server.
const MAX_BULK_LEN: usize = 16 * 1024 * 1024;

/// Protocol version sent in `HELLO`.
const PROTOCOL_VERSION: u8 = 2;

fn transport_error(e: impl std::fmt::Display) -> MbjError {
    MbjError::Transport(e.to_string())
}

// ========== URL ==========

/// Parsed `tcp://[:password@]host[:port]` server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaktoryUrl {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl FaktoryUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|e| {
            MbjError::Config(format!("The {:?} for faktory_url is not valid: {}", url, e))
        })?;
        if parsed.scheme() != "tcp" {
            return Err(MbjError::Config(format!(
                "The {:?} for faktory_url is not valid. It must be a tcp:// URL",
                url
            )));
        }

        let host = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .unwrap_or("localhost");
        Ok(Self {
            host: host.to_string(),
            port: parsed.port().unwrap_or(DEFAULT_PORT),
            password: parsed
                .password()
                .filter(|password| !password.is_empty())
                .map(str::to_string),
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Hash a password the way Faktory's `HELLO` expects: SHA-256 of
/// `password + salt`, re-hashed until `iterations` rounds are done, hex encoded.
pub fn password_hash(password: &str, salt: &str, iterations: u64) -> String {
    let mut digest = Sha256::digest(format!("{}{}", password, salt).as_bytes());
    for _ in 1..iterations {
        digest = Sha256::digest(digest);
    }
    hex::encode(digest)
}

// ========== Protocol ==========

#[derive(Debug, Deserialize)]
struct Hi {
    #[serde(default)]
    v: Option<u8>,
    #[serde(default)]
    i: Option<u64>,
    #[serde(default)]
    s: Option<String>,
}

#[derive(Debug, Serialize)]
struct Hello<'a> {
    hostname: String,
    pid: u32,
    labels: &'a [String],
    v: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pwdhash: Option<String>,
}

/// One authenticated connection.
#[derive(Debug)]
struct Connection {
    stream: BufStream<TcpStream>,
}

impl Connection {
    async fn open(url: &FaktoryUrl, labels: &[String]) -> Result<Self> {
        let stream = TcpStream::connect(url.address()).await.map_err(transport_error)?;
        let mut conn = Self {
            stream: BufStream::new(stream),
        };

        let greeting = conn.read_reply().await?.unwrap_or_default();
        let hi: Hi = match greeting.strip_prefix("HI ") {
            Some(json) => serde_json::from_str(json)?,
            None => return Err(transport_error(format!("Expected HI, got {:?}", greeting))),
        };
        if let Some(version) = hi.v.filter(|v| *v > PROTOCOL_VERSION) {
            warn!(version, "Faktory server speaks a newer protocol");
        }

        let pwdhash = match &hi.s {
            Some(salt) => {
                let password = url.password.as_deref().ok_or_else(|| {
                    MbjError::Config("Faktory server requires a password".to_string())
                })?;
                Some(password_hash(password, salt, hi.i.unwrap_or(1)))
            }
            None => None,
        };
        let hello = Hello {
            hostname: hostname::get()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".to_string()),
            pid: std::process::id(),
            labels,
            v: PROTOCOL_VERSION,
            pwdhash,
        };
        conn.command("HELLO", Some(&serde_json::to_string(&hello)?)).await?;
        conn.expect_ok().await?;
        debug!(address = %url.address(), "Connected to Faktory");
        Ok(conn)
    }

    async fn command(&mut self, verb: &str, arg: Option<&str>) -> Result<()> {
        let line = match arg {
            Some(arg) => format!("{} {}\r\n", verb, arg),
            None => format!("{}\r\n", verb),
        };
        trace!(verb, "Sending Faktory command");
        self.stream.write_all(line.as_bytes()).await.map_err(transport_error)?;
        self.stream.flush().await.map_err(transport_error)
    }

    /// Read one reply: `+` simple strings, `-` errors and `$` bulk strings.
    async fn read_reply(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let read = self.stream.read_line(&mut line).await.map_err(transport_error)?;
        if read == 0 {
            return Err(transport_error("Connection closed by Faktory"));
        }
        let line = line.trim_end_matches(['\r', '\n']);

        if let Some(rest) = line.strip_prefix('+') {
            return Ok(Some(rest.to_string()));
        }
        if let Some(rest) = line.strip_prefix('-') {
            return Err(MbjError::Transport(rest.to_string()));
        }
        match line.strip_prefix('$') {
            Some(len) => {
                let len: i64 = len.parse().map_err(transport_error)?;
                let Ok(len) = usize::try_from(len) else {
                    return Ok(None);
                };
                if len > MAX_BULK_LEN {
                    return Err(transport_error(format!(
                        "Bulk reply of {} bytes exceeds the {} byte limit",
                        len, MAX_BULK_LEN
                    )));
                }
                let mut buf = vec![0; len + 2];
                self.stream.read_exact(&mut buf).await.map_err(transport_error)?;
                buf.truncate(len);
                String::from_utf8(buf).map(Some).map_err(transport_error)
            }
            None => Err(transport_error(format!("Unexpected reply {:?}", line))),
        }
    }

    async fn expect_ok(&mut self) -> Result<()> {
        match self.read_reply().await? {
            Some(reply) if reply == "OK" => Ok(()),
            other => Err(transport_error(format!("Expected OK, got {:?}", other))),
        }
    }

    async fn push(&mut self, job: &Value) -> Result<()> {
        self.command("PUSH", Some(&serde_json::to_string(job)?)).await?;
        self.expect_ok().await
    }
}

// ========== Client ==========

/// Pooled Faktory client.
///
/// Up to `pool_size` connections are opened lazily and reused; callers wait at
/// most `pool_timeout` for one to become free.
#[derive(Debug)]
pub struct FaktoryClient {
    url: FaktoryUrl,
    labels: Vec<String>,
    permits: Semaphore,
    idle: Mutex<Vec<Connection>>,
    pool_size: usize,
    pool_timeout: Duration,
}

impl FaktoryClient {
    /// Create a client with default pool settings.
    pub fn new(url: &str) -> Result<Self> {
        let defaults = Config::default();
        Self::with_pool(url, defaults.pool_size, defaults.pool_timeout)
    }

    /// Create a client from `faktory_url` and the pool settings of `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let url = config.faktory_url.as_deref().ok_or_else(|| {
            MbjError::Config("Faktory transport is not configured. Set `faktory_url`".to_string())
        })?;
        Self::with_pool(url, config.pool_size, config.pool_timeout)
    }

    pub fn with_pool(url: &str, pool_size: usize, pool_timeout: Duration) -> Result<Self> {
        let pool_size = pool_size.max(1);
        Ok(Self {
            url: FaktoryUrl::parse(url)?,
            labels: vec!["rust".to_string()],
            permits: Semaphore::new(pool_size),
            idle: Mutex::new(Vec::with_capacity(pool_size)),
            pool_size,
            pool_timeout,
        })
    }

    /// Labels announced in `HELLO`.
    pub fn labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn url(&self) -> &FaktoryUrl {
        &self.url
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }
}

#[async_trait]
impl Transport for FaktoryClient {
    async fn push(&self, job: &Value) -> Result<()> {
        let _permit = tokio::time::timeout(self.pool_timeout, self.permits.acquire())
            .await
            .map_err(|_| {
                MbjError::Timeout(format!(
                    "Waited {:?} for one of {} Faktory connections",
                    self.pool_timeout, self.pool_size
                ))
            })?
            .map_err(transport_error)?;

        let idle = self.idle.lock().await.pop();
        let mut conn = match idle {
            Some(conn) => conn,
            None => Connection::open(&self.url, &self.labels).await?,
        };

        // A connection that failed mid-command is dropped, not returned.
        if let Err(e) = conn.push(job).await {
            warn!(address = %self.url.address(), error = %e, "Discarding Faktory connection");
            return Err(e);
        }
        self.idle.lock().await.push(conn);
        Ok(())
    }
}
