//! Byte transports the engine can run over.
//!
//! The engine only sees an `AsyncRead` and an `AsyncWrite`. This module
//! opens one of the three backends selected on the command line: the
//! process's standard streams, a local pipe the client is listening on, or a
//! TCP port on the loopback interface.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Transport connection errors. Fatal at startup.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection to {target} failed: {source}")]
    ConnectionFailed {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} transport is not supported on this platform")]
    Unsupported(&'static str),
}

/// Which transport to serve on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Stdio,
    /// Unix domain socket, or named pipe on Windows.
    Pipe(PathBuf),
    /// TCP port on 127.0.0.1.
    Port(u16),
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Stdio => f.write_str("stdio"),
            Transport::Pipe(path) => write!(f, "pipe {}", path.display()),
            Transport::Port(port) => write!(f, "127.0.0.1:{}", port),
        }
    }
}

/// An opened transport split into its two directions.
pub struct Connection {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Transport {
    /// Open the transport once.
    pub async fn connect(&self) -> Result<Connection, TransportError> {
        let connection = match self {
            Transport::Stdio => Connection {
                reader: Box::new(tokio::io::stdin()),
                writer: Box::new(tokio::io::stdout()),
            },
            Transport::Pipe(path) => connect_pipe(path).await.map_err(|source| {
                TransportError::ConnectionFailed {
                    target: self.to_string(),
                    source,
                }
            })?,
            Transport::Port(port) => {
                let stream = TcpStream::connect(("127.0.0.1", *port)).await.map_err(|source| {
                    TransportError::ConnectionFailed {
                        target: self.to_string(),
                        source,
                    }
                })?;
                // Frames are flushed whole; don't let Nagle hold them back
                let _ = stream.set_nodelay(true);
                let (reader, writer) = stream.into_split();
                Connection {
                    reader: Box::new(reader),
                    writer: Box::new(writer),
                }
            }
        };

        info!("Connected over {}", self);
        Ok(connection)
    }

    /// Open the transport, retrying with exponential backoff (100ms, 200ms,
    /// 400ms, ...) between attempts. At least one attempt is made.
    pub async fn connect_with_retry(&self, max_attempts: u32) -> Result<Connection, TransportError> {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.connect().await {
                Ok(connection) => return Ok(connection),
                Err(e) if attempt < max_attempts => {
                    let delay = Duration::from_millis(100 * (1 << (attempt - 1).min(10)));
                    warn!("{} (attempt {}/{}), retrying in {:?}", e, attempt, max_attempts, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(unix)]
async fn connect_pipe(path: &std::path::Path) -> std::io::Result<Connection> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    debug!("Unix socket {} connected", path.display());
    let (reader, writer) = stream.into_split();
    Ok(Connection {
        reader: Box::new(reader),
        writer: Box::new(writer),
    })
}

#[cfg(windows)]
async fn connect_pipe(path: &std::path::Path) -> std::io::Result<Connection> {
    let client = tokio::net::windows::named_pipe::ClientOptions::new().open(path)?;
    debug!("Named pipe {} connected", path.display());
    let (reader, writer) = tokio::io::split(client);
    Ok(Connection {
        reader: Box::new(reader),
        writer: Box::new(writer),
    })
}

#[cfg(not(any(unix, windows)))]
async fn connect_pipe(_path: &std::path::Path) -> std::io::Result<Connection> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        TransportError::Unsupported("pipe"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_display() {
        assert_eq!(Transport::Stdio.to_string(), "stdio");
        assert_eq!(Transport::Port(2087).to_string(), "127.0.0.1:2087");
        assert_eq!(
            Transport::Pipe(PathBuf::from("/tmp/lsp.sock")).to_string(),
            "pipe /tmp/lsp.sock"
        );
    }

    #[tokio::test]
    async fn test_tcp_connect_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hello").await.unwrap();
            let mut buf = [0u8; 3];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut conn = timeout(TEST_TIMEOUT, Transport::Port(port).connect())
            .await
            .expect("Timeout connecting")
            .unwrap();

        let mut buf = [0u8; 5];
        conn.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        conn.writer.write_all(b"ack").await.unwrap();

        assert_eq!(&accept.await.unwrap(), b"ack");
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = Transport::Port(port).connect().await.unwrap_err();
        assert!(
            matches!(err, TransportError::ConnectionFailed { .. }),
            "Expected connection failure, got: {}",
            err
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pipe_retry_reports_last_error() {
        let path = std::env::temp_dir().join(format!("tags-lsp-missing-{}.sock", std::process::id()));
        let start = std::time::Instant::now();

        let err = Transport::Pipe(path).connect_with_retry(2).await.unwrap_err();

        assert!(matches!(err, TransportError::ConnectionFailed { .. }));
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pipe_connect() {
        let path = std::env::temp_dir().join(format!("tags-lsp-test-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut conn = timeout(TEST_TIMEOUT, Transport::Pipe(path.clone()).connect_with_retry(3))
            .await
            .expect("Timeout connecting")
            .unwrap();
        conn.writer.write_all(b"ping").await.unwrap();

        assert_eq!(&accept.await.unwrap(), b"ping");
        let _ = std::fs::remove_file(&path);
    }
}
