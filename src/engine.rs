//! The I/O loop tying transport, framer, router and worker pool together.
//!
//! One [`Engine`] owns every subsystem of a connection. [`Engine::run`] is a
//! single cooperative loop that reads the transport, feeds the framer, runs
//! completion callbacks when the worker pool signals and writes outbound
//! frames in order. It never blocks on handler work.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::EngineError;
use crate::framing::Framer;
use crate::registry::MethodRegistry;
use crate::router::Router;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Engine tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Worker threads running handlers.
    pub workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

/// Available parallelism, never less than 2 so that one slow handler cannot
/// starve everything else.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .max(2)
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// The client sent `exit`.
    Exit,
    /// The transport reached end of file.
    Eof,
}

/// Result of a completed [`Engine::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub stop: Stop,
    pub shutdown_received: bool,
}

impl RunOutcome {
    /// Process exit status: 0 after an orderly `shutdown`, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.shutdown_received {
            0
        } else {
            1
        }
    }
}

/// One language server connection.
pub struct Engine {
    router: Arc<Router>,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    framer: Framer,
}

impl Engine {
    pub fn new(registry: MethodRegistry, config: EngineConfig) -> Result<Self, EngineError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Router::new(Arc::new(registry), config.workers, tx)?;

        Ok(Self {
            router,
            outbound: rx,
            framer: Framer::new(),
        })
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Serve the connection until `exit`, end of file or a fatal error.
    ///
    /// Must be polled on a current-thread runtime or a runtime whose worker
    /// threads are not shared with handler code. Subsystems are torn down
    /// before returning, on every path.
    pub async fn run<R, W>(self, mut reader: R, mut writer: W) -> Result<RunOutcome, EngineError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let Engine {
            router,
            mut outbound,
            mut framer,
        } = self;

        info!("Engine started");
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let result = loop {
            router.run_completions();
            if router.exit_requested() {
                break Ok(Stop::Exit);
            }

            tokio::select! {
                biased;

                _ = router.exit_notified() => {}

                _ = router.queue_notified() => {}

                frame = outbound.recv() => match frame {
                    Some(bytes) => {
                        if let Err(e) = write_frame(&mut writer, &bytes).await {
                            break Err(EngineError::Write(e));
                        }
                    }
                    None => break Err(EngineError::Closed),
                },

                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!("Transport reached end of file");
                        break Ok(Stop::Eof);
                    }
                    Ok(n) => {
                        if let Err(e) = feed(&router, &mut framer, &buf[..n]) {
                            break Err(e);
                        }
                    }
                    Err(e) => break Err(EngineError::Read(e)),
                },
            }
        };

        let result = match result {
            Ok(stop) => flush_outbound(&router, &mut outbound, &mut writer)
                .await
                .map(|()| stop)
                .map_err(EngineError::Write),
            Err(e) => Err(e),
        };

        // Joins workers and runs teardown hooks, both of which may block
        let stopping = Arc::clone(&router);
        if let Err(e) = tokio::task::spawn_blocking(move || stopping.teardown()).await {
            error!("Teardown failed: {}", e);
        }

        match result {
            Ok(stop) => {
                let outcome = RunOutcome {
                    stop,
                    shutdown_received: router.is_shutdown(),
                };
                info!("Engine stopped ({:?}, exit code {})", stop, outcome.exit_code());
                Ok(outcome)
            }
            Err(e) => {
                error!("Engine failed: {}", e);
                Err(e)
            }
        }
    }
}

fn feed(router: &Arc<Router>, framer: &mut Framer, data: &[u8]) -> Result<(), EngineError> {
    let mut messages: Vec<Value> = Vec::new();
    framer.execute(data, |message| messages.push(message))?;

    for message in messages {
        router.handle_incoming(message)?;
    }
    Ok(())
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Write whatever completions and handlers have already queued.
async fn flush_outbound<W: AsyncWrite + Unpin>(
    router: &Router,
    outbound: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    writer: &mut W,
) -> std::io::Result<()> {
    router.run_completions();
    while let Ok(bytes) = outbound.try_recv() {
        writer.write_all(&bytes).await?;
    }
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::encode;
    use crate::registry::Outcome;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_exit_code() {
        let clean = RunOutcome {
            stop: Stop::Exit,
            shutdown_received: true,
        };
        let abrupt = RunOutcome {
            stop: Stop::Eof,
            shutdown_received: false,
        };
        assert_eq!(clean.exit_code(), 0);
        assert_eq!(abrupt.exit_code(), 1);
    }

    #[test]
    fn test_default_workers_at_least_two() {
        assert!(EngineConfig::default().workers >= 2);
    }

    #[tokio::test]
    async fn test_teardown_keeps_runtime_responsive() {
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = std::sync::Mutex::new(release_rx);

        let mut registry = MethodRegistry::new();
        registry.request("block", move |_, _| {
            started_tx.send(()).unwrap();
            let _ = release_rx.lock().unwrap().recv();
            Outcome::Success
        });
        let engine = Engine::new(registry, EngineConfig { workers: 1 }).unwrap();

        let (mut client, server) = tokio::io::duplex(1 << 12);
        let (server_read, server_write) = tokio::io::split(server);
        let task = tokio::spawn(engine.run(server_read, server_write));

        let request = encode(&json!({"jsonrpc": "2.0", "id": 1, "method": "block"})).unwrap();
        client.write_all(&request).await.unwrap();
        timeout(TEST_TIMEOUT, started_rx.recv()).await.unwrap().unwrap();
        drop(client);

        // The busy worker keeps the pool's join grace period running; this
        // task must keep getting polled meanwhile
        let mut longest_gap = Duration::ZERO;
        let waited = timeout(TEST_TIMEOUT, async {
            while !task.is_finished() {
                let before = tokio::time::Instant::now();
                tokio::time::sleep(Duration::from_millis(1)).await;
                longest_gap = longest_gap.max(before.elapsed());
            }
        })
        .await;
        release_tx.send(()).unwrap();

        assert!(waited.is_ok());
        assert!(longest_gap < Duration::from_millis(50), "runtime stalled for {:?}", longest_gap);
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_eof_stops_engine() {
        let mut registry = MethodRegistry::new();
        registry.request("ping", |_, rsp| {
            rsp.set_result(json!("pong"));
            Outcome::Success
        });
        let engine = Engine::new(registry, EngineConfig { workers: 2 }).unwrap();

        let input = encode(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})).unwrap();
        let mut output = Vec::new();

        let outcome = timeout(TEST_TIMEOUT, engine.run(&input[..], &mut output))
            .await
            .expect("engine did not stop")
            .unwrap();

        assert_eq!(outcome.stop, Stop::Eof);
        assert_eq!(outcome.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_framing_error_is_fatal() {
        let engine = Engine::new(MethodRegistry::new(), EngineConfig { workers: 1 }).unwrap();
        let input = b"Content-Length: 3\r\n\r\n{x}".to_vec();
        let mut output = Vec::new();

        let result = timeout(TEST_TIMEOUT, engine.run(&input[..], &mut output))
            .await
            .expect("engine did not stop");

        assert!(matches!(result, Err(EngineError::Frame(_))));
    }
}
