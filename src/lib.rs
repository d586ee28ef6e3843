//! tags-lsp Library
//!
//! A language server front-end: Content-Length framing, a worker pool that
//! keeps handler work off the I/O thread, and JSON-RPC routing with
//! cancellation and server-to-client requests.
//!
//! - `framing` - incremental byte stream to JSON message decoder
//! - `dispatch` - worker pool with pending/in-flight tracking
//! - `router` - request/response/notification routing
//! - `engine` - the I/O loop owning one connection
//! - `methods` - the LSP method table served by the binary
//!
//! # Embedding
//!
//! Any method table can be served over any `AsyncRead`/`AsyncWrite` pair:
//!
//! ```ignore
//! use tags_lsp::engine::{Engine, EngineConfig};
//! use tags_lsp::registry::{MethodRegistry, Outcome};
//!
//! let mut registry = MethodRegistry::new();
//! registry.request("ping", |_, rsp| {
//!     rsp.set_result(serde_json::json!("pong"));
//!     Outcome::Success
//! });
//!
//! let engine = Engine::new(registry, EngineConfig::default())?;
//! let outcome = engine.run(tokio::io::stdin(), tokio::io::stdout()).await?;
//! std::process::exit(outcome.exit_code());
//! ```

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod framing;
pub mod index;
pub mod methods;
pub mod progress;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod transport;

pub use engine::{Engine, EngineConfig, RunOutcome};
pub use error::EngineError;
