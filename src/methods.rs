//! The server's LSP method table.
//!
//! Each submodule registers the handlers of one protocol area. Handlers
//! share a [`Session`] and capture only the configuration they need.

mod lifecycle;
mod text_document;
mod workspace;

use std::sync::Arc;

use tracing::warn;

use crate::index::IndexCommand;
use crate::registry::{Call, MethodRegistry};
use crate::session::Session;

/// Build the method table for one connection.
pub fn registry(session: Arc<Session>, index_command: Option<IndexCommand>) -> MethodRegistry {
    let mut registry = MethodRegistry::new();
    lifecycle::register(&mut registry, &session, index_command.clone());
    text_document::register(&mut registry, &session);
    workspace::register(&mut registry, &session, index_command);
    registry
}

fn invalid_params(call: &Call<'_>, err: serde_json::Error) {
    warn!("Invalid params for {}: {}", call.method(), err);
}
