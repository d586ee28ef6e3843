//! textDocument synchronization notifications.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use super::invalid_params;
use crate::registry::MethodRegistry;
use crate::session::Session;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextDocumentItem {
    uri: String,
    #[serde(default)]
    language_id: String,
    version: i64,
}

#[derive(Debug, Deserialize)]
struct VersionedTextDocumentIdentifier {
    uri: String,
    version: i64,
}

#[derive(Debug, Deserialize)]
struct TextDocumentIdentifier {
    uri: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DidOpenParams {
    text_document: TextDocumentItem,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DidChangeParams {
    text_document: VersionedTextDocumentIdentifier,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentParams {
    text_document: TextDocumentIdentifier,
}

pub(super) fn register(registry: &mut MethodRegistry, session: &Arc<Session>) {
    let s = Arc::clone(session);
    registry.notification("textDocument/didOpen", move |call| {
        match call.params_as::<DidOpenParams>() {
            Ok(params) => {
                let doc = params.text_document;
                debug!("Opened {} ({}) v{}", doc.uri, doc.language_id, doc.version);
                s.open_document(&doc.uri, doc.version);
            }
            Err(e) => invalid_params(call, e),
        }
    });

    let s = Arc::clone(session);
    registry.notification("textDocument/didChange", move |call| {
        match call.params_as::<DidChangeParams>() {
            Ok(params) => {
                let doc = params.text_document;
                if !s.change_document(&doc.uri, doc.version) {
                    debug!("Change for unopened document {}", doc.uri);
                }
            }
            Err(e) => invalid_params(call, e),
        }
    });

    registry.notification("textDocument/didSave", |call| {
        match call.params_as::<DocumentParams>() {
            Ok(params) => debug!("Saved {}", params.text_document.uri),
            Err(e) => invalid_params(call, e),
        }
    });

    let s = Arc::clone(session);
    registry.notification("textDocument/didClose", move |call| {
        match call.params_as::<DocumentParams>() {
            Ok(params) => {
                if !s.close_document(&params.text_document.uri) {
                    debug!("Close for unopened document {}", params.text_document.uri);
                }
            }
            Err(e) => invalid_params(call, e),
        }
    });
}
