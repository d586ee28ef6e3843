//! workspace/didChangeWorkspaceFolders.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use super::invalid_params;
use crate::index::{self, IndexCommand};
use crate::registry::MethodRegistry;
use crate::session::{Session, WorkspaceFolder};

#[derive(Debug, Default, Deserialize)]
struct WorkspaceFoldersChangeEvent {
    #[serde(default)]
    added: Vec<WorkspaceFolder>,
    #[serde(default)]
    removed: Vec<WorkspaceFolder>,
}

#[derive(Debug, Deserialize)]
struct DidChangeWorkspaceFoldersParams {
    event: WorkspaceFoldersChangeEvent,
}

pub(super) fn register(registry: &mut MethodRegistry, session: &Arc<Session>, index_command: Option<IndexCommand>) {
    let s = Arc::clone(session);
    registry.notification("workspace/didChangeWorkspaceFolders", move |call| {
        let event = match call.params_as::<DidChangeWorkspaceFoldersParams>() {
            Ok(params) => params.event,
            Err(e) => return invalid_params(call, e),
        };

        debug!(
            "Workspace folders: +{} -{}",
            event.added.len(),
            event.removed.len()
        );
        let to_index = s.change_workspace_folders(event.added, &event.removed);
        debug!("{} workspace folders open", s.workspace_folders().len());

        let Some(command) = &index_command else {
            return;
        };
        for folder in to_index {
            if let Err(e) = index::schedule(call.router(), Arc::clone(&s), command.clone(), folder) {
                warn!("Failed to schedule indexing: {}", e);
            }
        }
    });
}
