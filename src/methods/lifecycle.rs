//! initialize, initialized, shutdown, exit, $/cancelRequest and $/setTrace.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::invalid_params;
use crate::index::{self, IndexCommand};
use crate::protocol::{ErrorCode, RequestId, Response};
use crate::registry::{MethodRegistry, Outcome};
use crate::router::Router;
use crate::session::{Session, Trace, WorkspaceFolder};

/// How often the shutdown waiter checks for outstanding work.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams {
    root_path: Option<String>,
    root_uri: Option<String>,
    workspace_folders: Option<Vec<WorkspaceFolder>>,
    capabilities: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CancelParams {
    id: RequestId,
}

#[derive(Debug, Deserialize)]
struct SetTraceParams {
    value: String,
}

pub(super) fn register(registry: &mut MethodRegistry, session: &Arc<Session>, index_command: Option<IndexCommand>) {
    let s = Arc::clone(session);
    registry.request("initialize", move |call, rsp| {
        let params: InitializeParams = match call.params_as::<Option<InitializeParams>>() {
            Ok(params) => params.unwrap_or_default(),
            Err(e) => {
                invalid_params(call, e);
                return Outcome::Error(ErrorCode::InvalidRequest);
            }
        };

        if let Some(folders) = workspace_folders(&params) {
            s.set_workspace_folders(folders);
        }
        if let Some(capabilities) = params.capabilities {
            s.set_client_capabilities(capabilities);
        }

        rsp.set_result(initialize_result());
        Outcome::Success
    });

    let s = Arc::clone(session);
    registry.notification("initialized", move |call| {
        let folders = s.mark_initialized();
        info!("Client initialized");

        let Some(command) = &index_command else {
            return;
        };
        for folder in folders {
            if let Err(e) = index::schedule(call.router(), Arc::clone(&s), command.clone(), folder) {
                warn!("Failed to schedule indexing: {}", e);
            }
        }
    });

    let waiter: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&waiter);
    registry.request("shutdown", move |call, rsp| {
        call.router().begin_shutdown();

        let deferred = rsp.take();
        let router = Arc::clone(call.router());
        let spawned = std::thread::Builder::new()
            .name("tags-lsp-shutdown".to_string())
            .spawn(move || wait_for_drain(&router, deferred));

        match spawned {
            Ok(handle) => {
                *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                Outcome::Async
            }
            Err(e) => {
                error!("Failed to spawn shutdown waiter: {}", e);
                Outcome::Error(ErrorCode::InternalError)
            }
        }
    });
    registry.on_teardown("shutdown", move || {
        let handle = waiter.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Shutdown waiter panicked");
            }
        }
    });

    registry.notification("exit", |call| call.router().request_exit());

    registry.notification("$/cancelRequest", |call| match call.params_as::<CancelParams>() {
        Ok(params) => {
            call.router().cancel_by_id(&params.id);
        }
        Err(e) => invalid_params(call, e),
    });

    let s = Arc::clone(session);
    registry.notification("$/setTrace", move |call| match call.params_as::<SetTraceParams>() {
        Ok(params) => {
            let trace = Trace::parse(&params.value);
            debug!("Trace set to {:?}", trace);
            s.set_trace(trace);
        }
        Err(e) => invalid_params(call, e),
    });
}

/// Later sources replace earlier ones: rootPath, then rootUri, then
/// workspaceFolders.
fn workspace_folders(params: &InitializeParams) -> Option<Vec<WorkspaceFolder>> {
    let mut folders = None;

    if let Some(path) = &params.root_path {
        folders = Some(vec![WorkspaceFolder::new(path.as_str(), "")]);
    }
    if let Some(uri) = &params.root_uri {
        folders = Some(vec![WorkspaceFolder::new(uri.as_str(), "")]);
    }
    if let Some(list) = &params.workspace_folders {
        folders = Some(list.clone());
    }

    folders
}

fn initialize_result() -> Value {
    json!({
        "capabilities": {
            "positionEncoding": "utf-8",
            "textDocumentSync": {
                "openClose": true,
                "change": 1,
                "save": true
            },
            "workspace": {
                "workspaceFolders": {
                    "supported": true,
                    "changeNotifications": true
                }
            }
        },
        "serverInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

/// Send the deferred shutdown response once every other work item is done.
fn wait_for_drain(router: &Router, response: Response) {
    while router.pending_and_in_flight() > 0 {
        if router.is_torn_down() {
            debug!("Engine torn down before shutdown drained");
            return;
        }
        std::thread::sleep(DRAIN_POLL_INTERVAL);
    }

    info!("All work drained, answering shutdown");
    if let Err(e) = router.send_response(response) {
        warn!("Failed to send shutdown response: {}", e);
    }
}
