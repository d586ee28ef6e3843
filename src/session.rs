//! Per-connection state written by the lifecycle, workspace and document
//! handlers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A workspace root as the client names it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceFolder {
    pub uri: String,
    #[serde(default)]
    pub name: String,
}

impl WorkspaceFolder {
    pub fn new(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
        }
    }
}

/// `$/setTrace` level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Trace {
    #[default]
    Off,
    Messages,
    Verbose,
}

impl Trace {
    /// Unknown values mean `Off`.
    pub fn parse(value: &str) -> Self {
        match value {
            "messages" => Trace::Messages,
            "verbose" => Trace::Verbose,
            _ => Trace::Off,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    initialized: bool,
    workspace_folders: Vec<WorkspaceFolder>,
    client_capabilities: Value,
    trace: Trace,
    /// Open document URI to last seen version.
    documents: HashMap<String, i64>,
}

/// Shared session state. Handlers run concurrently, so every accessor takes
/// the lock for the duration of one read or update.
#[derive(Debug, Default)]
pub struct Session {
    state: Mutex<State>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the session initialized and return the folders known so far.
    pub fn mark_initialized(&self) -> Vec<WorkspaceFolder> {
        let mut state = self.lock();
        state.initialized = true;
        state.workspace_folders.clone()
    }

    pub fn workspace_folders(&self) -> Vec<WorkspaceFolder> {
        self.lock().workspace_folders.clone()
    }

    pub fn set_workspace_folders(&self, folders: Vec<WorkspaceFolder>) {
        self.lock().workspace_folders = folders;
    }

    /// Remove folders by name, then append the added ones. Returns the
    /// appended folders that still need indexing: none before
    /// [`mark_initialized`](Self::mark_initialized), which hands out every
    /// folder itself.
    pub fn change_workspace_folders(
        &self,
        added: Vec<WorkspaceFolder>,
        removed: &[WorkspaceFolder],
    ) -> Vec<WorkspaceFolder> {
        let mut state = self.lock();
        state
            .workspace_folders
            .retain(|folder| !removed.iter().any(|gone| gone.name == folder.name));
        state.workspace_folders.extend(added.iter().cloned());
        if state.initialized {
            added
        } else {
            Vec::new()
        }
    }

    pub fn set_client_capabilities(&self, capabilities: Value) {
        self.lock().client_capabilities = capabilities;
    }

    /// Whether the client accepts `window/workDoneProgress/create`.
    pub fn supports_work_done_progress(&self) -> bool {
        self.lock()
            .client_capabilities
            .pointer("/window/workDoneProgress")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn set_trace(&self, trace: Trace) {
        self.lock().trace = trace;
    }

    pub fn trace(&self) -> Trace {
        self.lock().trace
    }

    pub fn open_document(&self, uri: &str, version: i64) {
        self.lock().documents.insert(uri.to_string(), version);
    }

    /// Record a new version. Returns false if the document is not open.
    pub fn change_document(&self, uri: &str, version: i64) -> bool {
        match self.lock().documents.get_mut(uri) {
            Some(current) => {
                *current = version;
                true
            }
            None => false,
        }
    }

    /// Returns false if the document was not open.
    pub fn close_document(&self, uri: &str) -> bool {
        self.lock().documents.remove(uri).is_some()
    }

    pub fn document_version(&self, uri: &str) -> Option<i64> {
        self.lock().documents.get(uri).copied()
    }

    pub fn open_document_count(&self) -> usize {
        self.lock().documents.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_trace_parse() {
        assert_eq!(Trace::parse("messages"), Trace::Messages);
        assert_eq!(Trace::parse("verbose"), Trace::Verbose);
        assert_eq!(Trace::parse("off"), Trace::Off);
        assert_eq!(Trace::parse("loud"), Trace::Off);
    }

    #[test]
    fn test_change_workspace_folders_removes_then_adds() {
        let session = Session::new();
        session.set_workspace_folders(vec![
            WorkspaceFolder::new("file:///a", "a"),
            WorkspaceFolder::new("file:///b", "b"),
        ]);
        assert_eq!(session.mark_initialized().len(), 2);

        let added = session.change_workspace_folders(
            vec![WorkspaceFolder::new("file:///a2", "a")],
            &[WorkspaceFolder::new("file:///a", "a")],
        );

        assert_eq!(added, vec![WorkspaceFolder::new("file:///a2", "a")]);
        assert_eq!(
            session.workspace_folders(),
            vec![
                WorkspaceFolder::new("file:///b", "b"),
                WorkspaceFolder::new("file:///a2", "a"),
            ]
        );
    }

    #[test]
    fn test_folders_added_before_initialized_are_indexed_once() {
        let session = Session::new();
        let folder = WorkspaceFolder::new("file:///early", "early");

        assert!(session.change_workspace_folders(vec![folder.clone()], &[]).is_empty());
        assert_eq!(session.mark_initialized(), vec![folder]);

        let late = WorkspaceFolder::new("file:///late", "late");
        assert_eq!(session.change_workspace_folders(vec![late.clone()], &[]), vec![late]);
    }

    #[test]
    fn test_work_done_progress_capability() {
        let session = Session::new();
        assert!(!session.supports_work_done_progress());

        session.set_client_capabilities(json!({"window": {"workDoneProgress": true}}));
        assert!(session.supports_work_done_progress());

        session.set_client_capabilities(json!({"window": {"workDoneProgress": "yes"}}));
        assert!(!session.supports_work_done_progress());
    }

    #[test]
    fn test_document_tracking() {
        let session = Session::new();
        session.open_document("file:///x.c", 1);

        assert!(session.change_document("file:///x.c", 2));
        assert!(!session.change_document("file:///y.c", 1));
        assert_eq!(session.document_version("file:///x.c"), Some(2));
        assert_eq!(session.open_document_count(), 1);

        assert!(session.close_document("file:///x.c"));
        assert!(!session.close_document("file:///x.c"));
        assert_eq!(session.document_version("file:///x.c"), None);
    }
}
