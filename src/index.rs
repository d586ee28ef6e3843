//! Background tags indexing of workspace folders.
//!
//! Indexing runs an external command (typically `gtags -i`) inside each
//! workspace folder as a dispatch queue task, wrapped in work-done progress
//! when the client supports it. Failures are logged and never reach the
//! protocol stream.

use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;

use tracing::{debug, info, warn};
use url::Url;

use crate::error::EngineError;
use crate::progress::WorkDoneProgress;
use crate::registry::Call;
use crate::router::Router;
use crate::session::{Session, WorkspaceFolder};

/// External indexing command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexCommand {
    program: String,
    args: Vec<String>,
}

impl IndexCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a command line on whitespace. `None` if it is blank.
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace().map(str::to_string);
        let program = words.next()?;
        Some(Self::new(program, words.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Run to completion in `dir`. Standard output is discarded since it may
    /// be the protocol stream.
    pub fn run(&self, dir: &Path) -> std::io::Result<ExitStatus> {
        Command::new(&self.program)
            .args(&self.args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .status()
    }
}

/// Filesystem directory of a workspace folder. Accepts `file:` URIs and
/// plain paths (`rootPath`).
pub fn folder_path(uri: &str) -> Option<PathBuf> {
    match Url::parse(uri) {
        // Single letter schemes are Windows drive letters
        Ok(url) if url.scheme().len() > 1 => {
            if url.scheme() == "file" {
                url.to_file_path().ok()
            } else {
                None
            }
        }
        _ if !uri.is_empty() => Some(PathBuf::from(uri)),
        _ => None,
    }
}

/// Queue indexing of `folder` on the worker pool.
pub fn schedule(
    router: &Arc<Router>,
    session: Arc<Session>,
    command: IndexCommand,
    folder: WorkspaceFolder,
) -> Result<(), EngineError> {
    debug!("Scheduling index of {}", folder.uri);
    router.spawn_task("index", move |call| index_folder(call, &session, &command, &folder))
}

fn index_folder(call: &Call<'_>, session: &Session, command: &IndexCommand, folder: &WorkspaceFolder) {
    let Some(dir) = folder_path(&folder.uri) else {
        warn!("Cannot index {}: not a local folder", folder.uri);
        return;
    };

    let progress = if session.supports_work_done_progress() {
        let router = call.router();
        match WorkDoneProgress::create(router, router.next_token()) {
            Ok(progress) => {
                debug!("Indexing {} under token {}", dir.display(), progress.token());
                let started = progress.begin("Indexing").and_then(|()| progress.report(1));
                if let Err(e) = started {
                    warn!("Failed to report indexing progress: {}", e);
                }
                Some(progress)
            }
            Err(e) => {
                warn!("Failed to create progress token: {}", e);
                None
            }
        }
    } else {
        None
    };

    if call.is_cancelled() {
        debug!("Indexing of {} cancelled", dir.display());
    } else {
        match command.run(&dir) {
            Ok(status) if status.success() => info!("Indexed {}", dir.display()),
            Ok(status) => warn!("{} exited with {} in {}", command.program(), status, dir.display()),
            Err(e) => warn!("Failed to run {} in {}: {}", command.program(), dir.display(), e),
        }
    }

    if let Some(progress) = progress {
        if let Err(e) = progress.report(100).and_then(|()| progress.end()) {
            warn!("Failed to finish indexing progress: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_command_line() {
        let command = IndexCommand::parse("  gtags   -i --skip-unreadable ").unwrap();
        assert_eq!(command.program(), "gtags");
        assert_eq!(command.args(), ["-i", "--skip-unreadable"]);

        assert_eq!(IndexCommand::parse("   "), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_folder_path() {
        assert_eq!(folder_path("file:///home/dev/project"), Some(PathBuf::from("/home/dev/project")));
        assert_eq!(folder_path("file:///tmp/with%20space"), Some(PathBuf::from("/tmp/with space")));
        assert_eq!(folder_path("/srv/code"), Some(PathBuf::from("/srv/code")));
        assert_eq!(folder_path("https://example.com/repo"), None);
        assert_eq!(folder_path(""), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_run_in_directory() {
        let dir = std::env::temp_dir();
        let ok = IndexCommand::parse("true").unwrap().run(&dir).unwrap();
        assert!(ok.success());

        let failed = IndexCommand::parse("false").unwrap().run(&dir).unwrap();
        assert!(!failed.success());

        assert!(IndexCommand::new("tags-lsp-no-such-program", vec![]).run(&dir).is_err());
    }
}
