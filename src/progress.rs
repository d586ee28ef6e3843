//! Server-initiated work-done progress reporting.

use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::router::Router;

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum ProgressValue<'a> {
    Begin {
        title: &'a str,
        cancellable: bool,
        percentage: u32,
    },
    Report {
        cancellable: bool,
        percentage: u32,
    },
    End,
}

/// A progress token created on the client with
/// `window/workDoneProgress/create`.
///
/// Creating one blocks on the client's answer, so this only works from a
/// worker thread.
pub struct WorkDoneProgress<'a> {
    router: &'a Router,
    token: String,
}

impl<'a> WorkDoneProgress<'a> {
    pub fn create(router: &'a Router, token: String) -> Result<Self, EngineError> {
        let response = router.send_request(
            "window/workDoneProgress/create",
            Some(json!({ "token": token })),
        )?;

        // An error reply does not stop the work; the client will drop our
        // $/progress notifications
        if let Some(error) = &response.error {
            warn!("Client refused progress token {}: {}", token, error.message);
        } else {
            debug!("Progress token {} created", token);
        }

        Ok(Self { router, token })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn begin(&self, title: &str) -> Result<(), EngineError> {
        self.send(ProgressValue::Begin {
            title,
            cancellable: false,
            percentage: 0,
        })
    }

    pub fn report(&self, percentage: u32) -> Result<(), EngineError> {
        self.send(ProgressValue::Report {
            cancellable: false,
            percentage: percentage.min(100),
        })
    }

    pub fn end(self) -> Result<(), EngineError> {
        self.send(ProgressValue::End)
    }

    fn send(&self, value: ProgressValue<'_>) -> Result<(), EngineError> {
        self.router.send_notification(
            "$/progress",
            Some(json!({ "token": self.token, "value": value })),
        )
    }
}
