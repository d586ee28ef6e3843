//! JSON-RPC request, response and notification routing.
//!
//! The router sits between the framer and the dispatch queue. Inbound
//! requests and notifications become work items; inbound responses resolve
//! server-initiated requests blocked in [`Router::send_request`]. Every
//! outbound frame is pushed onto one channel drained by the engine's I/O
//! loop, which is the only writer of the transport.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::futures::Notified;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, info, warn};

use crate::dispatch::{Completion, DispatchQueue, WorkItem};
use crate::error::EngineError;
use crate::framing;
use crate::protocol::{ErrorCode, Message, Notification, Request, RequestId, Response};
use crate::registry::{Call, Handler, MethodRegistry, Outcome};

/// Payload of a dispatch queue item.
#[derive(Debug)]
pub enum Work {
    Request {
        request: Request,
        /// Created when the request is dispatched. `None` once a handler has
        /// taken it for asynchronous delivery.
        response: Mutex<Option<Response>>,
    },
    Notification(Notification),
    /// Internal background work sharing the pool with method handlers.
    Task(&'static str),
}

impl Work {
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Work::Request { request, .. } => Some(&request.id),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Work::Request { request, .. } => &request.method,
            Work::Notification(notification) => &notification.method,
            Work::Task(name) => name,
        }
    }

    pub fn params(&self) -> Option<&Value> {
        match self {
            Work::Request { request, .. } => request.params.as_ref(),
            Work::Notification(notification) => notification.params.as_ref(),
            Work::Task(_) => None,
        }
    }
}

#[derive(Default)]
struct Outstanding {
    entries: Vec<(RequestId, oneshot::Sender<Response>)>,
    closed: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes messages between the wire, the dispatch queue and the handlers.
pub struct Router {
    queue: DispatchQueue<Work>,
    registry: Arc<MethodRegistry>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    outstanding: Mutex<Outstanding>,
    next_id: AtomicI64,
    shutdown: AtomicBool,
    exit_requested: AtomicBool,
    exit: Notify,
    torn_down: AtomicBool,
}

impl Router {
    pub fn new(
        registry: Arc<MethodRegistry>,
        workers: usize,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<Arc<Self>, EngineError> {
        Ok(Arc::new(Self {
            queue: DispatchQueue::new(workers)?,
            registry,
            outbound,
            outstanding: Mutex::new(Outstanding::default()),
            next_id: AtomicI64::new(1),
            shutdown: AtomicBool::new(false),
            exit_requested: AtomicBool::new(false),
            exit: Notify::new(),
            torn_down: AtomicBool::new(false),
        }))
    }

    /// Classify one decoded value and route it.
    ///
    /// Only dispatch and outbound channel failures are returned. Invalid
    /// messages are answered or dropped.
    pub fn handle_incoming(self: &Arc<Self>, value: Value) -> Result<(), EngineError> {
        let id = value.get("id").and_then(RequestId::from_value);
        let has_method = value.get("method").is_some();

        match Message::from_value(value) {
            Ok(Message::Request(request)) => self.dispatch_request(request),
            Ok(Message::Notification(notification)) => self.dispatch_notification(notification),
            Ok(Message::Response(response)) => {
                self.complete_outbound(response);
                Ok(())
            }
            Err(e) => {
                warn!("Invalid message: {}", e);
                match id {
                    Some(id) if has_method => {
                        self.send_response(Response::error(Some(id), ErrorCode::InvalidRequest))
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    fn dispatch_request(self: &Arc<Self>, request: Request) -> Result<(), EngineError> {
        debug!("<- request {} {}", request.id, request.method);

        let response = Response::new(Some(request.id.clone()));
        self.submit(Work::Request {
            request,
            response: Mutex::new(Some(response)),
        })
    }

    fn dispatch_notification(self: &Arc<Self>, notification: Notification) -> Result<(), EngineError> {
        debug!("<- notification {}", notification.method);
        self.submit(Work::Notification(notification))
    }

    fn submit(self: &Arc<Self>, work: Work) -> Result<(), EngineError> {
        let worker = Arc::downgrade(self);
        let completer = Arc::downgrade(self);

        self.queue.submit(
            work,
            move |item| {
                if let Some(router) = worker.upgrade() {
                    router.execute(item);
                }
            },
            move |item, completion| {
                if let Some(router) = completer.upgrade() {
                    router.complete(item, completion);
                }
            },
        )?;
        Ok(())
    }

    /// Work body, on a worker thread.
    fn execute(self: &Arc<Self>, item: &WorkItem<Work>) {
        match item.payload() {
            Work::Request { request, response } => {
                let mut slot = lock(response);
                let Some(rsp) = slot.as_mut() else {
                    return;
                };

                if self.is_shutdown() {
                    debug!("Rejecting {} {} after shutdown", request.id, request.method);
                    rsp.set_error(ErrorCode::InvalidRequest);
                    return;
                }

                if item.is_cancelled() {
                    rsp.set_error(ErrorCode::RequestCancelled);
                    return;
                }

                let handler = match self.registry.lookup(&request.method) {
                    Some(Handler::Request(handler)) => Arc::clone(handler),
                    Some(Handler::Notification(_)) => {
                        debug!("{} is a notification, not a request", request.method);
                        rsp.set_error(ErrorCode::MethodNotFound);
                        return;
                    }
                    None => {
                        debug!("Unknown request method {}", request.method);
                        rsp.set_error(ErrorCode::MethodNotFound);
                        return;
                    }
                };

                let call = Call::new(self, item);
                match handler(&call, rsp) {
                    Outcome::Success => {}
                    Outcome::Error(code) => rsp.set_error(code),
                    Outcome::Async => *slot = None,
                }
            }
            Work::Notification(notification) => {
                if item.is_cancelled() {
                    return;
                }

                match self.registry.lookup(&notification.method) {
                    Some(Handler::Notification(handler)) => {
                        let handler = Arc::clone(handler);
                        handler(&Call::new(self, item));
                    }
                    Some(Handler::Request(_)) => {
                        debug!("{} is a request, not a notification", notification.method);
                    }
                    None => debug!("Ignoring unknown notification {}", notification.method),
                }
            }
            Work::Task(_) => {}
        }
    }

    /// Completion callback, on the I/O thread.
    fn complete(&self, item: &WorkItem<Work>, completion: Completion) {
        let Work::Request { request, response } = item.payload() else {
            if completion == Completion::Panicked {
                warn!("{} (item {}) panicked", item.payload().name(), item.seq());
            }
            return;
        };

        let Some(mut rsp) = lock(response).take() else {
            debug!("Response to {} deferred by handler", request.id);
            return;
        };

        match completion {
            Completion::Finished => {}
            Completion::Cancelled => {
                debug!("Request {} cancelled before item {} started", request.id, item.seq());
                rsp.set_error(ErrorCode::RequestCancelled);
            }
            Completion::Panicked => {
                error!("Handler for {} {} panicked", request.id, request.method);
                rsp.set_error(ErrorCode::InternalError);
            }
        }

        if let Err(e) = self.send_response(rsp) {
            error!("Failed to send response to {}: {}", request.id, e);
        }
    }

    /// Frame and queue a response for writing. Fills `result: null` when
    /// neither result nor error was set.
    pub fn send_response(&self, mut response: Response) -> Result<(), EngineError> {
        response.finalize();
        self.send_message(&response)
    }

    pub fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), EngineError> {
        self.send_message(&Notification::new(method, params))
    }

    fn send_message<T: Serialize>(&self, message: &T) -> Result<(), EngineError> {
        let frame = framing::encode(message)?;
        self.outbound.send(frame).map_err(|_| EngineError::Closed)
    }

    /// Send a server-to-client request and block until the matching
    /// response arrives.
    ///
    /// Must run on a worker thread: the I/O loop is what delivers the
    /// response, so calling this from inside a tokio runtime fails with
    /// [`EngineError::WouldDeadlock`]. Returns [`EngineError::Closed`] if
    /// the engine tears down first.
    pub fn send_request(&self, method: &str, params: Option<Value>) -> Result<Response, EngineError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(EngineError::WouldDeadlock);
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        {
            let mut table = lock(&self.outstanding);
            if table.closed {
                return Err(EngineError::Closed);
            }
            table.entries.push((id.clone(), tx));
        }

        debug!("-> request {} {}", id, method);
        if let Err(e) = self.send_message(&Request::new(id.clone(), method, params)) {
            lock(&self.outstanding).entries.retain(|(pending, _)| *pending != id);
            return Err(e);
        }

        rx.blocking_recv().map_err(|_| EngineError::Closed)
    }

    /// Fresh token for server-created client resources such as progress
    /// tokens. Shares the request id counter.
    pub fn next_token(&self) -> String {
        format!("tags-lsp-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Hand a client response to the caller waiting on its id.
    fn complete_outbound(&self, response: Response) {
        let Some(id) = response.id.clone() else {
            debug!("Dropping response without id");
            return;
        };

        let waiter = {
            let mut table = lock(&self.outstanding);
            table
                .entries
                .iter()
                .position(|(pending, _)| *pending == id)
                .map(|index| table.entries.swap_remove(index).1)
        };

        match waiter {
            Some(tx) => {
                debug!("<- response {}", id);
                let _ = tx.send(response);
            }
            None => debug!("Dropping response with unknown id {}", id),
        }
    }

    /// Set the cancellation flag of the inbound request `id`, if it is still
    /// tracked.
    pub fn cancel_by_id(&self, id: &RequestId) -> bool {
        let found = self
            .queue
            .cancel_where(|item| item.payload().request_id() == Some(id));

        if found {
            debug!("Cancelled request {}", id);
        } else {
            debug!("No request {} to cancel", id);
        }
        found
    }

    /// Run `body` on the worker pool. Tasks count towards
    /// [`pending_and_in_flight`](Self::pending_and_in_flight).
    pub fn spawn_task<F>(self: &Arc<Self>, name: &'static str, body: F) -> Result<(), EngineError>
    where
        F: FnOnce(&Call<'_>) + Send + 'static,
    {
        let router: Weak<Router> = Arc::downgrade(self);
        self.queue.submit(
            Work::Task(name),
            move |item| {
                if let Some(router) = router.upgrade() {
                    body(&Call::new(&router, item));
                }
            },
            |item, completion| {
                if completion == Completion::Panicked {
                    warn!("Task {} panicked", item.payload().name());
                }
            },
        )?;
        Ok(())
    }

    pub fn begin_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn request_exit(&self) {
        info!("Exit requested");
        self.exit_requested.store(true, Ordering::SeqCst);
        self.exit.notify_one();
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn exit_notified(&self) -> Notified<'_> {
        self.exit.notified()
    }

    pub fn pending_and_in_flight(&self) -> usize {
        self.queue.pending_and_in_flight()
    }

    pub(crate) fn queue_notified(&self) -> Notified<'_> {
        self.queue.notified()
    }

    pub(crate) fn run_completions(&self) -> usize {
        self.queue.run_completions()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Release every caller blocked in `send_request`, run the registry's
    /// teardown hooks and stop the worker pool.
    pub(crate) fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let waiters = {
            let mut table = lock(&self.outstanding);
            table.closed = true;
            std::mem::take(&mut table.entries)
        };
        if !waiters.is_empty() {
            debug!("Releasing {} blocked outbound requests", waiters.len());
        }
        drop(waiters);

        self.registry.run_teardown();
        self.queue.shutdown();
    }
}
