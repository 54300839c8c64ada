//! Requests intercepted while a scope's worker is not ready.
//!
//! Every intercepted request gets a [`PendingId`] and a completion handle.
//! Until the queue is activated requests are held in arrival order; once a
//! [`FetchDispatcher`] is installed they are replayed to it oldest first and
//! later arrivals are dispatched straight away. Each request is resolved
//! exactly once, either by the worker through [`PendingRequestQueue::resolve`]
//! or by teardown with [`Resolution::PassThrough`].

use hashbrown::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{CacheError, CacheResult};
use crate::record::{RequestDescriptor, ResponseRecord};

/// Queue-issued identifier of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingId(u64);

impl PendingId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// How an intercepted request was answered.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Answered from cache storage.
    Cached(ResponseRecord),
    /// Answered by a response the worker produced.
    Worker(ResponseRecord),
    /// Let the request continue to the network.
    PassThrough,
}

impl Resolution {
    pub fn response(&self) -> Option<&ResponseRecord> {
        match self {
            Resolution::Cached(r) | Resolution::Worker(r) => Some(r),
            Resolution::PassThrough => None,
        }
    }

    pub fn is_pass_through(&self) -> bool {
        matches!(self, Resolution::PassThrough)
    }
}

/// A request handed to the worker.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub id: PendingId,
    pub request: RequestDescriptor,
    /// Identifier supplied by the interception layer.
    pub caller_id: String,
}

/// Delivers fetch events to a scope's worker.
///
/// Called without any queue lock held, so implementations may call
/// [`PendingRequestQueue::resolve`] before returning.
pub trait FetchDispatcher: Send + Sync {
    fn dispatch(&self, event: FetchEvent);
}

impl<F> FetchDispatcher for F
where
    F: Fn(FetchEvent) + Send + Sync,
{
    fn dispatch(&self, event: FetchEvent) {
        self(event)
    }
}

/// Completion handle returned to the interception layer.
#[derive(Debug)]
pub struct PendingResponse {
    id: PendingId,
    rx: oneshot::Receiver<Resolution>,
}

impl PendingResponse {
    pub fn id(&self) -> PendingId {
        self.id
    }

    /// Wait for the request to be resolved.
    ///
    /// A request whose completion target is dropped unresolved passes through.
    pub async fn resolution(self) -> Resolution {
        self.rx.await.unwrap_or(Resolution::PassThrough)
    }
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    queued: VecDeque<FetchEvent>,
    outstanding: HashMap<PendingId, oneshot::Sender<Resolution>>,
    dispatcher: Option<Arc<dyn FetchDispatcher>>,
    draining: bool,
    closed: bool,
}

/// FIFO queue of intercepted requests for one scope.
#[derive(Default)]
pub struct PendingRequestQueue {
    state: Mutex<QueueState>,
}

impl std::fmt::Debug for PendingRequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("PendingRequestQueue")
            .field("queued", &state.queued.len())
            .field("outstanding", &state.outstanding.len())
            .field("ready", &state.dispatcher.is_some())
            .field("closed", &state.closed)
            .finish()
    }
}

impl PendingRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    // Nothing inside the lock can panic halfway through an update, so a
    // poisoned state is still consistent.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an intercepted request.
    ///
    /// The request is held until [`activate`](Self::activate), or dispatched
    /// immediately if the worker is already ready. After [`close`](Self::close)
    /// the returned handle resolves with [`Resolution::PassThrough`] at once.
    pub fn intercept(
        &self,
        request: RequestDescriptor,
        caller_id: impl Into<String>,
    ) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();

        let id = PendingId(state.next_id);
        state.next_id += 1;

        if state.closed {
            drop(state);
            debug!(?id, url = %request.url(), "Queue closed, passing request through");
            let _ = tx.send(Resolution::PassThrough);
            return PendingResponse { id, rx };
        }

        state.outstanding.insert(id, tx);
        let event = FetchEvent {
            id,
            request,
            caller_id: caller_id.into(),
        };

        match (&state.dispatcher, state.draining) {
            (Some(dispatcher), false) => {
                let dispatcher = Arc::clone(dispatcher);
                drop(state);
                trace!(?id, url = %event.request.url(), "Dispatching request");
                dispatcher.dispatch(event);
            }
            _ => {
                trace!(?id, url = %event.request.url(), "Queueing request");
                state.queued.push_back(event);
            }
        }

        PendingResponse { id, rx }
    }

    /// Mark the worker ready and replay every queued request to `dispatcher`.
    ///
    /// Requests arriving during the replay are dispatched after the ones
    /// already queued. Activating again swaps the dispatcher for later
    /// requests.
    pub fn activate(&self, dispatcher: Arc<dyn FetchDispatcher>) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.dispatcher = Some(Arc::clone(&dispatcher));
            if state.draining {
                return;
            }
            state.draining = true;
            debug!(queued = state.queued.len(), "Worker ready, replaying queued requests");
        }

        loop {
            let (event, dispatcher) = {
                let mut state = self.lock();
                let next = state.queued.pop_front();
                match (next, state.dispatcher.clone()) {
                    (Some(event), Some(dispatcher)) => (event, dispatcher),
                    (next, _) => {
                        if let Some(event) = next {
                            state.queued.push_front(event);
                        }
                        state.draining = false;
                        break;
                    }
                }
            };
            dispatcher.dispatch(event);
        }
    }

    /// Resolve an outstanding request.
    ///
    /// Fails with [`CacheError::DoubleResolution`] if `id` was already
    /// resolved and [`CacheError::NotFound`] if this queue never issued it.
    pub fn resolve(&self, id: PendingId, resolution: Resolution) -> CacheResult<()> {
        let tx = {
            let mut state = self.lock();
            match state.outstanding.remove(&id) {
                Some(tx) => {
                    state.queued.retain(|event| event.id != id);
                    tx
                }
                None if id.0 < state.next_id => return Err(CacheError::DoubleResolution(id)),
                None => return Err(CacheError::NotFound(format!("pending request {}", id.0))),
            }
        };

        if tx.send(resolution).is_err() {
            debug!(?id, "Resolved request whose caller went away");
        }
        Ok(())
    }

    /// Resolve every outstanding request with pass-through and refuse new ones.
    pub fn close(&self) {
        let outstanding: Vec<_> = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.dispatcher = None;
            state.queued.clear();
            state.outstanding.drain().collect()
        };

        if !outstanding.is_empty() {
            warn!(count = outstanding.len(), "Closing queue, passing outstanding requests through");
        }
        for (_, tx) in outstanding {
            let _ = tx.send(Resolution::PassThrough);
        }
    }

    /// Whether a worker has been attached.
    pub fn is_ready(&self) -> bool {
        self.lock().dispatcher.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Requests waiting for the worker to become ready.
    pub fn queued_len(&self) -> usize {
        self.lock().queued.len()
    }

    /// Requests not yet resolved, queued or dispatched.
    pub fn outstanding_len(&self) -> usize {
        self.lock().outstanding.len()
    }
}

impl Drop for PendingRequestQueue {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Headers;
    use std::sync::{OnceLock, Weak};

    fn request(path: &str) -> RequestDescriptor {
        RequestDescriptor::parse("GET", &format!("https://example.com{path}")).unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<FetchEvent>>,
    }

    impl FetchDispatcher for Recorder {
        fn dispatch(&self, event: FetchEvent) {
            self.seen.lock().unwrap().push(event);
        }
    }

    impl Recorder {
        fn callers(&self) -> Vec<String> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.caller_id.clone())
                .collect()
        }
    }

    #[tokio::test]
    async fn test_held_until_ready_then_fifo() {
        let queue = PendingRequestQueue::new();
        let a = queue.intercept(request("/a"), "1");
        let b = queue.intercept(request("/b"), "2");
        let c = queue.intercept(request("/c"), "3");
        assert_eq!(queue.queued_len(), 3);
        assert!(!queue.is_ready());

        let recorder = Arc::new(Recorder::default());
        queue.activate(recorder.clone());
        assert_eq!(recorder.callers(), vec!["1", "2", "3"]);
        assert_eq!(queue.queued_len(), 0);
        assert_eq!(queue.outstanding_len(), 3);

        let record = ResponseRecord::new(200, Headers::new(), "b");
        queue.resolve(b.id(), Resolution::Worker(record)).unwrap();
        queue.resolve(a.id(), Resolution::PassThrough).unwrap();
        queue.resolve(c.id(), Resolution::PassThrough).unwrap();

        let b = b.resolution().await;
        assert_eq!(&b.response().unwrap().body()[..], b"b");
        assert!(a.resolution().await.is_pass_through());
    }

    #[test]
    fn test_dispatches_immediately_when_ready() {
        let queue = PendingRequestQueue::new();
        let recorder = Arc::new(Recorder::default());
        queue.activate(recorder.clone());

        let pending = queue.intercept(request("/now"), "x");
        assert_eq!(queue.queued_len(), 0);
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, pending.id());
        assert_eq!(seen[0].request.url().path(), "/now");
    }

    struct Reentrant {
        queue: OnceLock<Weak<PendingRequestQueue>>,
        seen: Mutex<Vec<String>>,
    }

    impl FetchDispatcher for Reentrant {
        fn dispatch(&self, event: FetchEvent) {
            self.seen.lock().unwrap().push(event.caller_id.clone());
            if event.caller_id == "first" {
                let queue = self.queue.get().and_then(Weak::upgrade).unwrap();
                queue.intercept(request("/late"), "late");
            }
        }
    }

    #[test]
    fn test_arrivals_during_replay_go_last() {
        let queue = Arc::new(PendingRequestQueue::new());
        queue.intercept(request("/1"), "first");
        queue.intercept(request("/2"), "second");

        let dispatcher = Arc::new(Reentrant {
            queue: OnceLock::new(),
            seen: Mutex::new(Vec::new()),
        });
        dispatcher.queue.set(Arc::downgrade(&queue)).unwrap();
        queue.activate(dispatcher.clone());

        assert_eq!(*dispatcher.seen.lock().unwrap(), vec!["first", "second", "late"]);
    }

    #[test]
    fn test_dispatcher_may_resolve_synchronously() {
        let queue = Arc::new(PendingRequestQueue::new());
        let weak = Arc::downgrade(&queue);
        queue.activate(Arc::new(move |event: FetchEvent| {
            if let Some(queue) = weak.upgrade() {
                queue.resolve(event.id, Resolution::PassThrough).unwrap();
            }
        }));

        queue.intercept(request("/a"), "a");
        assert_eq!(queue.outstanding_len(), 0);
    }

    #[test]
    fn test_double_resolution() {
        let queue = PendingRequestQueue::new();
        let pending = queue.intercept(request("/a"), "a");

        queue.resolve(pending.id(), Resolution::PassThrough).unwrap();
        assert!(matches!(
            queue.resolve(pending.id(), Resolution::PassThrough),
            Err(CacheError::DoubleResolution(id)) if id == pending.id()
        ));
        assert!(matches!(
            queue.resolve(PendingId(99), Resolution::PassThrough),
            Err(CacheError::NotFound(_))
        ));
    }

    #[test]
    fn test_resolving_queued_request_removes_it() {
        let queue = PendingRequestQueue::new();
        let pending = queue.intercept(request("/a"), "a");
        queue.resolve(pending.id(), Resolution::PassThrough).unwrap();

        let recorder = Arc::new(Recorder::default());
        queue.activate(recorder.clone());
        assert!(recorder.callers().is_empty());
    }

    #[tokio::test]
    async fn test_close_passes_everything_through() {
        let queue = PendingRequestQueue::new();
        let queued = queue.intercept(request("/a"), "a");
        queue.close();

        assert!(queued.resolution().await.is_pass_through());
        assert!(matches!(
            queue.resolve(PendingId(0), Resolution::PassThrough),
            Err(CacheError::DoubleResolution(_))
        ));

        let late = queue.intercept(request("/b"), "b");
        assert!(late.resolution().await.is_pass_through());
        assert_eq!(queue.outstanding_len(), 0);
    }

    #[tokio::test]
    async fn test_drop_passes_everything_through() {
        let queue = PendingRequestQueue::new();
        let recorder = Arc::new(Recorder::default());
        queue.activate(recorder);
        let dispatched = queue.intercept(request("/a"), "a");
        drop(queue);

        assert!(dispatched.resolution().await.is_pass_through());
    }
}
