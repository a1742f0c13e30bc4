//! Session multiplexer.
//!
//! A [`Session`] owns one line channel to the remote. Callers send requests
//! tagged with their own numeric identifier and await the correlated
//! response, while a single background router task reads every inbound line
//! and either completes the matching pending request or fans the event out
//! to subscribers.

use crate::codec::{self, EventFrame, InboundMessage, Request, ResponseFrame};
use crate::error::SessionError;
use crate::framing::{LineReader, LineWriter};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub type SubscriptionId = u64;

/// Named notification categories pushed by the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Notification {
    StreamingStatusChanged,
    RecordingStatusChanged,
    SceneSwitched,
    SceneCollectionSwitched,
}

impl Notification {
    pub const ALL: [Notification; 4] = [
        Notification::StreamingStatusChanged,
        Notification::RecordingStatusChanged,
        Notification::SceneSwitched,
        Notification::SceneCollectionSwitched,
    ];

    /// Resource id carried by the event frame for this category.
    pub fn resource_id(self) -> &'static str {
        match self {
            Self::StreamingStatusChanged => "StreamingService.streamingStatusChange",
            Self::RecordingStatusChanged => "StreamingService.recordingStatusChange",
            Self::SceneSwitched => "ScenesService.sceneSwitched",
            Self::SceneCollectionSwitched => "SceneCollectionsService.collectionSwitched",
        }
    }

    pub fn from_resource_id(resource_id: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|category| category.resource_id() == resource_id)
    }
}

pub trait NotificationListener: Send + Sync {
    fn on_notification(&self, notification: Notification);
}

impl<F> NotificationListener for F
where
    F: Fn(Notification) + Send + Sync,
{
    fn on_notification(&self, notification: Notification) {
        self(notification)
    }
}

pub type EventJob = Box<dyn FnOnce() + Send + 'static>;

/// Where subscriber callbacks run. Jobs must be executed in submission order.
pub trait EventExecutor: Send + Sync {
    fn execute(&self, job: EventJob);
}

/// Runs jobs one after another on a dedicated task of the given runtime.
pub struct SerialExecutor {
    tx: mpsc::UnboundedSender<EventJob>,
}

impl SerialExecutor {
    pub fn spawn(handle: &tokio::runtime::Handle) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<EventJob>();
        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
        });
        Arc::new(Self { tx })
    }
}

impl EventExecutor for SerialExecutor {
    fn execute(&self, job: EventJob) {
        if self.tx.send(job).is_err() {
            tracing::debug!("event executor stopped; dropping notification");
        }
    }
}

#[derive(Clone, Default)]
pub struct SessionOptions {
    /// `None` delivers notifications inline on the router task.
    pub executor: Option<Arc<dyn EventExecutor>>,
}

type Reply = Result<String, SessionError>;

struct PendingRequest {
    ticket: u64,
    tx: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct Registry {
    closed: bool,
    pending: HashMap<u64, PendingRequest>,
}

struct Subscriber {
    id: SubscriptionId,
    category: Notification,
    active: AtomicBool,
    listener: Arc<dyn NotificationListener>,
}

struct Shared {
    registry: Mutex<Registry>,
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    next_ticket: AtomicU64,
    next_subscription: AtomicU64,
    executor: Option<Arc<dyn EventExecutor>>,
    shutdown: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn register(&self, id: u64) -> Result<(u64, oneshot::Receiver<Reply>), SessionError> {
        let (tx, rx) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let mut registry = lock(&self.registry);
        if registry.closed {
            return Err(SessionError::ChannelClosed);
        }
        if let Some(displaced) = registry.pending.insert(id, PendingRequest { ticket, tx }) {
            tracing::debug!(id, "replaced a pending request with the same identifier");
            let _ = displaced.tx.send(Err(SessionError::Superseded { id }));
        }
        Ok((ticket, rx))
    }

    fn deregister(&self, id: u64, ticket: u64) {
        let mut registry = lock(&self.registry);
        if registry.pending.get(&id).map(|p| p.ticket) == Some(ticket) {
            registry.pending.remove(&id);
        }
    }

    fn route(&self, line: &str) {
        match codec::classify(line) {
            InboundMessage::Response(frame) => self.complete(frame),
            InboundMessage::Event(event) => self.dispatch(&event),
            InboundMessage::Unrecognized => {}
        }
    }

    fn complete(&self, frame: ResponseFrame) {
        if frame.is_helper() {
            tracing::trace!(id = frame.id(), "ignoring helper payload");
            return;
        }
        let pending = lock(&self.registry).pending.remove(&frame.id());
        match pending {
            Some(pending) => {
                if pending.tx.send(Ok(frame.into_raw())).is_err() {
                    tracing::trace!("response arrived after its caller stopped waiting");
                }
            }
            None => tracing::trace!(id = frame.id(), "no pending request for response"),
        }
    }

    fn dispatch(&self, event: &EventFrame) {
        let Some(notification) = Notification::from_resource_id(event.resource_id()) else {
            tracing::trace!(resource_id = event.resource_id(), "unmapped event");
            return;
        };
        let targets: Vec<Arc<Subscriber>> = lock(&self.subscribers)
            .iter()
            .filter(|s| s.category == notification)
            .cloned()
            .collect();
        tracing::debug!(?notification, subscribers = targets.len(), "routing event");

        for subscriber in targets {
            match &self.executor {
                Some(executor) => executor.execute(Box::new(move || {
                    if subscriber.active.load(Ordering::Acquire) {
                        subscriber.listener.on_notification(notification);
                    }
                })),
                None => {
                    if subscriber.active.load(Ordering::Acquire) {
                        subscriber.listener.on_notification(notification);
                    }
                }
            }
        }
    }

    /// Marks the session dead and releases every waiter.
    fn terminate(&self) {
        let released = {
            let mut registry = lock(&self.registry);
            registry.closed = true;
            let count = registry.pending.len();
            registry.pending.clear();
            count
        };
        self.shutdown.send_replace(true);
        if released > 0 {
            tracing::debug!(released, "released pending requests on session termination");
        }
    }

    fn is_closed(&self) -> bool {
        lock(&self.registry).closed
    }
}

/// One live multiplexed connection. Not reusable after `close`.
pub struct Session {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Option<LineWriter<BoxedWriter>>>,
    router: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Session {
    /// Takes ownership of both halves of the channel and starts the router.
    /// Must be called from within a tokio runtime.
    pub fn open<R, W>(reader: R, writer: W, options: SessionOptions) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry::default()),
            subscribers: Mutex::new(Vec::new()),
            next_ticket: AtomicU64::new(1),
            next_subscription: AtomicU64::new(1),
            executor: options.executor,
            shutdown,
        });

        let router = tokio::spawn(route_inbound(
            LineReader::new(reader),
            shared.clone(),
            shutdown_rx,
        ));
        let writer: BoxedWriter = Box::new(writer);

        Self {
            shared,
            writer: tokio::sync::Mutex::new(Some(LineWriter::new(writer))),
            router: Mutex::new(Some(router)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.shared.is_closed()
    }

    /// Resolves once the session has terminated, whether closed locally or
    /// by the remote.
    pub async fn closed(&self) {
        let mut shutdown_rx = self.shared.shutdown.subscribe();
        let _ = shutdown_rx.wait_for(|closed| *closed).await;
    }

    /// Sends `request` and waits for the non-helper response carrying the
    /// same identifier. Returns the raw response line.
    ///
    /// Identifiers must be unique among requests in flight. A later request
    /// with the same identifier takes over the slot and the earlier caller
    /// gets [`SessionError::Superseded`].
    pub async fn send_and_await(&self, request: &Request) -> Result<String, SessionError> {
        let (ticket, rx) = self.shared.register(request.id)?;
        let _guard = PendingGuard {
            shared: &self.shared,
            id: request.id,
            ticket,
        };
        self.write(request).await?;
        rx.await.unwrap_or(Err(SessionError::ChannelClosed))
    }

    /// Like [`send_and_await`](Self::send_and_await) but gives up after
    /// `wait`, returning `Ok(None)` and freeing the identifier.
    pub async fn send_and_await_within(
        &self,
        request: &Request,
        wait: Duration,
    ) -> Result<Option<String>, SessionError> {
        let (ticket, rx) = self.shared.register(request.id)?;
        let _guard = PendingGuard {
            shared: &self.shared,
            id: request.id,
            ticket,
        };
        self.write(request).await?;
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(reply)) => reply.map(Some),
            Ok(Err(_)) => Err(SessionError::ChannelClosed),
            Err(_) => {
                tracing::debug!(id = request.id, ?wait, "no response within wait window");
                Ok(None)
            }
        }
    }

    /// Writes `request` without registering interest in a response.
    pub async fn send(&self, request: &Request) -> Result<(), SessionError> {
        self.write(request).await
    }

    async fn write(&self, request: &Request) -> Result<(), SessionError> {
        let line = codec::encode_request(request).map_err(SessionError::Encode)?;
        let mut shutdown_rx = self.shared.shutdown.subscribe();
        if *shutdown_rx.borrow_and_update() {
            return Err(SessionError::ChannelClosed);
        }

        tokio::select! {
            res = async {
                let mut writer = self.writer.lock().await;
                match writer.as_mut() {
                    Some(writer) => writer.write_line(&line).await.map_err(SessionError::Io),
                    None => Err(SessionError::ChannelClosed),
                }
            } => res,
            _ = shutdown_rx.wait_for(|closed| *closed) => Err(SessionError::ChannelClosed),
        }
    }

    pub fn subscribe<L>(&self, category: Notification, listener: L) -> SubscriptionId
    where
        L: NotificationListener + 'static,
    {
        let id = self.shared.next_subscription.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.subscribers).push(Arc::new(Subscriber {
            id,
            category,
            active: AtomicBool::new(true),
            listener: Arc::new(listener),
        }));
        id
    }

    /// Removes a listener. No callback for it starts after this returns.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.shared.subscribers);
        match subscribers.iter().position(|s| s.id == id) {
            Some(index) => {
                let removed = subscribers.remove(index);
                removed.active.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Releases the channel. Idempotent; outstanding requests observe
    /// `ChannelClosed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.terminate();

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(err) = writer.shutdown().await {
                tracing::debug!(error = %err, "channel shutdown failed");
            }
        }
        let router = lock(&self.router).take();
        if let Some(router) = router {
            if let Err(err) = router.await {
                tracing::warn!(error = %err, "session router task failed");
            }
        }
        tracing::info!("session closed");
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        lock(&self.shared.registry).pending.len()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.shared.terminate();
        }
    }
}

struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
    ticket: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.deregister(self.id, self.ticket);
    }
}

/// Terminates the session when the router exits, including by unwinding
/// out of a listener.
struct TerminateOnExit(Arc<Shared>);

impl Drop for TerminateOnExit {
    fn drop(&mut self) {
        self.0.terminate();
    }
}

async fn route_inbound<R>(
    mut lines: LineReader<R>,
    shared: Arc<Shared>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let _terminate = TerminateOnExit(shared.clone());
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shutdown_rx.wait_for(|closed| *closed) => None,
        };
        match line {
            Some(line) => shared.route(&line),
            None => break,
        }
    }
    if lines.is_closed() {
        tracing::info!("remote channel terminated; session is no longer usable");
    }
}
