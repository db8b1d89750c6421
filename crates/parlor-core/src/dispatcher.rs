//! Event dispatcher.
//!
//! Turns bus events into deliveries: presence broadcasts, device status
//! updates, message fan-out and read receipts. Jobs wait in a bounded
//! priority queue and are drained by a single worker; each job is retried a
//! fixed number of times with a deadline per attempt and then dropped.

use chrono::Utc;
use parlor_protocol::{Frame, MessageRecord, PresenceKind, PresenceNotice, UserId};
use parlor_transport::{ConnectionId, TransportError};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeSet, BinaryHeap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::directory::{DeviceDirectory, DirectoryError, GroupDirectory};
use crate::emit::SafeEmitter;
use crate::event::{ConnectionEvent, Event, EventKind, MessageEvent};
use crate::retry::{self, RetryPolicy};
use crate::session::SessionRegistry;
use crate::telemetry;

/// Job priorities. Lower runs first.
pub mod priority {
    pub const LIFECYCLE: u8 = 1;
    pub const STATUS: u8 = 2;
    pub const DELIVERY: u8 = 3;
}

/// Everything the dispatcher knows how to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchAction {
    /// Tell everyone else a connection opened.
    AnnounceConnected,
    /// Tell everyone a connection closed.
    AnnounceDisconnected,
    /// Tell everyone a user's last connection closed.
    AnnounceUserOffline,
    /// Persist that a device has no live connection.
    MarkDeviceOffline,
    /// Fan a message out to its recipients.
    DeliverMessage,
    /// Send a read receipt to the sender.
    NotifyRead,
}

impl DispatchAction {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            DispatchAction::AnnounceConnected => "announce_connected",
            DispatchAction::AnnounceDisconnected => "announce_disconnected",
            DispatchAction::AnnounceUserOffline => "announce_user_offline",
            DispatchAction::MarkDeviceOffline => "mark_device_offline",
            DispatchAction::DeliverMessage => "deliver_message",
            DispatchAction::NotifyRead => "notify_read",
        }
    }

    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            DispatchAction::AnnounceConnected | DispatchAction::AnnounceDisconnected => {
                priority::LIFECYCLE
            }
            DispatchAction::AnnounceUserOffline | DispatchAction::MarkDeviceOffline => {
                priority::STATUS
            }
            DispatchAction::DeliverMessage | DispatchAction::NotifyRead => priority::DELIVERY,
        }
    }

    /// Whether this action concerns presence rather than messages.
    #[must_use]
    pub const fn is_presence(self) -> bool {
        self.priority() < priority::DELIVERY
    }
}

impl fmt::Display for DispatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Action driven by events of `kind`, if any.
#[must_use]
pub const fn plan(kind: EventKind) -> Option<DispatchAction> {
    match kind {
        EventKind::ConnectionOpened => Some(DispatchAction::AnnounceConnected),
        EventKind::ConnectionClosed => Some(DispatchAction::AnnounceDisconnected),
        EventKind::UserStatusChanged => Some(DispatchAction::AnnounceUserOffline),
        EventKind::DeviceDisconnected => Some(DispatchAction::MarkDeviceOffline),
        EventKind::PrivateMessageSent | EventKind::GroupMessageSent => {
            Some(DispatchAction::DeliverMessage)
        }
        EventKind::MessageRead => Some(DispatchAction::NotifyRead),
        EventKind::UserLogin
        | EventKind::UserLogout
        | EventKind::MessageDeleted
        | EventKind::DeviceConnected
        | EventKind::DeviceStatusChanged
        | EventKind::ConnectionError => None,
    }
}

/// Dispatcher errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Dispatch queue full ({0} jobs)")]
    QueueFull(usize),

    #[error("Dispatcher stopped")]
    Stopped,

    /// Every recipient connection failed.
    #[error("Delivery failed for all {0} targets")]
    Undelivered(usize),

    #[error("Action {action} cannot handle {kind} events")]
    Mismatch {
        action: DispatchAction,
        kind: EventKind,
    },

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Attempts per job.
    pub max_attempts: u32,
    /// Wait between attempts of a job.
    pub backoff: Duration,
    /// Deadline of a single attempt.
    pub attempt_timeout: Duration,
    /// Jobs the queue holds before producers wait.
    pub queue_capacity: usize,
    /// Attempts per outbound frame.
    pub emit_attempts: u32,
    /// Wait between outbound frame attempts.
    pub emit_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Duration::from_millis(100),
            attempt_timeout: Duration::from_secs(5),
            queue_capacity: 10_000,
            emit_attempts: 2,
            emit_delay: Duration::from_millis(50),
        }
    }
}

/// One unit of dispatcher work.
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub action: DispatchAction,
    pub event: Event,
}

impl DispatchJob {
    /// Job for `event`, if its kind drives an action.
    #[must_use]
    pub fn for_event(event: Event) -> Option<Self> {
        plan(event.kind()).map(|action| Self { action, event })
    }

    #[must_use]
    pub fn priority(&self) -> u8 {
        self.action.priority()
    }

    /// Attempts a message job has left before it counts as poison.
    /// `None` for jobs that do not carry a message.
    fn remaining_attempts(&self) -> Option<u32> {
        match &self.event {
            Event::Message(e) => Some(MessageEvent::MAX_ATTEMPTS.saturating_sub(e.attempts())),
            _ => None,
        }
    }

    fn record_attempts(&mut self, made: u32) {
        if let Event::Message(e) = &mut self.event {
            for _ in 0..made {
                if !e.record_attempt() {
                    break;
                }
            }
        }
    }
}

struct Queued {
    priority: u8,
    seq: u64,
    job: DispatchJob,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // BinaryHeap pops the greatest; invert so the lowest priority value and
    // then the oldest sequence number come out first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Bounded priority queue with a single consumer.
struct DispatchQueue {
    heap: Mutex<BinaryHeap<Queued>>,
    seq: AtomicU64,
    slots: Semaphore,
    ready: Notify,
    closed: AtomicBool,
    capacity: usize,
}

impl DispatchQueue {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            slots: Semaphore::new(capacity),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            capacity,
        }
    }

    fn heap(&self) -> MutexGuard<'_, BinaryHeap<Queued>> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, job: DispatchJob) {
        let queued = Queued {
            priority: job.priority(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            job,
        };
        let depth = {
            let mut heap = self.heap();
            heap.push(queued);
            heap.len()
        };
        telemetry::set_queue_depth(depth);
        self.ready.notify_one();
    }

    async fn push(&self, job: DispatchJob) -> Result<(), DispatchError> {
        let permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| DispatchError::Stopped)?;
        permit.forget();
        self.insert(job);
        Ok(())
    }

    fn try_push(&self, job: DispatchJob) -> Result<(), DispatchError> {
        match self.slots.try_acquire() {
            Ok(permit) => permit.forget(),
            Err(tokio::sync::TryAcquireError::Closed) => return Err(DispatchError::Stopped),
            Err(tokio::sync::TryAcquireError::NoPermits) => {
                return Err(DispatchError::QueueFull(self.capacity))
            }
        }
        self.insert(job);
        Ok(())
    }

    fn try_pop(&self) -> Option<DispatchJob> {
        let (queued, depth) = {
            let mut heap = self.heap();
            let queued = heap.pop()?;
            (queued, heap.len())
        };
        telemetry::set_queue_depth(depth);
        self.slots.add_permits(1);
        Some(queued.job)
    }

    /// Next job, waiting if the queue is empty. `None` once closed and drained.
    async fn pop(&self) -> Option<DispatchJob> {
        loop {
            if let Some(job) = self.try_pop() {
                return Some(job);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.ready.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.slots.close();
        self.ready.notify_one();
    }

    fn len(&self) -> usize {
        self.heap().len()
    }
}

/// Reacts to events by writing to connections and directories.
pub struct EventDispatcher {
    config: DispatcherConfig,
    queue: DispatchQueue,
    emitter: Arc<SafeEmitter>,
    sessions: Arc<SessionRegistry>,
    groups: Arc<dyn GroupDirectory>,
    devices: Arc<dyn DeviceDirectory>,
}

impl EventDispatcher {
    #[must_use]
    pub fn new(
        config: DispatcherConfig,
        emitter: Arc<SafeEmitter>,
        sessions: Arc<SessionRegistry>,
        groups: Arc<dyn GroupDirectory>,
        devices: Arc<dyn DeviceDirectory>,
    ) -> Self {
        Self {
            queue: DispatchQueue::new(config.queue_capacity),
            config,
            emitter,
            sessions,
            groups,
            devices,
        }
    }

    /// Queue a job, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Stopped`] after shutdown.
    pub async fn enqueue(&self, job: DispatchJob) -> Result<(), DispatchError> {
        trace!(action = %job.action, kind = %job.event.kind(), "Enqueue");
        self.queue.push(job).await
    }

    /// Queue a job without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::QueueFull`] if there is no room, or
    /// [`DispatchError::Stopped`] after shutdown.
    pub fn try_enqueue(&self, job: DispatchJob) -> Result<(), DispatchError> {
        self.queue.try_push(job)
    }

    /// Jobs waiting.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Spawn the worker.
    #[must_use]
    pub fn start(self: &Arc<Self>) -> DispatcherHandle {
        let dispatcher = Arc::clone(self);
        let task = tokio::spawn(async move {
            info!("Dispatcher started");
            while let Some(job) = dispatcher.queue.pop().await {
                dispatcher.process(job).await;
            }
            info!("Dispatcher stopped");
        });
        DispatcherHandle {
            dispatcher: Arc::clone(self),
            task,
        }
    }

    /// Run one job through its retry budget.
    ///
    /// Returns `true` if an attempt succeeded.
    pub async fn process(&self, mut job: DispatchJob) -> bool {
        self.run_job(&mut job).await
    }

    /// Message jobs also count every attempt on their event and never run
    /// past [`MessageEvent::MAX_ATTEMPTS`] in total.
    async fn run_job(&self, job: &mut DispatchJob) -> bool {
        let action = job.action;
        let mut attempts = self.config.max_attempts.max(1);
        if let Some(remaining) = job.remaining_attempts() {
            if remaining == 0 {
                warn!(
                    action = %action,
                    message = job.event.message_id(),
                    "Message job already exhausted, dropping"
                );
                telemetry::record_dispatch_dropped(action.name());
                return false;
            }
            attempts = attempts.min(remaining);
        }
        let policy = RetryPolicy::new(attempts, self.config.backoff, self.config.attempt_timeout);

        let current = &*job;
        let outcome = retry::run(&policy, action.name(), move |attempt| async move {
            self.execute(current).await.map(|()| attempt)
        })
        .await;

        match outcome {
            Ok(made) => {
                job.record_attempts(made);
                debug!(action = %action, kind = %job.event.kind(), "Dispatched");
                true
            }
            Err(exhausted) => {
                job.record_attempts(exhausted.attempts);
                error!(
                    action = %action,
                    kind = %job.event.kind(),
                    message = job.event.message_id(),
                    attempts = exhausted.attempts,
                    error = %exhausted.last,
                    "Dispatch abandoned"
                );
                telemetry::record_dispatch_dropped(action.name());
                false
            }
        }
    }

    async fn execute(&self, job: &DispatchJob) -> Result<(), DispatchError> {
        match (job.action, &job.event) {
            (DispatchAction::AnnounceConnected, Event::Connection(e)) => {
                let frame = Frame::presence(PresenceKind::WebsocketConnected, notice(e));
                self.broadcast(frame, Some(&e.connection_id)).await
            }
            (DispatchAction::AnnounceDisconnected, Event::Connection(e)) => {
                let frame = Frame::presence(PresenceKind::WebsocketDisconnected, notice(e));
                self.broadcast(frame, Some(&e.connection_id)).await
            }
            (DispatchAction::AnnounceUserOffline, Event::User(e)) => {
                let went_offline =
                    e.payload.get("online").and_then(serde_json::Value::as_bool) == Some(false);
                if !went_offline || self.sessions.is_online(e.user_id) {
                    trace!(user = e.user_id, "User is online again, skipping offline notice");
                    return Ok(());
                }
                let frame = Frame::presence(
                    PresenceKind::UserOffline,
                    PresenceNotice {
                        sid: e
                            .connection_id
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_default(),
                        user_id: e.user_id,
                        device_id: e.device_id.clone().unwrap_or_default(),
                        timestamp: e.created_at,
                        username: None,
                    },
                );
                self.broadcast(frame, None).await
            }
            (DispatchAction::MarkDeviceOffline, Event::Device(e)) => {
                if !self.sessions.handles_for_device(&e.device_id).is_empty() {
                    trace!(device = %e.device_id, "Device reconnected, keeping it online");
                    return Ok(());
                }
                self.devices.set_device_status(&e.device_id, false).await?;
                debug!(device = %e.device_id, "Device marked offline");
                Ok(())
            }
            (DispatchAction::DeliverMessage, Event::Message(e)) => {
                self.deliver(&e.message, e.origin.as_ref()).await
            }
            (DispatchAction::NotifyRead, Event::Message(e)) => {
                let reader_id = e
                    .payload
                    .get("reader_id")
                    .and_then(serde_json::Value::as_i64)
                    .or(e.message.recipient_id)
                    .unwrap_or_default();
                let frame = Frame::ReadReceipt {
                    public_id: e.message.public_id.clone(),
                    reader_id,
                    read_at: e.message.read_at.unwrap_or_else(Utc::now),
                };
                let targets: BTreeSet<_> = self
                    .sessions
                    .handles_for(e.message.sender_id)
                    .into_iter()
                    .collect();
                self.emit_all(targets, &frame).await
            }
            (action, event) => Err(DispatchError::Mismatch {
                action,
                kind: event.kind(),
            }),
        }
    }

    async fn broadcast(
        &self,
        frame: Frame,
        except: Option<&ConnectionId>,
    ) -> Result<(), DispatchError> {
        let reached = self.emitter.outbound().broadcast(frame, except).await?;
        trace!(reached, "Broadcast");
        Ok(())
    }

    /// Connections that should receive `message`.
    ///
    /// Private messages go to every connection of the recipient and of the
    /// sender, so the sender's other devices stay in sync. Group messages go
    /// to every connection of every member. The origin connection is skipped.
    ///
    /// # Errors
    ///
    /// Returns a directory error if group membership cannot be read.
    pub async fn fanout_targets(
        &self,
        message: &MessageRecord,
        origin: Option<&ConnectionId>,
    ) -> Result<BTreeSet<ConnectionId>, DispatchError> {
        let users: Vec<UserId> = match message.group_id {
            Some(group_id) if message.is_group() => self.groups.members(group_id).await?,
            _ => message
                .recipient_id
                .into_iter()
                .chain(std::iter::once(message.sender_id))
                .collect(),
        };

        let mut targets: BTreeSet<_> = users
            .into_iter()
            .flat_map(|user| self.sessions.handles_for(user))
            .collect();
        if let Some(origin) = origin {
            targets.remove(origin);
        }
        Ok(targets)
    }

    async fn deliver(
        &self,
        message: &MessageRecord,
        origin: Option<&ConnectionId>,
    ) -> Result<(), DispatchError> {
        let targets = self.fanout_targets(message, origin).await?;
        if targets.is_empty() {
            debug!(message = %message.public_id, "No live recipients");
            return Ok(());
        }
        self.emit_all(targets, &Frame::message(message.clone())).await
    }

    async fn emit_all(
        &self,
        targets: BTreeSet<ConnectionId>,
        frame: &Frame,
    ) -> Result<(), DispatchError> {
        let total = targets.len();
        let mut failed = 0;
        for target in &targets {
            if !self.emitter.emit(target, frame.clone()).await {
                failed += 1;
            }
        }
        if total > 0 && failed == total {
            return Err(DispatchError::Undelivered(total));
        }
        if failed > 0 {
            warn!(failed, total, "Partial delivery");
        }
        Ok(())
    }
}

fn notice(e: &ConnectionEvent) -> PresenceNotice {
    PresenceNotice {
        sid: e.connection_id.to_string(),
        user_id: e.user_id,
        device_id: e.device_id.clone(),
        timestamp: e.created_at,
        username: e.username.clone(),
    }
}

/// Running dispatcher worker.
pub struct DispatcherHandle {
    dispatcher: Arc<EventDispatcher>,
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Stop accepting jobs, drain the queue and wait for the worker.
    pub async fn shutdown(self) {
        self.dispatcher.queue.close();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Dispatcher task ended abnormally");
        }
    }
}
