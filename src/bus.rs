//! In-process typed pub/sub: per-agent queues, tick-driven drain,
//! broadcast, request/response correlation, history, and stats.
//!
//! Delivery is cooperative rather than immediate: producers enqueue
//! from any thread into a per-agent `crossbeam_queue::SegQueue` (an
//! MPSC-safe FIFO), and a single call to `tick()` drains every queue
//! exactly once, in registration order, on the host's own thread.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::error::CoreError;
use crate::identity::{now_monotonic_ms, AgentId, Id, IdGenerator, UuidGenerator};
use crate::message::{Message, MessageBuilder, MessageType};

/// Ring-buffer capacity for [`MessageBus::history`].
pub const HISTORY_CAPACITY: usize = 1024;

/// Per-agent inbound handler. A single method, so closures and small
/// structs both implement it without an inheritance hierarchy.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &Message);
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn handle(&self, message: &Message) {
        self(message)
    }
}

#[derive(Debug, Default)]
struct TypeCounters {
    counts: DashMap<MessageType, u64>,
}

impl TypeCounters {
    fn bump(&self, message_type: &MessageType) {
        *self.counts.entry(message_type.clone()).or_insert(0) += 1;
    }

    fn snapshot(&self) -> HashMap<MessageType, u64> {
        self.counts.iter().map(|e| (e.key().clone(), *e.value())).collect()
    }
}

/// Aggregate bus traffic counters.
#[derive(Debug, Default, Clone)]
pub struct BusStats {
    pub sent: u64,
    pub delivered: u64,
    pub received: u64,
    pub failed: u64,
    pub sent_by_type: HashMap<MessageType, u64>,
}

struct Waiter {
    requester: AgentId,
    sender: oneshot::Sender<Result<Message, CoreError>>,
}

/// In-process message bus.
pub struct MessageBus {
    handlers: DashMap<AgentId, Arc<dyn MessageHandler>>,
    queues: DashMap<AgentId, SegQueue<Message>>,
    registration_order: RwLock<Vec<AgentId>>,
    pending_responses: DashMap<Id, Waiter>,
    history: Mutex<VecDeque<Message>>,
    sent: AtomicU64,
    delivered: AtomicU64,
    received: AtomicU64,
    failed: AtomicU64,
    sent_by_type: TypeCounters,
    running: AtomicBool,
    id_generator: Arc<dyn IdGenerator>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_id_generator(Arc::new(UuidGenerator))
    }

    pub fn with_id_generator(id_generator: Arc<dyn IdGenerator>) -> Self {
        Self {
            handlers: DashMap::new(),
            queues: DashMap::new(),
            registration_order: RwLock::new(Vec::new()),
            pending_responses: DashMap::new(),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            sent: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            received: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            sent_by_type: TypeCounters::default(),
            running: AtomicBool::new(true),
            id_generator,
        }
    }

    pub fn register(&self, id: AgentId, handler: Arc<dyn MessageHandler>) {
        if self.handlers.insert(id, handler).is_none() {
            self.queues.insert(id, SegQueue::new());
            self.registration_order.write().unwrap().push(id);
        }
    }

    /// Removes `id`'s handler and drops its queue. Outstanding request
    /// waiters this agent initiated are cancelled with
    /// [`CoreError::Cancelled`]. Messages subsequently targeting `id`
    /// are counted as failed and dropped.
    pub fn unregister(&self, id: AgentId) {
        self.handlers.remove(&id);
        self.queues.remove(&id);
        self.registration_order.write().unwrap().retain(|&a| a != id);

        let stale: Vec<Id> = self
            .pending_responses
            .iter()
            .filter(|e| e.value().requester == id)
            .map(|e| *e.key())
            .collect();
        for correlation_id in stale {
            if let Some((_, waiter)) = self.pending_responses.remove(&correlation_id) {
                let _ = waiter.sender.send(Err(CoreError::Cancelled(format!(
                    "agent {id} unregistered while awaiting response"
                ))));
            }
        }
    }

    fn record_history(&self, message: Message) {
        let mut history = self.history.lock().unwrap();
        if history.len() >= HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(message);
    }

    fn enqueue(&self, message: Message) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.sent_by_type.bump(&message.message_type);

        if !self.running.load(Ordering::Acquire) {
            debug!(message_id = %message.message_id, "bus shut down; dropping message");
            return;
        }

        let Some(recipient) = message.recipient_id else {
            warn!("enqueue() called with a broadcast-shaped message; use broadcast()");
            return;
        };

        match self.queues.get(&recipient) {
            Some(queue) => {
                queue.push(message.clone());
                self.delivered.fetch_add(1, Ordering::Relaxed);
                self.record_history(message);
            }
            None => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                debug!(recipient = %recipient, "send() target unknown; dropped");
            }
        }
    }

    /// Enqueues `message` to its recipient. Counts as `failed` and
    /// drops it if the recipient is unregistered.
    pub fn send(&self, message: Message) {
        self.enqueue(message);
    }

    /// Enqueues `content` to every currently-registered agent except
    /// `sender`. The recipient set is captured at call time (snapshot
    /// at send); agents registered afterward see nothing from this call.
    pub fn broadcast(
        &self,
        sender: AgentId,
        message_type: MessageType,
        content: impl Into<String>,
        payload: HashMap<String, serde_json::Value>,
    ) {
        let content = content.into();
        let targets: Vec<AgentId> = self
            .registration_order
            .read()
            .unwrap()
            .iter()
            .copied()
            .filter(|&id| id != sender)
            .collect();

        for target in targets {
            let message = MessageBuilder::new(sender, message_type.clone(), content.clone())
                .to(target)
                .payload(payload.clone())
                .build(self.id_generator.next_id());
            self.enqueue(message);
        }
    }

    /// Sends `message` (a fresh correlation id is assigned) and
    /// suspends the caller until a correlated response arrives or
    /// `timeout_ms` elapses.
    pub async fn send_request(
        &self,
        message: MessageBuilder,
        timeout_ms: u64,
    ) -> Result<Message, CoreError> {
        let correlation_id = self.id_generator.next_id();
        let message = message.correlated_with(correlation_id).build(self.id_generator.next_id());
        let requester = message.sender_id;

        let (tx, rx) = oneshot::channel();
        self.pending_responses.insert(
            correlation_id,
            Waiter {
                requester,
                sender: tx,
            },
        );

        self.enqueue(message);

        match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::Cancelled(
                "response waiter dropped without a reply".to_string(),
            )),
            Err(_) => {
                self.pending_responses.remove(&correlation_id);
                Err(CoreError::Timeout(format!(
                    "no response for correlation {correlation_id} within {timeout_ms}ms"
                )))
            }
        }
    }

    /// Sends a correlated response. If a caller is currently awaiting
    /// this correlation id via [`Self::send_request`], the waiter is
    /// completed directly; only otherwise does the message enter the
    /// normal recipient queue.
    pub fn send_response(&self, message: Message) -> Result<(), CoreError> {
        let Some(correlation_id) = message.correlation_id else {
            return Err(CoreError::InvalidState(
                "send_response requires a correlation id".to_string(),
            ));
        };

        if let Some((_, waiter)) = self.pending_responses.remove(&correlation_id) {
            self.sent.fetch_add(1, Ordering::Relaxed);
            self.sent_by_type.bump(&message.message_type);
            self.delivered.fetch_add(1, Ordering::Relaxed);
            self.record_history(message.clone());
            let _ = waiter.sender.send(Ok(message));
        } else {
            self.enqueue(message);
        }
        Ok(())
    }

    /// Drains every registered agent's queue exactly once, in
    /// registration order, delivering messages to each agent's handler
    /// in FIFO order. A no-op after [`Self::shutdown`].
    ///
    /// Queue depths are snapshotted for every agent before any message
    /// is delivered, and each queue is drained only that many messages
    /// deep. A handler that synchronously sends (to itself or to an
    /// agent later in registration order) therefore never has that
    /// message delivered within the same `tick()` call — it sits in the
    /// queue for the next one, same as a send from outside the tick.
    /// Without this, a handler that re-sends to its own queue could
    /// loop the drain forever.
    pub fn tick(&self) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }

        let order = self.registration_order.read().unwrap().clone();
        let pending: Vec<(AgentId, usize)> = order
            .into_iter()
            .filter_map(|agent_id| {
                let queue = self.queues.get(&agent_id)?;
                Some((agent_id, queue.len()))
            })
            .collect();

        for (agent_id, depth) in pending {
            let Some(queue) = self.queues.get(&agent_id) else { continue };
            for _ in 0..depth {
                let Some(message) = queue.pop() else { break };
                self.deliver(agent_id, &message);
            }
        }
    }

    fn deliver(&self, agent_id: AgentId, message: &Message) {
        let Some(handler) = self.handlers.get(&agent_id) else {
            self.failed.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let handler = handler.clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(message)));
        match outcome {
            Ok(()) => {
                self.received.fetch_add(1, Ordering::Relaxed);
            }
            Err(panic) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(agent_id = %agent_id, error = %detail, "message handler panicked");
            }
        }
    }

    /// Flips the bus to stopped: `tick()` becomes a no-op and `send`
    /// still counts messages as sent but drops them.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Empties every queue without shutting down the bus.
    pub fn clear(&self) {
        for entry in self.queues.iter() {
            while entry.value().pop().is_some() {}
        }
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            sent: self.sent.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            sent_by_type: self.sent_by_type.snapshot(),
        }
    }

    /// Up to `n` most-recent messages, newest first.
    pub fn get_history(&self, n: usize) -> Vec<Message> {
        let history = self.history.lock().unwrap();
        history.iter().rev().take(n).cloned().collect()
    }

    pub fn fresh_message_id(&self) -> Id {
        self.id_generator.next_id()
    }

    pub fn now_ms(&self) -> u64 {
        now_monotonic_ms()
    }
}
