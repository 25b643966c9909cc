//! Broker engine
//!
//! An in-process broker that keeps the queue semantics the relay relies on:
//! - durable / exclusive / auto-delete queues, declared idempotently, with
//!   conflicting re-declarations refused
//! - FIFO per queue, round-robin across consumers, per-consumer prefetch
//! - per-channel unacknowledged deliveries that are requeued (flagged as
//!   redelivered) when the channel closes or the connection drops
//! - mandatory publishes to a missing queue returned as unroutable
//!
//! Concurrency and usage notes:
//! - All state sits behind one `Arc<Mutex<Engine>>` shared by the broker
//!   handle, its channels and the ackers inside deliveries. The lock is never
//!   held across an await point.
//! - `refuse_next`, `set_reachable`, `drop_connections` and `restart` simulate
//!   an unreliable network or broker for tests and demos.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;
use tracing::{debug, info};

use crate::broker::queue::{ConsumerSlot, QueueState, StoredMessage};
use crate::broker::{
    Acknowledger, Channel, Connector, Delivery, DeliveryStream, DeliveryTag, Endpoint,
    PublishFlags, QueueInfo, QueueSpec,
};
use crate::utils::error::TransportError;

pub(crate) type ChannelId = u64;

#[derive(Debug)]
struct PendingMessage {
    queue: String,
    channel: ChannelId,
    consumer_tag: String,
    message: StoredMessage,
}

#[derive(Debug)]
struct ChannelState {
    open: Arc<AtomicBool>,
    prefetch: u16,
}

#[derive(Debug, Default)]
struct Engine {
    queues: HashMap<String, QueueState>,
    pending_acks: HashMap<u64, PendingMessage>,
    channels: HashMap<ChannelId, ChannelState>,
    next_tag: u64,
    next_channel: ChannelId,
    credentials: Option<(String, String)>,
    refuse_next: u32,
    unreachable: bool,
    connection_attempts: u32,
}

enum Settle {
    Ack,
    Reject { requeue: bool },
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Engine>>,
}

impl MemoryBroker {
    /// A broker that accepts any credentials.
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that only accepts the given username/password pair.
    pub fn with_credentials(username: impl Into<String>, password: impl Into<String>) -> Self {
        let broker = Self::new();
        broker.engine().credentials = Some((username.into(), password.into()));
        broker
    }

    fn engine(&self) -> MutexGuard<'_, Engine> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuses the next `attempts` connection attempts as if nothing were
    /// listening.
    pub fn refuse_next(&self, attempts: u32) {
        self.engine().refuse_next = attempts;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.engine().unreachable = !reachable;
    }

    /// Connection attempts seen so far, refused ones included.
    pub fn connection_attempts(&self) -> u32 {
        self.engine().connection_attempts
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.engine().queues.contains_key(queue)
    }

    pub fn queue_count(&self) -> usize {
        self.engine().queues.len()
    }

    /// Messages waiting in `queue` for a consumer.
    pub fn ready_count(&self, queue: &str) -> Option<usize> {
        self.engine().queues.get(queue).map(|q| q.ready.len())
    }

    /// Messages from `queue` delivered but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.engine()
            .pending_acks
            .values()
            .filter(|p| p.queue == queue)
            .count()
    }

    /// Tears down every open channel as a network failure would.
    pub fn drop_connections(&self) {
        let mut engine = self.engine();
        let ids: Vec<ChannelId> = engine.channels.keys().copied().collect();
        for id in ids {
            self.close_channel(&mut engine, id, Some("connection reset by broker"));
        }
    }

    /// Simulates a broker restart: connections drop, non-durable queues and
    /// non-persistent messages are lost.
    pub fn restart(&self) {
        self.drop_connections();
        let mut engine = self.engine();
        engine.queues.retain(|_, q| q.spec.durable);
        for queue in engine.queues.values_mut() {
            queue.ready.retain(|m| m.persistent);
        }
        info!(queues = engine.queues.len(), "Broker restarted");
    }

    fn dispatch(&self, engine: &mut Engine, queue: &str) {
        let Engine {
            queues,
            pending_acks,
            next_tag,
            ..
        } = engine;
        let Some(state) = queues.get_mut(queue) else {
            return;
        };

        while !state.ready.is_empty() {
            let Some(idx) = state.pick_consumer() else {
                break;
            };
            let Some(message) = state.ready.pop_front() else {
                break;
            };

            *next_tag += 1;
            let tag = *next_tag;
            let channel = state.consumers[idx].channel;
            let delivery = Delivery::new(
                DeliveryTag(tag),
                message.body.clone(),
                message.redelivered,
                Box::new(MemoryAcker {
                    broker: self.clone(),
                    channel,
                    tag,
                }),
            );

            if state.consumers[idx].sender.unbounded_send(Ok(delivery)).is_err() {
                // The subscriber dropped its stream; stop offering it messages.
                let slot = state.consumers.remove(idx);
                debug!(consumer = %slot.tag, "Removing consumer with a closed stream");
                state.next_consumer = 0;
                state.ready.push_front(message);
                continue;
            }

            let slot = &mut state.consumers[idx];
            slot.unacked += 1;
            pending_acks.insert(
                tag,
                PendingMessage {
                    queue: queue.to_string(),
                    channel,
                    consumer_tag: slot.tag.clone(),
                    message,
                },
            );
        }
    }

    fn settle(&self, channel: ChannelId, tag: u64, action: Settle) -> Result<(), TransportError> {
        let mut engine = self.engine();
        if !engine.channels.contains_key(&channel) {
            return Err(TransportError::ConnectionLost("channel is closed".to_string()));
        }

        let pending = match engine.pending_acks.remove(&tag) {
            Some(p) if p.channel == channel => p,
            other => {
                if let Some(p) = other {
                    engine.pending_acks.insert(tag, p);
                }
                return Err(TransportError::Protocol(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {tag}"
                )));
            }
        };

        let queue = pending.queue;
        if let Some(state) = engine.queues.get_mut(&queue) {
            if let Some(slot) = state
                .consumers
                .iter_mut()
                .find(|c| c.channel == channel && c.tag == pending.consumer_tag)
            {
                slot.unacked = slot.unacked.saturating_sub(1);
            }
            if let Settle::Reject { requeue: true } = action {
                let mut message = pending.message;
                message.redelivered = true;
                state.ready.push_front(message);
            }
        }

        self.dispatch(&mut engine, &queue);
        Ok(())
    }

    fn close_channel(&self, engine: &mut Engine, channel: ChannelId, reason: Option<&str>) {
        let Some(state) = engine.channels.remove(&channel) else {
            return;
        };
        state.open.store(false, Ordering::SeqCst);

        let mut touched = Vec::new();
        for (name, queue) in engine.queues.iter_mut() {
            if !queue.consumers.iter().any(|c| c.channel == channel) {
                continue;
            }
            if let Some(reason) = reason {
                for slot in queue.consumers.iter().filter(|c| c.channel == channel) {
                    let _ = slot
                        .sender
                        .unbounded_send(Err(TransportError::ConnectionLost(reason.to_string())));
                }
            }
            queue.unsubscribe_channel(channel);
            touched.push(name.clone());
        }

        // Highest tag first so that pushing to the front restores delivery order.
        let mut orphaned: Vec<u64> = engine
            .pending_acks
            .iter()
            .filter(|(_, p)| p.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        orphaned.sort_unstable_by(|a, b| b.cmp(a));

        for tag in orphaned {
            let Some(pending) = engine.pending_acks.remove(&tag) else {
                continue;
            };
            if let Some(queue) = engine.queues.get_mut(&pending.queue) {
                let mut message = pending.message;
                message.redelivered = true;
                queue.ready.push_front(message);
                if !touched.contains(&pending.queue) {
                    touched.push(pending.queue);
                }
            }
        }

        engine.queues.retain(|name, queue| {
            let keep = !(queue.spec.exclusive && queue.owner == channel) && !queue.is_abandoned();
            if !keep {
                info!(queue = %name, "Deleting queue");
            }
            keep
        });

        debug!(channel, requeued_queues = touched.len(), "Channel closed");
        for name in touched {
            self.dispatch(engine, &name);
        }
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Channel>, TransportError> {
        let mut engine = self.engine();
        engine.connection_attempts += 1;

        if engine.refuse_next > 0 {
            engine.refuse_next -= 1;
            return Err(TransportError::Unreachable(format!(
                "connection refused by {}:{}",
                endpoint.host, endpoint.port
            )));
        }
        if engine.unreachable {
            return Err(TransportError::Unreachable(format!(
                "no route to {}:{}",
                endpoint.host, endpoint.port
            )));
        }
        if let Some((username, password)) = &engine.credentials {
            if username != &endpoint.username || password != &endpoint.password {
                return Err(TransportError::AccessRefused(format!(
                    "ACCESS_REFUSED - login refused for user '{}'",
                    endpoint.username
                )));
            }
        }

        engine.next_channel += 1;
        let id = engine.next_channel;
        let open = Arc::new(AtomicBool::new(true));
        engine.channels.insert(
            id,
            ChannelState {
                open: open.clone(),
                prefetch: 0,
            },
        );

        Ok(Arc::new(MemoryChannel {
            broker: self.clone(),
            id,
            open,
        }))
    }
}

pub struct MemoryChannel {
    broker: MemoryBroker,
    id: ChannelId,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::ConnectionLost("channel is closed".to_string()))
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo, TransportError> {
        let mut engine = self.broker.engine();
        self.ensure_open()?;

        if spec.name.is_empty() {
            return Err(TransportError::Protocol(
                "queue name must not be empty".to_string(),
            ));
        }

        if let Some(existing) = engine.queues.get(&spec.name) {
            if existing.spec.exclusive && existing.owner != self.id {
                return Err(TransportError::QueueConflict {
                    queue: spec.name.clone(),
                    reason: "RESOURCE_LOCKED - exclusive to another connection".to_string(),
                });
            }
            if let Some(reason) = spec.mismatch(&existing.spec) {
                return Err(TransportError::QueueConflict {
                    queue: spec.name.clone(),
                    reason: format!("PRECONDITION_FAILED - {reason}"),
                });
            }
            return Ok(existing.info());
        }

        let state = QueueState::new(spec.clone(), self.id);
        let info = state.info();
        engine.queues.insert(spec.name.clone(), state);
        debug!(queue = %spec.name, durable = spec.durable, "Queue created");
        Ok(info)
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        flags: PublishFlags,
    ) -> Result<(), TransportError> {
        let mut engine = self.broker.engine();
        self.ensure_open()?;

        let Some(state) = engine.queues.get_mut(queue) else {
            if flags.mandatory {
                return Err(TransportError::Unroutable(queue.to_string()));
            }
            debug!(queue, "No such queue, message discarded");
            return Ok(());
        };

        state.ready.push_back(StoredMessage {
            body: body.to_vec(),
            persistent: flags.persistent,
            redelivered: false,
        });
        self.broker.dispatch(&mut engine, queue);
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        let mut engine = self.broker.engine();
        self.ensure_open()?;
        if let Some(state) = engine.channels.get_mut(&self.id) {
            state.prefetch = count;
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let mut engine = self.broker.engine();
        self.ensure_open()?;

        let prefetch = engine
            .channels
            .get(&self.id)
            .map(|c| c.prefetch)
            .unwrap_or(0);
        let Some(state) = engine.queues.get_mut(queue) else {
            return Err(TransportError::Protocol(format!(
                "NOT_FOUND - no queue '{queue}'"
            )));
        };
        if state.spec.exclusive && state.owner != self.id {
            return Err(TransportError::AccessRefused(format!(
                "RESOURCE_LOCKED - queue '{queue}' is exclusive to another connection"
            )));
        }
        if state
            .consumers
            .iter()
            .any(|c| c.channel == self.id && c.tag == consumer_tag)
        {
            return Err(TransportError::Protocol(format!(
                "NOT_ALLOWED - duplicate consumer tag '{consumer_tag}'"
            )));
        }

        let (tx, rx) = mpsc::unbounded();
        state.consumers.push(ConsumerSlot {
            channel: self.id,
            tag: consumer_tag.to_string(),
            sender: tx,
            prefetch,
            unacked: 0,
        });
        state.had_consumer = true;
        self.broker.dispatch(&mut engine, queue);

        Ok(rx.boxed())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut engine = self.broker.engine();
        self.broker.close_channel(&mut engine, self.id, None);
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        let mut engine = self.broker.engine();
        self.broker.close_channel(&mut engine, self.id, None);
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    channel: ChannelId,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.broker.settle(self.channel, self.tag, Settle::Ack)
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.broker
            .settle(self.channel, self.tag, Settle::Reject { requeue })
    }
}
