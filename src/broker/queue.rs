use std::collections::VecDeque;

use futures::channel::mpsc::UnboundedSender;

use crate::broker::Delivery;
use crate::broker::engine::ChannelId;
use crate::utils::error::TransportError;

/// Declaration parameters for a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    /// Survives a broker restart.
    pub durable: bool,
    /// Usable only by the connection that declared it.
    pub exclusive: bool,
    /// Deleted once its last consumer goes away.
    pub auto_delete: bool,
}

impl QueueSpec {
    /// A durable, shared, persistent queue.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Describes how `self` differs from an existing declaration, if at all.
    pub fn mismatch(&self, existing: &QueueSpec) -> Option<String> {
        let mut diffs = Vec::new();
        if self.durable != existing.durable {
            diffs.push(format!("durable={} (existing {})", self.durable, existing.durable));
        }
        if self.exclusive != existing.exclusive {
            diffs.push(format!(
                "exclusive={} (existing {})",
                self.exclusive, existing.exclusive
            ));
        }
        if self.auto_delete != existing.auto_delete {
            diffs.push(format!(
                "auto_delete={} (existing {})",
                self.auto_delete, existing.auto_delete
            ));
        }
        (!diffs.is_empty()).then(|| diffs.join(", "))
    }
}

/// What the broker reports back from a declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct StoredMessage {
    pub body: Vec<u8>,
    pub persistent: bool,
    pub redelivered: bool,
}

/// A registered consumer on a queue.
#[derive(Debug)]
pub(crate) struct ConsumerSlot {
    pub channel: ChannelId,
    pub tag: String,
    pub sender: UnboundedSender<Result<Delivery, TransportError>>,
    pub prefetch: u16,
    pub unacked: usize,
}

impl ConsumerSlot {
    pub fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked < usize::from(self.prefetch)
    }
}

/// Broker-side state of one queue: its declaration, the messages waiting to
/// be delivered, and the consumers they are handed to round-robin.
#[derive(Debug)]
pub(crate) struct QueueState {
    pub spec: QueueSpec,
    pub owner: ChannelId,
    pub ready: VecDeque<StoredMessage>,
    pub consumers: Vec<ConsumerSlot>,
    pub next_consumer: usize,
    pub had_consumer: bool,
}

impl QueueState {
    pub fn new(spec: QueueSpec, owner: ChannelId) -> Self {
        Self {
            spec,
            owner,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            had_consumer: false,
        }
    }

    pub fn info(&self) -> QueueInfo {
        QueueInfo {
            name: self.spec.name.clone(),
            message_count: self.ready.len() as u32,
            consumer_count: self.consumers.len() as u32,
        }
    }

    /// Index of the next consumer allowed to take a delivery, round-robin.
    pub fn pick_consumer(&mut self) -> Option<usize> {
        let n = self.consumers.len();
        let idx = (0..n)
            .map(|offset| (self.next_consumer + offset) % n)
            .find(|&idx| self.consumers[idx].has_capacity())?;
        self.next_consumer = (idx + 1) % n;
        Some(idx)
    }

    pub fn unsubscribe_channel(&mut self, channel: ChannelId) {
        self.consumers.retain(|c| c.channel != channel);
        self.next_consumer = 0;
    }

    /// An auto-delete queue goes away once it has had a consumer and lost
    /// the last one.
    pub fn is_abandoned(&self) -> bool {
        self.spec.auto_delete && self.had_consumer && self.consumers.is_empty()
    }
}
