//! Per-worker vertex message buffers.
//!
//! Incoming messages live in two [`InCache`]s. The one matching the parity of
//! the superstep being computed is the read buffer and stays untouched by
//! senders while vertices run; the other one is the write buffer for the
//! next superstep and is filled concurrently by remote batches and local
//! emission, one lock per shard. At the superstep boundary the roles swap by
//! parity, nothing is copied.
//!
//! Outgoing messages of one compute task are collected in an [`OutCache`]
//! that delivers local targets straight into the write buffer and groups the
//! rest per destination worker.

use crate::combine::Combine;
use crate::message::{Gss, Routing, ShardId, VertexId, WorkerId};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

type Mailbox<M> = HashMap<String, Vec<M>>;

pub struct InCache<M> {
    shards: RwLock<HashMap<ShardId, Mutex<Mailbox<M>>>>,
    combiner: Option<Arc<dyn Combine<M>>>,
    received: AtomicU64,
}

impl<M> InCache<M> {
    pub fn new<I>(shards: I, combiner: Option<Arc<dyn Combine<M>>>) -> Self
    where
        I: IntoIterator<Item = ShardId>,
    {
        InCache {
            shards: RwLock::new(
                shards
                    .into_iter()
                    .map(|shard| (shard, Mutex::new(HashMap::new())))
                    .collect(),
            ),
            combiner,
            received: AtomicU64::new(0),
        }
    }

    pub fn add_shard(&self, shard: ShardId) {
        self.shards
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(shard)
            .or_insert_with(|| Mutex::new(HashMap::new()));
    }

    /// Stores one message. Returns false if the target shard is not resident
    /// here.
    pub fn store(&self, target: &VertexId, message: M) -> bool {
        let shards = self.shards.read().unwrap_or_else(PoisonError::into_inner);
        let Some(mailbox) = shards.get(&target.shard) else {
            return false;
        };

        let mut mailbox = mailbox.lock().unwrap_or_else(PoisonError::into_inner);
        self.push(&mut mailbox, &target.key, message);
        self.received.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Stores a batch of messages, grouped per shard so each shard lock is
    /// taken once. Returns the number of messages that had no resident
    /// target.
    pub fn store_batch(&self, messages: Vec<(VertexId, M)>) -> usize {
        let mut grouped: HashMap<ShardId, Vec<(String, M)>> = HashMap::new();
        for (target, message) in messages {
            grouped
                .entry(target.shard)
                .or_default()
                .push((target.key, message));
        }

        let shards = self.shards.read().unwrap_or_else(PoisonError::into_inner);
        let mut dropped = 0;
        for (shard, messages) in grouped {
            let Some(mailbox) = shards.get(&shard) else {
                dropped += messages.len();
                continue;
            };

            let count = messages.len() as u64;
            let mut mailbox = mailbox.lock().unwrap_or_else(PoisonError::into_inner);
            for (key, message) in messages {
                self.push(&mut mailbox, &key, message);
            }
            self.received.fetch_add(count, Ordering::AcqRel);
        }
        dropped
    }

    fn push(&self, mailbox: &mut Mailbox<M>, key: &str, message: M) {
        let queue = mailbox.entry(key.to_string()).or_default();
        match (self.combiner.as_ref(), queue.pop()) {
            (Some(combiner), Some(initial)) => queue.push(combiner.combine(initial, message)),
            (None, Some(initial)) => {
                queue.push(initial);
                queue.push(message);
            }
            (_, None) => queue.push(message),
        }
    }

    /// Takes every message stored for `shard`.
    pub fn take_shard(&self, shard: &str) -> Mailbox<M> {
        let shards = self.shards.read().unwrap_or_else(PoisonError::into_inner);
        let Some(mailbox) = shards.get(shard) else {
            return HashMap::new();
        };
        let mut mailbox = mailbox.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *mailbox)
    }

    /// Number of messages stored since the last [`InCache::clear`], before
    /// combining.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    /// Number of messages currently held, after combining.
    pub fn pending(&self) -> u64 {
        let shards = self.shards.read().unwrap_or_else(PoisonError::into_inner);
        let pending = shards
            .values()
            .map(|mailbox| {
                mailbox
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .map(|queue| queue.len() as u64)
                    .sum::<u64>()
            })
            .sum();
        pending
    }

    pub fn clear(&self) {
        let shards = self.shards.read().unwrap_or_else(PoisonError::into_inner);
        for mailbox in shards.values() {
            mailbox.lock().unwrap_or_else(PoisonError::into_inner).clear();
        }
        self.received.store(0, Ordering::Release);
    }
}

/// The two incoming buffers of a worker. Messages consumed in superstep `g`
/// live in the buffer of parity `g % 2`.
pub struct MessageBuffers<M> {
    even: Arc<InCache<M>>,
    odd: Arc<InCache<M>>,
}

impl<M> MessageBuffers<M> {
    pub fn new(shards: &[ShardId], combiner: Option<Arc<dyn Combine<M>>>) -> Self {
        MessageBuffers {
            even: Arc::new(InCache::new(shards.iter().cloned(), combiner.clone())),
            odd: Arc::new(InCache::new(shards.iter().cloned(), combiner)),
        }
    }

    /// Buffer holding the messages to be consumed in superstep `gss`.
    pub fn for_gss(&self, gss: Gss) -> &Arc<InCache<M>> {
        if gss % 2 == 0 {
            &self.even
        } else {
            &self.odd
        }
    }

    pub fn add_shard(&self, shard: &ShardId) {
        self.even.add_shard(shard.clone());
        self.odd.add_shard(shard.clone());
    }

    pub fn clear(&self) {
        self.even.clear();
        self.odd.clear();
    }
}

/// Outgoing messages of one compute task.
pub struct OutCache<M> {
    me: WorkerId,
    routing: Arc<Routing>,
    local: Arc<InCache<M>>,
    combiner: Option<Arc<dyn Combine<M>>>,
    remote: HashMap<WorkerId, HashMap<VertexId, Vec<M>>>,
    sent_to: BTreeMap<WorkerId, u64>,
    local_sent: u64,
    undeliverable: u64,
}

impl<M> OutCache<M> {
    pub fn new(
        me: WorkerId,
        routing: Arc<Routing>,
        local: Arc<InCache<M>>,
        combiner: Option<Arc<dyn Combine<M>>>,
    ) -> Self {
        OutCache {
            me,
            routing,
            local,
            combiner,
            remote: HashMap::new(),
            sent_to: BTreeMap::new(),
            local_sent: 0,
            undeliverable: 0,
        }
    }

    pub fn send(&mut self, target: &VertexId, message: M) {
        let Some(owner) = self.routing.owner(&target.shard) else {
            self.undeliverable += 1;
            return;
        };

        if *owner == self.me {
            if self.local.store(target, message) {
                self.local_sent += 1;
            } else {
                self.undeliverable += 1;
            }
            return;
        }

        let queue = self
            .remote
            .entry(owner.clone())
            .or_default()
            .entry(target.clone())
            .or_default();
        match (self.combiner.as_ref(), queue.pop()) {
            (Some(combiner), Some(initial)) => queue.push(combiner.combine(initial, message)),
            (None, Some(initial)) => {
                queue.push(initial);
                queue.push(message);
            }
            (_, None) => queue.push(message),
        }
    }

    /// Messages that could not be routed (unknown shard).
    pub fn undeliverable(&self) -> u64 {
        self.undeliverable
    }

    /// Drains the remote messages as per-worker batches of at most
    /// `batch_size` messages, and returns the per-destination counts of
    /// everything this cache sent, local deliveries included.
    pub fn finish(mut self, batch_size: usize) -> (Vec<(WorkerId, Vec<(VertexId, M)>)>, BTreeMap<WorkerId, u64>) {
        let batch_size = batch_size.max(1);
        let mut batches = Vec::new();

        if self.local_sent > 0 {
            *self.sent_to.entry(self.me.clone()).or_insert(0) += self.local_sent;
        }

        for (worker, targets) in self.remote.drain() {
            let mut batch = Vec::new();
            let mut count = 0_u64;
            for (target, messages) in targets {
                for message in messages {
                    batch.push((target.clone(), message));
                    count += 1;
                    if batch.len() >= batch_size {
                        batches.push((worker.clone(), std::mem::take(&mut batch)));
                    }
                }
            }
            if !batch.is_empty() {
                batches.push((worker.clone(), batch));
            }
            *self.sent_to.entry(worker).or_insert(0) += count;
        }

        (batches, self.sent_to)
    }
}
