//! Per-API-key queues of finished exchanges
//!
//! Many request tasks enqueue, the collector is the only consumer. Queues are
//! created lazily on first use of a key and never removed.

use crate::exchange::Exchange;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use dashmap::DashMap;
use std::sync::Arc;

/// Unbounded FIFO for one API key
struct ExchangeQueue {
    sender: Sender<Arc<Exchange>>,
    receiver: Receiver<Arc<Exchange>>,
}

impl ExchangeQueue {
    fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver }
    }
}

#[derive(Default)]
pub struct KeyedQueueRegistry {
    // DashMap shards keep creation contention local; appends only clone a Sender
    queues: DashMap<String, Arc<ExchangeQueue>>,
}

impl KeyedQueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an exchange to the queue of `api_key`, creating the queue if needed
    ///
    /// Never blocks on the collector and never fails.
    pub fn enqueue(&self, api_key: &str, exchange: Arc<Exchange>) {
        let queue = self.queue_for(api_key);
        // The registry keeps a receiver alive, so the channel cannot be disconnected
        let _ = queue.sender.send(exchange);
    }

    fn queue_for(&self, api_key: &str) -> Arc<ExchangeQueue> {
        if let Some(queue) = self.queues.get(api_key) {
            return Arc::clone(queue.value());
        }

        // Lost races keep the queue that is already present
        let entry = self
            .queues
            .entry(api_key.to_string())
            .or_insert_with(|| Arc::new(ExchangeQueue::new()));
        Arc::clone(entry.value())
    }

    /// Point-in-time list of known keys
    pub fn keys(&self) -> Vec<String> {
        self.queues.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Pop everything currently queued for `api_key`, oldest first
    pub fn drain(&self, api_key: &str) -> Vec<Arc<Exchange>> {
        let Some(queue) = self.queues.get(api_key).map(|q| Arc::clone(q.value())) else {
            return Vec::new();
        };

        let mut drained = Vec::new();
        loop {
            match queue.receiver.try_recv() {
                Ok(exchange) => drained.push(exchange),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        drained
    }

    /// Drain every known key; keys with nothing queued are omitted
    pub fn drain_all(&self) -> Vec<(String, Vec<Arc<Exchange>>)> {
        self.keys()
            .into_iter()
            .filter_map(|key| {
                let drained = self.drain(&key);
                (!drained.is_empty()).then_some((key, drained))
            })
            .collect()
    }

    /// Number of items waiting for `api_key`
    pub fn pending(&self, api_key: &str) -> usize {
        self.queues.get(api_key).map_or(0, |q| q.receiver.len())
    }

    pub fn key_count(&self) -> usize {
        self.queues.len()
    }
}
