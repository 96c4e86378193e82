//! Bounded broadcast queue with overflow.
//!
//! The queue is a bounded MPMC channel sized at `workers · 10` plus an
//! unbounded overflow list behind a mutex. Events never get dropped for lack
//! of space: when the channel is full they divert to the overflow, and
//! workers move overflow items back into the channel (head first) after every
//! dequeue. Strict FIFO is sacrificed while saturated; the combined order is
//! approximate time order with no losses.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

use async_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;

struct Overflow<T> {
    items: VecDeque<T>,
    last_saturation: Option<SystemTime>,
}

/// Result of a push onto the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Item entered the bounded channel.
    Queued,
    /// Channel was full; item entered the overflow list.
    Overflowed,
    /// Channel is closed (shutdown); item was dropped.
    Closed,
}

/// Bounded channel + overflow pair used by the broadcaster.
pub struct EventQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    overflow: Mutex<Overflow<T>>,
    total_queued: AtomicUsize,
    peak_queue_size: AtomicUsize,
    saturation_count: AtomicU64,
}

/// Point-in-time queue counters.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub channel_size: usize,
    pub channel_capacity: usize,
    pub overflow_size: usize,
    pub total_queued: usize,
    pub peak_size: usize,
    pub saturation_count: u64,
    pub is_saturated: bool,
    pub last_saturation: Option<SystemTime>,
}

impl<T> EventQueue<T> {
    /// Create a queue whose bounded channel holds `capacity` items.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity);
        Self {
            tx,
            rx,
            overflow: Mutex::new(Overflow {
                items: VecDeque::new(),
                last_saturation: None,
            }),
            total_queued: AtomicUsize::new(0),
            peak_queue_size: AtomicUsize::new(0),
            saturation_count: AtomicU64::new(0),
        }
    }

    /// Non-blocking push: channel first, overflow when full.
    pub fn push(&self, item: T) -> PushOutcome {
        match self.tx.try_send(item) {
            Ok(()) => {
                self.note_queued();
                PushOutcome::Queued
            }
            Err(TrySendError::Full(item)) => {
                let mut overflow = self.overflow.lock();
                if overflow.items.is_empty() {
                    // empty -> non-empty transition marks a saturation event
                    self.saturation_count.fetch_add(1, Ordering::Relaxed);
                    overflow.last_saturation = Some(SystemTime::now());
                }
                overflow.items.push_back(item);
                drop(overflow);
                self.note_queued();
                PushOutcome::Overflowed
            }
            Err(TrySendError::Closed(_)) => PushOutcome::Closed,
        }
    }

    fn note_queued(&self) {
        let total = self.total_queued.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_queue_size.fetch_max(total, Ordering::Relaxed);
    }

    /// Wait for the next item.
    ///
    /// Decrements the queued count and backfills from overflow before
    /// returning. Once the channel is closed and drained, remaining overflow
    /// items are handed out directly; `None` means the queue is fully empty
    /// and shut down.
    pub async fn next(&self) -> Option<T> {
        match self.rx.recv().await {
            Ok(item) => {
                self.total_queued.fetch_sub(1, Ordering::Relaxed);
                self.backfill();
                Some(item)
            }
            Err(_) => {
                let item = self.overflow.lock().items.pop_front();
                if item.is_some() {
                    self.total_queued.fetch_sub(1, Ordering::Relaxed);
                }
                item
            }
        }
    }

    /// Move overflow items into the channel while there is room, head first.
    pub fn backfill(&self) {
        let mut overflow = self.overflow.lock();
        while let Some(item) = overflow.items.pop_front() {
            // non-blocking send only; a held mutex must never wait on the channel
            match self.tx.try_send(item) {
                Ok(()) => {}
                Err(TrySendError::Full(item)) | Err(TrySendError::Closed(item)) => {
                    overflow.items.push_front(item);
                    break;
                }
            }
        }
    }

    /// Close the channel. Already-queued items remain receivable; further
    /// pushes report [`PushOutcome::Closed`].
    pub fn close(&self) {
        self.tx.close();
    }

    /// True once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Items across channel and overflow.
    pub fn total_queued(&self) -> usize {
        self.total_queued.load(Ordering::Relaxed)
    }

    /// Counter snapshot for stats reporting.
    pub fn snapshot(&self) -> QueueSnapshot {
        let overflow = self.overflow.lock();
        QueueSnapshot {
            channel_size: self.tx.len(),
            channel_capacity: self.tx.capacity().unwrap_or(0),
            overflow_size: overflow.items.len(),
            total_queued: self.total_queued.load(Ordering::Relaxed),
            peak_size: self.peak_queue_size.load(Ordering::Relaxed),
            saturation_count: self.saturation_count.load(Ordering::Relaxed),
            is_saturated: !overflow.items.is_empty(),
            last_saturation: overflow.last_saturation,
        }
    }
}
