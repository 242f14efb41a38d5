//! mailbox.rs
//! Last-write-wins order mailbox between control handlers and the motion executor.
//! - Every accepted order gets a strictly increasing sequence number.
//! - `latest()` always returns the highest-sequenced order ever posted.
//! - Orders also travel over a bounded channel; when it is full the oldest
//!   pending order is discarded, never the new one.

use std::{
    fmt,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use log::debug;
use parking_lot::Mutex;

use super::command::Command;

/// Address-derived identity of a control client (`ip:port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<SocketAddr> for ClientId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderSource {
    Client(ClientId),
    /// Forced by the battery monitor.
    BatteryGuard,
}

#[derive(Debug, Clone)]
pub struct Order {
    pub command: Command,
    pub sequence: u64,
    pub raw_text: String,
    pub received_at: Instant,
    pub source: OrderSource,
}

pub struct OrderMailbox {
    tx: Sender<Order>,
    rx: Receiver<Order>,
    latest: Mutex<Option<Order>>,
    next_sequence: Mutex<u64>,
    dropped: AtomicU64,
}

impl OrderMailbox {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            latest: Mutex::new(None),
            next_sequence: Mutex::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Accepts an order and returns its sequence number.
    pub fn post(&self, command: Command, raw_text: impl Into<String>, source: OrderSource) -> u64 {
        // Sequence assignment, the latest slot and channel order all advance
        // under one lock so they can never disagree.
        let mut next = self.next_sequence.lock();
        *next += 1;
        let order = Order {
            command,
            sequence: *next,
            raw_text: raw_text.into(),
            received_at: Instant::now(),
            source,
        };
        *self.latest.lock() = Some(order.clone());
        self.enqueue(order);
        *next
    }

    fn enqueue(&self, mut order: Order) {
        loop {
            match self.tx.try_send(order) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    order = back;
                    if let Ok(stale) = self.rx.try_recv() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!("[MOTION] mailbox full, discarding order #{}", stale.sequence);
                    }
                }
                // Both ends live in `self`; unreachable in practice.
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// The most recently accepted order, if any.
    pub fn latest(&self) -> Option<Order> {
        self.latest.lock().clone()
    }

    pub fn latest_sequence(&self) -> u64 {
        *self.next_sequence.lock()
    }

    pub fn has_pending(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Orders discarded because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Waits up to `wait` for an order, then drains everything pending.
    /// Orders come back in sequence order; the last one is the newest.
    pub fn drain(&self, wait: Duration) -> Vec<Order> {
        let mut out = Vec::new();
        if wait.is_zero() {
            out.extend(self.rx.try_iter());
            return out;
        }
        match self.rx.recv_timeout(wait) {
            Ok(first) => {
                out.push(first);
                out.extend(self.rx.try_iter());
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        }
        out
    }
}
