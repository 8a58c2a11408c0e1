//! Lossy telemetry bus: structured one-line records fanned out to
//! subscribers over bounded drop-oldest queues.
//!
//! Publishing never blocks: when a subscriber's queue is full the oldest
//! record for that subscriber is evicted and counted. Ordering is preserved
//! within a channel (each channel has a single producing task); nothing is
//! guaranteed across channels.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crossbeam::queue::ArrayQueue;

/// Well-known channel names. Tone trackers add `TRK<hz>` channels.
pub mod channels {
    pub const CHAN: &str = "CHAN";
    pub const TICK: &str = "TICK";
    pub const MARK: &str = "MARK";
    pub const SYNC: &str = "SYNC";
    pub const BCDS: &str = "BCDS";
    pub const SYM: &str = "SYM";
    pub const CORR: &str = "CORR";
    pub const CTRL: &str = "CTRL";
    pub const RESP: &str = "RESP";
    pub const TIME: &str = "TIME";
}

/// One telemetry record: a channel tag and a comma-joined body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub channel: String,
    pub body: String,
}

impl Record {
    pub fn new(channel: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            body: body.into(),
        }
    }

    /// The wire line: `CHANNEL,field1,field2,...`
    pub fn line(&self) -> String {
        format!("{},{}", self.channel, self.body)
    }
}

struct Subscriber {
    filter: Option<HashSet<String>>,
    queue: Arc<ArrayQueue<Record>>,
    dropped: Arc<AtomicU64>,
}

/// Receiving end handed to a sink task.
pub struct Subscription {
    queue: Arc<ArrayQueue<Record>>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    pub fn try_recv(&self) -> Option<Record> {
        self.queue.pop()
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<Record> {
        let mut out = Vec::new();
        while let Some(r) = self.queue.pop() {
            out.push(r);
        }
        out
    }

    /// Records evicted because this subscriber lagged.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The bus itself; clone the `Arc` freely across tasks.
pub struct TelemetryBus {
    subscribers: RwLock<Vec<Subscriber>>,
    published: AtomicU64,
    dropped_total: AtomicU64,
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            published: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Subscribe to every channel.
    pub fn subscribe(&self, capacity: usize) -> Subscription {
        self.subscribe_inner(None, capacity)
    }

    /// Subscribe to a channel subset.
    pub fn subscribe_filtered<I, S>(&self, channels: I, capacity: usize) -> Subscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let filter: HashSet<String> = channels.into_iter().map(Into::into).collect();
        self.subscribe_inner(Some(filter), capacity)
    }

    fn subscribe_inner(&self, filter: Option<HashSet<String>>, capacity: usize) -> Subscription {
        let queue = Arc::new(ArrayQueue::new(capacity.max(1)));
        let dropped = Arc::new(AtomicU64::new(0));
        let sub = Subscriber {
            filter,
            queue: Arc::clone(&queue),
            dropped: Arc::clone(&dropped),
        };
        self.subscribers
            .write()
            .expect("telemetry subscriber list poisoned")
            .push(sub);
        Subscription { queue, dropped }
    }

    /// Non-blocking broadcast. Lagging subscribers lose their oldest record.
    pub fn publish(&self, record: Record) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let subs = self
            .subscribers
            .read()
            .expect("telemetry subscriber list poisoned");
        for sub in subs.iter() {
            if let Some(filter) = &sub.filter {
                if !filter.contains(&record.channel) {
                    continue;
                }
            }
            if sub.queue.force_push(record.clone()).is_some() {
                sub.dropped.fetch_add(1, Ordering::Relaxed);
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_to_multiple_sinks() {
        let bus = TelemetryBus::new();
        let a = bus.subscribe(16);
        let b = bus.subscribe(16);
        bus.publish(Record::new(channels::TICK, "1000.0,5.1,0.92,1000.1,7"));
        assert_eq!(a.drain().len(), 1);
        assert_eq!(b.drain().len(), 1);
    }

    #[test]
    fn test_channel_filtering() {
        let bus = TelemetryBus::new();
        let ticks = bus.subscribe_filtered([channels::TICK], 16);
        bus.publish(Record::new(channels::MARK, "2000.0,800.0,12.5"));
        bus.publish(Record::new(channels::TICK, "1000.0,5.1,0.92,999.8,8"));
        let got = ticks.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].channel, channels::TICK);
    }

    #[test]
    fn test_lossy_drop_oldest() {
        let bus = TelemetryBus::new();
        let slow = bus.subscribe(4);
        for i in 0..10 {
            bus.publish(Record::new(channels::SYNC, format!("LOCKED,{i},0.9,3")));
        }
        let got = slow.drain();
        assert_eq!(got.len(), 4);
        // Oldest evicted: the survivors are the newest four, in order
        assert_eq!(got[0].body, "LOCKED,6,0.9,3");
        assert_eq!(got[3].body, "LOCKED,9,0.9,3");
        assert_eq!(slow.dropped(), 6);
        assert_eq!(bus.dropped_total(), 6);
    }

    #[test]
    fn test_line_format() {
        let r = Record::new(channels::SYM, "1,12,500.0,0.90,LOCKED");
        assert_eq!(r.line(), "SYM,1,12,500.0,0.90,LOCKED");
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = TelemetryBus::new();
        bus.publish(Record::new(channels::CTRL, "SET_TICK_THRESHOLD 3.0"));
        assert_eq!(bus.published(), 1);
    }
}
