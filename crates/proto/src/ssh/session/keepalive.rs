//! Keepalive scheduling for server connections.
//!
//! One [`KeepaliveRegistry`] is shared by every connection of a server (or
//! an entire process) via dependency injection. A single periodic task,
//! started lazily on first registration and stopped when the registry
//! empties, scans all registered streams: a stream idle longer than the
//! configured interval gets its miss counter bumped and a
//! [`KeepaliveSignal::Probe`] (the session turns that into a global request
//! expecting a reply); a stream exceeding the miss budget gets a
//! [`KeepaliveSignal::Timeout`] and is removed. Any inbound packet resets a
//! stream's idle clock and miss counter via [`KeepaliveHandle::activity`].
//!
//! The registry is mutex-guarded; the scan copies the id set first so an
//! entry removing itself mid-scan (the timeout path) never invalidates the
//! iteration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Request name used for keepalive probes (a reply of either flavor counts).
pub const KEEPALIVE_REQUEST: &str = "keepalive@openssh.com";

/// Signal delivered to a registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveSignal {
    /// The stream has been idle for a full interval: send a probe.
    Probe,
    /// The stream missed too many probes: disconnect with a
    /// `client-timeout` error.
    Timeout,
}

struct Entry {
    last_activity: Instant,
    misses: u32,
    signal: mpsc::UnboundedSender<KeepaliveSignal>,
}

struct Inner {
    entries: HashMap<u64, Entry>,
    next_id: u64,
    task_running: bool,
}

/// Shared keepalive scheduler.
pub struct KeepaliveRegistry {
    interval: Duration,
    max_misses: u32,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for KeepaliveRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepaliveRegistry")
            .field("interval", &self.interval)
            .field("max_misses", &self.max_misses)
            .finish_non_exhaustive()
    }
}

impl KeepaliveRegistry {
    /// Creates a registry probing idle streams every `interval` and
    /// disconnecting after more than `max_misses` unanswered probes.
    pub fn new(interval: Duration, max_misses: u32) -> Arc<Self> {
        Arc::new(Self {
            interval,
            max_misses,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_id: 0,
                task_running: false,
            }),
        })
    }

    /// Registers a stream. The scan task starts lazily with the first
    /// registration.
    ///
    /// Returns a handle (deregisters on drop) and the signal receiver the
    /// session must service.
    pub fn register(
        self: &Arc<Self>,
    ) -> (KeepaliveHandle, mpsc::UnboundedReceiver<KeepaliveSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.inner.lock().expect("keepalive registry poisoned");
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.insert(
                id,
                Entry {
                    last_activity: Instant::now(),
                    misses: 0,
                    signal: tx,
                },
            );
            if !inner.task_running {
                inner.task_running = true;
                let registry = Arc::clone(self);
                tokio::spawn(async move {
                    registry.run_scan_loop().await;
                });
            }
            id
        };
        debug!(id, "keepalive stream registered");
        (
            KeepaliveHandle {
                registry: Arc::clone(self),
                id,
            },
            rx,
        )
    }

    /// Returns the number of registered streams.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("keepalive registry poisoned")
            .entries
            .len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True while the scan task is alive.
    pub fn is_running(&self) -> bool {
        self.inner
            .lock()
            .expect("keepalive registry poisoned")
            .task_running
    }

    async fn run_scan_loop(self: Arc<Self>) {
        debug!(interval = ?self.interval, "keepalive scan task started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if !self.scan() {
                break;
            }
        }
        debug!("keepalive scan task stopped");
    }

    /// One scan pass; returns false when the registry emptied and the task
    /// should stop.
    fn scan(&self) -> bool {
        let mut inner = self.inner.lock().expect("keepalive registry poisoned");
        let now = Instant::now();

        // Copy the ids first: the timeout path removes entries mid-scan.
        let ids: Vec<u64> = inner.entries.keys().copied().collect();
        for id in ids {
            let Some(entry) = inner.entries.get_mut(&id) else {
                continue;
            };
            if now.duration_since(entry.last_activity) < self.interval {
                continue;
            }
            entry.misses += 1;
            if entry.misses > self.max_misses {
                warn!(id, misses = entry.misses, "keepalive budget exhausted");
                let _ = entry.signal.send(KeepaliveSignal::Timeout);
                inner.entries.remove(&id);
            } else if entry.signal.send(KeepaliveSignal::Probe).is_err() {
                // Session is gone without deregistering.
                inner.entries.remove(&id);
            }
        }

        if inner.entries.is_empty() {
            inner.task_running = false;
            return false;
        }
        true
    }

    fn activity(&self, id: u64) {
        let mut inner = self.inner.lock().expect("keepalive registry poisoned");
        if let Some(entry) = inner.entries.get_mut(&id) {
            entry.last_activity = Instant::now();
            entry.misses = 0;
        }
    }

    fn deregister(&self, id: u64) {
        let mut inner = self.inner.lock().expect("keepalive registry poisoned");
        if inner.entries.remove(&id).is_some() {
            debug!(id, "keepalive stream deregistered");
        }
    }
}

/// Per-stream handle into a [`KeepaliveRegistry`].
#[derive(Debug)]
pub struct KeepaliveHandle {
    registry: Arc<KeepaliveRegistry>,
    id: u64,
}

impl KeepaliveHandle {
    /// Records inbound traffic: resets the idle clock and miss counter.
    pub fn activity(&self) {
        self.registry.activity(self.id);
    }

    /// Removes the stream from the registry.
    pub fn deregister(&self) {
        self.registry.deregister(self.id);
    }
}

impl Drop for KeepaliveHandle {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_idle_stream_probed_then_timed_out() {
        let registry = KeepaliveRegistry::new(Duration::from_millis(20), 2);
        let (_handle, mut rx) = registry.register();

        // Two probes, then the timeout.
        for _ in 0..2 {
            let signal = timeout(Duration::from_millis(500), rx.recv())
                .await
                .expect("signal in time")
                .expect("channel open");
            assert_eq!(signal, KeepaliveSignal::Probe);
        }
        let signal = timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("signal in time")
            .expect("channel open");
        assert_eq!(signal, KeepaliveSignal::Timeout);

        // The timed-out stream was removed from the registry.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_activity_resets_miss_counter() {
        let registry = KeepaliveRegistry::new(Duration::from_millis(30), 1);
        let (handle, mut rx) = registry.register();

        // Keep the stream active; no signal should arrive.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.activity();
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_task_stops_when_registry_empties() {
        let registry = KeepaliveRegistry::new(Duration::from_millis(10), 3);
        let (handle, _rx) = registry.register();
        assert!(registry.is_running());

        handle.deregister();
        // The next scan notices the empty registry and stops.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!registry.is_running());

        // A later registration restarts it.
        let (_handle2, _rx2) = registry.register();
        assert!(registry.is_running());
    }

    #[tokio::test]
    async fn test_handle_drop_deregisters() {
        let registry = KeepaliveRegistry::new(Duration::from_millis(10), 3);
        {
            let (_handle, _rx) = registry.register();
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }
}
