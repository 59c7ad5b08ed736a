//! Process-local [`Store`] implementation.
//!
//! All state lives in `HashMap`s behind a single mutex, which makes the
//! enqueue-with-cap operation atomic the same way the hosted store's
//! server-side script does. Expiring keys are pruned lazily on access.
//! Blocked dequeues park on a wakeup channel fed by pushes, re-checking
//! the lists in bounded slices so a wakeup consumed by a sibling waiter
//! cannot stall them for the whole wait.
//!
//! Not durable; state is lost on process exit. Suited to tests and to
//! single-process deployments where the gateway and its callees share one
//! address space.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use may::sync::{mpmc, mpsc, Mutex};

use super::{channel_matches, Store, StoreError, StoreEvent, Subscriber};

const DEQUEUE_POLL_SLICE: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Inner {
    // expiring keys, by absolute deadline
    strings: HashMap<String, Instant>,
    lists: HashMap<String, VecDeque<Bytes>>,
}

struct SubEntry {
    channels: HashSet<String>,
    patterns: HashSet<String>,
    tx: mpsc::Sender<StoreEvent>,
}

struct Shared {
    inner: Mutex<Inner>,
    push_tx: Mutex<mpmc::Sender<()>>,
    push_rx: Mutex<mpmc::Receiver<()>>,
    subs: Mutex<HashMap<u64, SubEntry>>,
    next_sub: AtomicU64,
}

/// In-memory store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (push_tx, push_rx) = mpmc::channel();
        MemoryStore {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                push_tx: Mutex::new(push_tx),
                push_rx: Mutex::new(push_rx),
                subs: Mutex::new(HashMap::new()),
                next_sub: AtomicU64::new(0),
            }),
        }
    }
}

fn prune(inner: &mut Inner) {
    let now = Instant::now();
    inner.strings.retain(|_, deadline| *deadline > now);
}

impl Store for MemoryStore {
    fn enqueue(
        &self,
        timeout_key: &str,
        timeout: Duration,
        list_key: &str,
        payload: Bytes,
        cap: u32,
    ) -> Result<(), StoreError> {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            prune(&mut inner);
            inner
                .strings
                .insert(timeout_key.to_owned(), Instant::now() + timeout);
            let list = inner.lists.entry(list_key.to_owned()).or_default();
            list.push_front(payload);
            if cap > 0 && list.len() > cap as usize {
                // roll the push back; the timeout key is left to expire
                list.pop_front();
                return Err(StoreError::CapacityExceeded);
            }
        }
        let _ = self.shared.push_tx.lock().unwrap().send(());
        Ok(())
    }

    fn dequeue(
        &self,
        list_keys: &[String],
        block: Duration,
    ) -> Result<Option<(String, Bytes)>, StoreError> {
        let deadline = Instant::now() + block;
        // own wakeup handle, so waiting holds no store lock
        let rx = self.shared.push_rx.lock().unwrap().clone();
        loop {
            {
                let mut inner = self.shared.inner.lock().unwrap();
                for key in list_keys {
                    if let Some(list) = inner.lists.get_mut(key) {
                        if let Some(payload) = list.pop_back() {
                            return Ok(Some((key.clone(), payload)));
                        }
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(DEQUEUE_POLL_SLICE);
            let _ = rx.recv_timeout(wait);
        }
    }

    fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut inner = self.shared.inner.lock().unwrap();
        match inner.strings.get(key).copied() {
            None => Ok(None),
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    inner.strings.remove(key);
                    Ok(None)
                } else {
                    Ok(Some(deadline - now))
                }
            }
        }
    }

    fn take_key(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.shared.inner.lock().unwrap();
        prune(&mut inner);
        Ok(inner.strings.remove(key).is_some())
    }

    fn publish(&self, channel: &str, payload: Bytes) -> Result<(), StoreError> {
        let subs = self.shared.subs.lock().unwrap();
        for entry in subs.values() {
            if entry.channels.contains(channel) {
                let _ = entry.tx.send(StoreEvent {
                    channel: channel.to_owned(),
                    pattern: None,
                    payload: payload.clone(),
                });
            }
            for pattern in &entry.patterns {
                if channel_matches(pattern, channel) {
                    let _ = entry.tx.send(StoreEvent {
                        channel: channel.to_owned(),
                        pattern: Some(pattern.clone()),
                        payload: payload.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn subscriber(&self) -> Result<Box<dyn Subscriber>, StoreError> {
        let id = self.shared.next_sub.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        self.shared.subs.lock().unwrap().insert(
            id,
            SubEntry {
                channels: HashSet::new(),
                patterns: HashSet::new(),
                tx,
            },
        );
        Ok(Box::new(MemorySubscriber {
            id,
            shared: self.shared.clone(),
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemorySubscriber {
    id: u64,
    shared: Arc<Shared>,
    rx: Mutex<mpsc::Receiver<StoreEvent>>,
    closed: AtomicBool,
}

impl MemorySubscriber {
    fn with_entry(
        &self,
        f: impl FnOnce(&mut SubEntry),
    ) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let mut subs = self.shared.subs.lock().unwrap();
        let entry = subs.get_mut(&self.id).ok_or(StoreError::Closed)?;
        f(entry);
        Ok(())
    }
}

impl Subscriber for MemorySubscriber {
    fn subscribe(&self, channel: &str, pattern: bool) -> Result<(), StoreError> {
        self.with_entry(|e| {
            if pattern {
                e.patterns.insert(channel.to_owned());
            } else {
                e.channels.insert(channel.to_owned());
            }
        })
    }

    fn unsubscribe(&self, channel: &str, pattern: bool) -> Result<(), StoreError> {
        self.with_entry(|e| {
            if pattern {
                e.patterns.remove(channel);
            } else {
                e.channels.remove(channel);
            }
        })
    }

    fn next_event(&self, block: Duration) -> Result<Option<StoreEvent>, StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let rx = self.rx.lock().unwrap();
        match rx.recv_timeout(block) {
            Ok(ev) => Ok(Some(ev)),
            // disconnection only happens through close, which removed the
            // registry entry and with it our sender
            Err(_) => {
                if self.closed.load(Ordering::Acquire) {
                    Err(StoreError::Closed)
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shared.subs.lock().unwrap().remove(&self.id);
    }
}

impl Drop for MemorySubscriber {
    fn drop(&mut self) {
        Subscriber::close(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use may::go;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn lists_are_fifo() {
        let store = MemoryStore::new();
        for i in 0..3u8 {
            store
                .enqueue("t", ms(1000), "l", Bytes::from(vec![i]), 0)
                .unwrap();
        }
        let keys = ["l".to_owned()];
        for i in 0..3u8 {
            let (k, payload) = store.dequeue(&keys, ms(10)).unwrap().unwrap();
            assert_eq!(k, "l");
            assert_eq!(payload.as_ref(), &[i]);
        }
        assert!(store.dequeue(&keys, ms(10)).unwrap().is_none());
    }

    #[test]
    fn enqueue_rolls_back_over_cap() {
        let store = MemoryStore::new();
        for i in 0..2u8 {
            store
                .enqueue("t", ms(1000), "l", Bytes::from(vec![i]), 2)
                .unwrap();
        }
        match store.enqueue("t", ms(1000), "l", Bytes::from_static(b"x"), 2) {
            Err(StoreError::CapacityExceeded) => {}
            other => panic!("expected CapacityExceeded, got {other:?}"),
        }
        let inner = store.shared.inner.lock().unwrap();
        assert_eq!(inner.lists["l"].len(), 2);
    }

    #[test]
    fn concurrent_enqueues_respect_cap() {
        let store = MemoryStore::new();
        let mut handles = vec![];
        for i in 0..10u8 {
            let store = store.clone();
            handles.push(go!(move || {
                store
                    .enqueue(
                        &format!("t:{i}"),
                        ms(1000),
                        "l",
                        Bytes::from(vec![i]),
                        3,
                    )
                    .is_ok()
            }));
        }
        let ok = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|pushed| *pushed)
            .count();
        assert_eq!(ok, 3);
        let inner = store.shared.inner.lock().unwrap();
        assert_eq!(inner.lists["l"].len(), 3);
    }

    #[test]
    fn dequeue_wakes_on_push() {
        let store = MemoryStore::new();
        let pusher = store.clone();
        go!(move || {
            may::coroutine::sleep(ms(20));
            pusher
                .enqueue("t", ms(1000), "l", Bytes::from_static(b"v"), 0)
                .unwrap();
        });
        let start = Instant::now();
        let got = store.dequeue(&["l".to_owned()], ms(2000)).unwrap();
        assert!(got.is_some());
        assert!(start.elapsed() < ms(1500));
    }

    #[test]
    fn keys_expire() {
        let store = MemoryStore::new();
        store
            .enqueue("t", ms(30), "l", Bytes::from_static(b"v"), 0)
            .unwrap();
        assert!(store.ttl_remaining("t").unwrap().is_some());
        std::thread::sleep(ms(60));
        assert!(store.ttl_remaining("t").unwrap().is_none());
        assert!(!store.take_key("t").unwrap());
    }

    #[test]
    fn take_key_takes_once() {
        let store = MemoryStore::new();
        store
            .enqueue("t", ms(1000), "l", Bytes::from_static(b"v"), 0)
            .unwrap();
        assert!(store.take_key("t").unwrap());
        assert!(!store.take_key("t").unwrap());
    }

    #[test]
    fn publish_reaches_channel_and_pattern_subscriptions() {
        let store = MemoryStore::new();
        let sub = store.subscriber().unwrap();
        sub.subscribe("c", false).unwrap();
        sub.subscribe("c.*", true).unwrap();

        store.publish("c", Bytes::from_static(b"direct")).unwrap();
        store.publish("c.x", Bytes::from_static(b"glob")).unwrap();
        store.publish("d", Bytes::from_static(b"nope")).unwrap();

        let ev = sub.next_event(ms(100)).unwrap().unwrap();
        assert_eq!(ev.channel, "c");
        assert_eq!(ev.pattern, None);

        let ev = sub.next_event(ms(100)).unwrap().unwrap();
        assert_eq!(ev.channel, "c.x");
        assert_eq!(ev.pattern.as_deref(), Some("c.*"));

        assert!(sub.next_event(ms(20)).unwrap().is_none());
    }

    #[test]
    fn closed_subscriber_reports_closed() {
        let store = MemoryStore::new();
        let sub = store.subscriber().unwrap();
        sub.subscribe("c", false).unwrap();
        sub.close();
        assert!(matches!(sub.next_event(ms(10)), Err(StoreError::Closed)));
        assert!(matches!(sub.subscribe("c", false), Err(StoreError::Closed)));
        // publishing to a closed subscriber is a no-op
        store.publish("c", Bytes::from_static(b"v")).unwrap();
    }
}
