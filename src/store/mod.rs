//! Abstract key/list/pub-sub store backing the broker.
//!
//! The broker only needs a handful of primitives: an atomic
//! enqueue-with-cap, a bounded blocking dequeue, expiring keys, an atomic
//! check-and-delete, and channel pub/sub with glob patterns. Anything
//! offering these, hosted or in-process, can back the gateway.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

pub mod memory;

/// Errors surfaced by a store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A capped list is full; the attempted push was rolled back.
    #[error("store: list capacity exceeded")]
    CapacityExceeded,

    /// The store or a subscriber handle was closed.
    #[error("store: closed")]
    Closed,

    /// Backend-specific failure.
    #[error("store: {0}")]
    Backend(String),
}

/// An event observed by a [`Subscriber`].
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub channel: String,
    /// Set when the event was delivered through a pattern subscription.
    pub pattern: Option<String>,
    pub payload: Bytes,
}

/// The key/list/pub-sub contract.
///
/// List semantics are left-push/right-pop, so each list is FIFO across all
/// enqueuers. Expiring keys exist independently of the lists; an entry's
/// validity is the existence of its timeout key.
pub trait Store: Send + Sync + 'static {
    /// Atomically: set `timeout_key` to expire after `timeout`, left-push
    /// `payload` onto `list_key`, and when `cap > 0` and the list length
    /// now exceeds `cap`, drop the pushed element again and fail with
    /// [`StoreError::CapacityExceeded`]. The timeout key is left behind to
    /// expire on its own, matching the rollback of the original script.
    fn enqueue(
        &self,
        timeout_key: &str,
        timeout: Duration,
        list_key: &str,
        payload: Bytes,
        cap: u32,
    ) -> Result<(), StoreError>;

    /// Blocking right-pop across `list_keys`, waiting at most `block`.
    /// Returns the popped key and payload, or `None` on timeout so the
    /// caller can re-check its stop signal.
    fn dequeue(
        &self,
        list_keys: &[String],
        block: Duration,
    ) -> Result<Option<(String, Bytes)>, StoreError>;

    /// Remaining lifetime of an expiring key, `None` when it is absent or
    /// already expired.
    fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Atomically deletes `key`, reporting whether it still existed.
    fn take_key(&self, key: &str) -> Result<bool, StoreError>;

    /// Publishes `payload` on `channel`.
    fn publish(&self, channel: &str, payload: Bytes) -> Result<(), StoreError>;

    /// Opens a dedicated subscriber handle.
    fn subscriber(&self) -> Result<Box<dyn Subscriber>, StoreError>;
}

/// A pub/sub subscription handle.
///
/// One event is delivered per matching subscription entry: a channel both
/// subscribed directly and matched by a pattern yields two events, the
/// pattern-matched one annotated with its pattern.
pub trait Subscriber: Send + Sync {
    /// Subscribes to `channel`, treated as a glob pattern when `pattern`.
    fn subscribe(&self, channel: &str, pattern: bool) -> Result<(), StoreError>;

    fn unsubscribe(&self, channel: &str, pattern: bool) -> Result<(), StoreError>;

    /// Next event, waiting at most `block`. `None` on timeout.
    fn next_event(&self, block: Duration) -> Result<Option<StoreEvent>, StoreError>;

    /// Tears down the subscription. Idempotent; a pending or subsequent
    /// `next_event` fails with [`StoreError::Closed`].
    fn close(&self);
}

/// Glob match with `*` (any run) and `?` (any single character), the
/// pattern dialect of channel subscriptions.
pub fn channel_matches(pattern: &str, channel: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let c: Vec<char> = channel.chars().collect();
    let (mut pi, mut ci) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ci < c.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == c[ci]) {
            pi += 1;
            ci += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ci));
            pi += 1;
        } else if let Some((spi, sci)) = star {
            // backtrack: let the last * swallow one more character
            pi = spi + 1;
            ci = sci + 1;
            star = Some((spi, sci + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
