pub mod datagram;
pub mod streaming;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::handler::Response;

/// Observe reordering window (RFC 7641 section 3.4): sequence numbers are
/// 24 bit and compared with wrap-around, and anything older than 128 s is
/// considered fresh regardless of counter.
const OBSERVE_WINDOW: u32 = 1 << 23;
const OBSERVE_MAX_AGE: Duration = Duration::from_secs(128);

/// `true` iff a notification with counter `incoming` received now is newer
/// than the previously accepted `(seq, seen)` state.
pub(crate) fn observe_is_newer(previous: Option<(u32, Instant)>, incoming: u32, now: Instant) -> bool {
    match previous {
        None => true,
        Some((v1, t1)) => {
            (v1 < incoming && incoming - v1 < OBSERVE_WINDOW)
                || (v1 > incoming && v1 - incoming > OBSERVE_WINDOW)
                || now > t1 + OBSERVE_MAX_AGE
        }
    }
}

/// Notification sink of an Observe subscription.
pub type NotificationFn = Arc<dyn Fn(Response) + Send + Sync>;

/// Long-lived record of one Observe registration, owned by the session and
/// keyed by its token. Lives until explicitly cancelled or the session
/// closes.
pub(crate) struct Subscription {
    pub callback: NotificationFn,
    pub last: Option<(u32, Instant)>,
}

impl Subscription {
    pub fn new(callback: NotificationFn) -> Subscription {
        Subscription { callback, last: None }
    }

    /// Apply the freshness rule; stale notifications are dropped, fresh ones
    /// update the high-water mark. A notification without an Observe option
    /// is always delivered (it ends the observation per RFC 7641).
    pub fn accept(&mut self, observe: Option<u32>, now: Instant) -> bool {
        match observe {
            None => true,
            Some(seq) => {
                if observe_is_newer(self.last, seq, now) {
                    self.last = Some((seq, now));
                    true
                } else {
                    false
                }
            }
        }
    }
}

/// Bounded message-id deduplication cache with FIFO eviction and entry
/// expiry after EXCHANGE_LIFETIME. The cached reply (piggybacked ACK or
/// empty ACK) is resent for duplicates.
pub(crate) struct DedupCache {
    capacity: usize,
    lifetime: Duration,
    entries: FxHashMap<u16, DedupEntry>,
    order: VecDeque<(Instant, u16)>,
}

struct DedupEntry {
    at: Instant,
    reply: Option<Bytes>,
}

impl DedupCache {
    pub fn new(capacity: usize, lifetime: Duration) -> DedupCache {
        DedupCache {
            capacity,
            lifetime,
            entries: FxHashMap::default(),
            order: VecDeque::new(),
        }
    }

    fn purge(&mut self, now: Instant) {
        while let Some(&(at, mid)) = self.order.front() {
            let expired = now.duration_since(at) >= self.lifetime;
            if expired || self.order.len() > self.capacity {
                self.order.pop_front();
                // only drop the entry if it still belongs to this insertion
                if self.entries.get(&mid).is_some_and(|e| e.at == at) {
                    self.entries.remove(&mid);
                }
            } else {
                break;
            }
        }
    }

    /// `Some(reply)` when the mid is a known duplicate; `None` when it is
    /// fresh (and gets recorded).
    pub fn check_and_record(&mut self, mid: u16, now: Instant) -> Option<Option<Bytes>> {
        self.purge(now);
        if let Some(entry) = self.entries.get(&mid) {
            return Some(entry.reply.clone());
        }
        self.entries.insert(mid, DedupEntry { at: now, reply: None });
        self.order.push_back((now, mid));
        self.purge(now);
        None
    }

    pub fn store_reply(&mut self, mid: u16, reply: Bytes) {
        if let Some(entry) = self.entries.get_mut(&mid) {
            entry.reply = Some(reply);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::first(None, 5, true)]
    #[case::increment(Some(5), 6, true)]
    #[case::same(Some(5), 5, false)]
    #[case::older(Some(7), 6, false)]
    #[case::wraparound_newer(Some(0xff_fff0), 2, true)]
    #[case::wraparound_stale(Some(2), 0xff_fff0, false)]
    #[case::big_jump_forward(Some(0), OBSERVE_WINDOW - 1, true)]
    #[case::window_edge(Some(0), OBSERVE_WINDOW, false)]
    fn test_observe_is_newer(#[case] previous: Option<u32>, #[case] incoming: u32, #[case] expected: bool) {
        let now = Instant::now();
        assert_eq!(
            observe_is_newer(previous.map(|v| (v, now)), incoming, now),
            expected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_observe_age_overrides_counter() {
        let now = Instant::now();
        tokio::time::sleep(Duration::from_secs(129)).await;
        // counter went backwards, but the last accepted value is too old
        assert!(observe_is_newer(Some((7, now)), 6, Instant::now()));
    }

    #[test]
    fn test_dedup_records_and_detects() {
        let mut cache = DedupCache::new(16, Duration::from_secs(247));
        let now = Instant::now();

        assert_eq!(cache.check_and_record(7, now), None);
        assert_eq!(cache.check_and_record(7, now), Some(None));

        cache.store_reply(7, Bytes::from_static(b"ack"));
        assert_eq!(
            cache.check_and_record(7, now),
            Some(Some(Bytes::from_static(b"ack")))
        );

        assert_eq!(cache.check_and_record(8, now), None);
    }

    #[test]
    fn test_dedup_fifo_eviction() {
        let mut cache = DedupCache::new(2, Duration::from_secs(247));
        let now = Instant::now();

        assert_eq!(cache.check_and_record(1, now), None);
        assert_eq!(cache.check_and_record(2, now), None);
        assert_eq!(cache.check_and_record(3, now), None);

        // 1 was evicted, so it counts as fresh again
        assert_eq!(cache.check_and_record(1, now), None);
        assert_eq!(cache.check_and_record(3, now), Some(None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_expiry() {
        let mut cache = DedupCache::new(16, Duration::from_secs(247));

        assert_eq!(cache.check_and_record(9, Instant::now()), None);
        tokio::time::sleep(Duration::from_secs(246)).await;
        assert_eq!(cache.check_and_record(9, Instant::now()), Some(None));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(cache.check_and_record(9, Instant::now()), None);
    }
}
