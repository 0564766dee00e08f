//! Clock offset estimation against the broker.
//!
//! The transport sends a time probe roughly every two seconds and feeds the
//! reply into [`Clock::on_time_sample`]. The lowest-RTT sample wins: its
//! midpoint gives the tightest bound on the broker/local offset. All
//! timestamps are passed in explicitly so the estimator stays a pure state
//! machine and tests never need a real timer.

use crate::error::EngineError;

/// One-shot callback fired once the first offset measurement lands.
pub type SyncWaiter = Box<dyn FnOnce() + Send>;

/// Estimated offset between local and broker time.
#[derive(Default)]
pub struct Clock {
    offset_ms: i64,
    lowest_ping_ms: Option<u64>,
    last_ping_ms: Option<u64>,
    synced: bool,
    waiters: Vec<SyncWaiter>,
}

impl Clock {
    /// A clock with no samples; `server_time` fails until the first one.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingests one probe exchange: the probe left at `sent_at_ms`, the
    /// reply carrying broker time `server_time_ms` arrived at `recv_at_ms`
    /// (both on the local monotonic timeline).
    ///
    /// Returns the sync waiters to invoke, non-empty only on the first
    /// sample. They are handed back rather than called here so the caller
    /// can release any surrounding lock first.
    #[must_use = "fire the returned sync waiters"]
    pub fn on_time_sample(
        &mut self,
        sent_at_ms: i64,
        recv_at_ms: i64,
        server_time_ms: i64,
    ) -> Vec<SyncWaiter> {
        let rtt = recv_at_ms.saturating_sub(sent_at_ms).max(0) as u64;

        if self.lowest_ping_ms.map_or(true, |low| rtt < low) {
            // Lowest RTT seen so far: the reply spent the least time in
            // flight, so its midpoint estimate is the most trustworthy.
            let midpoint = (sent_at_ms + recv_at_ms) / 2;
            self.offset_ms = server_time_ms - midpoint;
            self.lowest_ping_ms = Some(rtt);
        }
        self.last_ping_ms = Some(rtt);

        if self.synced {
            Vec::new()
        } else {
            self.synced = true;
            std::mem::take(&mut self.waiters)
        }
    }

    /// Estimated broker time for the given local time.
    pub fn server_time(&self, local_now_ms: i64) -> Result<i64, EngineError> {
        if !self.synced {
            return Err(EngineError::NotSynced);
        }
        Ok(local_now_ms + self.offset_ms)
    }

    /// Most recent probe round-trip in ms; `None` before the first reply.
    pub fn ping(&self) -> Option<u64> {
        self.last_ping_ms
    }

    /// `true` after the first successful offset measurement.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Registers a one-shot sync callback. If the clock is already synced
    /// the callback is handed back for the caller to invoke immediately
    /// (outside any lock); otherwise it is queued for the first sample.
    #[must_use = "an already-synced clock returns the callback for immediate invocation"]
    pub fn on_sync(&mut self, cb: SyncWaiter) -> Option<SyncWaiter> {
        if self.synced {
            Some(cb)
        } else {
            self.waiters.push(cb);
            None
        }
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock")
            .field("offset_ms", &self.offset_ms)
            .field("lowest_ping_ms", &self.lowest_ping_ms)
            .field("last_ping_ms", &self.last_ping_ms)
            .field("synced", &self.synced)
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_server_time_before_sync_fails() {
        let clock = Clock::new();
        assert!(matches!(clock.server_time(0), Err(EngineError::NotSynced)));
        assert_eq!(clock.ping(), None);
    }

    #[test]
    fn test_first_sample_syncs_and_sets_offset() {
        let mut clock = Clock::new();
        // Probe out at 100, back at 140, broker said 5_000.
        // Midpoint 120, offset 4_880.
        let waiters = clock.on_time_sample(100, 140, 5_000);
        assert!(waiters.is_empty());
        assert!(clock.is_synced());
        assert_eq!(clock.server_time(200).unwrap(), 200 + 4_880);
        assert_eq!(clock.ping(), Some(40));
    }

    #[test]
    fn test_lowest_rtt_sample_owns_the_offset() {
        let mut clock = Clock::new();
        let _ = clock.on_time_sample(0, 100, 1_000); // rtt 100, offset 950
        // Worse RTT: last_ping updates, offset does not.
        let _ = clock.on_time_sample(1_000, 1_150, 9_999); // rtt 150
        assert_eq!(clock.ping(), Some(150));
        assert_eq!(clock.server_time(0).unwrap(), 950);
        // Better RTT: offset re-estimated from the tighter midpoint.
        let _ = clock.on_time_sample(2_000, 2_020, 4_010); // rtt 20, mid 2_010
        assert_eq!(clock.ping(), Some(20));
        assert_eq!(clock.server_time(0).unwrap(), 4_010 - 2_010);
    }

    #[test]
    fn test_waiters_fire_exactly_once() {
        let mut clock = Clock::new();
        let fired = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let fired = Arc::clone(&fired);
            let queued = clock.on_sync(Box::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
            assert!(queued.is_none(), "callbacks queue before sync");
        }

        for w in clock.on_time_sample(0, 10, 100) {
            w();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        // A later sample must not produce the waiters again.
        assert!(clock.on_time_sample(100, 120, 300).is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_late_subscriber_fires_immediately() {
        let mut clock = Clock::new();
        let _ = clock.on_time_sample(0, 10, 100);

        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = Arc::clone(&fired);
        if let Some(cb) = clock.on_sync(Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        })) {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_negative_skew_offset() {
        let mut clock = Clock::new();
        // Broker is behind the local clock.
        let _ = clock.on_time_sample(10_000, 10_040, 2_000);
        assert_eq!(clock.server_time(10_020).unwrap(), 2_000);
    }
}
