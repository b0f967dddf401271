// Application-level ping/pong bookkeeping.
//
// A pong that cannot be matched, answers an older ping than one already
// acknowledged, or arrives after the window is counted as late. Late pongs
// never fail the connection; only an unanswered ping past the window does.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_PONG_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PongOutcome {
    OnTime { round_trip: Duration },
    Late,
}

#[derive(Debug)]
pub struct LivenessTracker {
    window: Duration,
    outstanding: BTreeMap<i64, Instant>,
    newest_acked: Option<i64>,
    last_round_trip: Option<Duration>,
    last_pong_at: Option<Instant>,
    late_pongs: u64,
}

impl Default for LivenessTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PONG_WINDOW)
    }
}

impl LivenessTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            outstanding: BTreeMap::new(),
            newest_acked: None,
            last_round_trip: None,
            last_pong_at: None,
            late_pongs: 0,
        }
    }

    pub fn record_ping(&mut self, client_timestamp: i64, sent_at: Instant) {
        self.outstanding.insert(client_timestamp, sent_at);
    }

    pub fn record_pong(&mut self, client_timestamp: Option<i64>, received_at: Instant) -> PongOutcome {
        self.last_pong_at = Some(received_at);

        let Some(timestamp) = client_timestamp else {
            return self.late();
        };
        let Some(sent_at) = self.outstanding.remove(&timestamp) else {
            return self.late();
        };
        if self.newest_acked.is_some_and(|newest| timestamp < newest) {
            return self.late();
        }

        let round_trip = received_at.saturating_duration_since(sent_at);
        if round_trip > self.window {
            return self.late();
        }

        self.newest_acked = Some(timestamp);
        self.outstanding.retain(|pending, _| *pending > timestamp);
        self.last_round_trip = Some(round_trip);
        PongOutcome::OnTime { round_trip }
    }

    /// True when some ping has gone unanswered for longer than the window.
    pub fn is_overdue(&self, now: Instant) -> bool {
        self.outstanding
            .values()
            .any(|sent_at| now.saturating_duration_since(*sent_at) > self.window)
    }

    /// Forget outstanding pings, e.g. after the connection dropped.
    pub fn reset(&mut self) {
        self.outstanding.clear();
    }

    pub fn last_round_trip(&self) -> Option<Duration> {
        self.last_round_trip
    }

    pub fn last_pong_at(&self) -> Option<Instant> {
        self.last_pong_at
    }

    pub fn late_pongs(&self) -> u64 {
        self.late_pongs
    }

    fn late(&mut self) -> PongOutcome {
        self.late_pongs += 1;
        PongOutcome::Late
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn on_time_pong_reports_round_trip() {
        let mut tracker = LivenessTracker::default();
        tracker.record_ping(100, Instant::now());
        tokio::time::advance(Duration::from_millis(40)).await;

        let outcome = tracker.record_pong(Some(100), Instant::now());
        assert_eq!(outcome, PongOutcome::OnTime { round_trip: Duration::from_millis(40) });
        assert_eq!(tracker.last_round_trip(), Some(Duration::from_millis(40)));
        assert!(!tracker.is_overdue(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_and_out_of_order_pongs_are_late() {
        let mut tracker = LivenessTracker::default();
        tracker.record_ping(1, Instant::now());
        tracker.record_ping(2, Instant::now());

        assert_eq!(tracker.record_pong(None, Instant::now()), PongOutcome::Late);
        assert_eq!(tracker.record_pong(Some(77), Instant::now()), PongOutcome::Late);
        assert!(matches!(tracker.record_pong(Some(2), Instant::now()), PongOutcome::OnTime { .. }));
        assert_eq!(tracker.record_pong(Some(1), Instant::now()), PongOutcome::Late);
        assert_eq!(tracker.late_pongs(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_ping_becomes_overdue_and_late_answer_is_tolerated() {
        let mut tracker = LivenessTracker::new(Duration::from_secs(10));
        tracker.record_ping(5, Instant::now());

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!tracker.is_overdue(Instant::now()));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(tracker.is_overdue(Instant::now()));

        assert_eq!(tracker.record_pong(Some(5), Instant::now()), PongOutcome::Late);
        assert!(!tracker.is_overdue(Instant::now()));
        assert!(tracker.last_pong_at().is_some());
    }
}
