/// Counts heartbeats the dispatcher has not acknowledged.
///
/// The engine calls [`on_sent`](Self::on_sent) for every heartbeat and
/// [`on_ack`](Self::on_ack) for every `HeartbeatAck`. Acks are not matched
/// to individual heartbeats; any ack proves the dispatcher is alive.
#[derive(Debug, Clone)]
pub struct HeartbeatTracker {
    max_missed: u32,
    outstanding: u32,
}

impl HeartbeatTracker {
    pub fn new(max_missed: u32) -> Self {
        Self {
            max_missed: max_missed.max(1),
            outstanding: 0,
        }
    }

    pub fn on_sent(&mut self) {
        self.outstanding = self.outstanding.saturating_add(1);
    }

    pub fn on_ack(&mut self) {
        self.outstanding = 0;
    }

    /// `max_missed` heartbeats in a row went unanswered.
    pub fn is_lost(&self) -> bool {
        self.outstanding >= self.max_missed
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    pub fn reset(&mut self) {
        self.outstanding = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lost_after_max_missed() {
        let mut tracker = HeartbeatTracker::new(3);
        tracker.on_sent();
        tracker.on_sent();
        assert!(!tracker.is_lost());
        tracker.on_sent();
        assert!(tracker.is_lost());
    }

    #[test]
    fn ack_clears_outstanding() {
        let mut tracker = HeartbeatTracker::new(2);
        tracker.on_sent();
        tracker.on_sent();
        tracker.on_ack();
        assert_eq!(tracker.outstanding(), 0);
        assert!(!tracker.is_lost());
    }

    #[test]
    fn zero_threshold_is_treated_as_one() {
        let mut tracker = HeartbeatTracker::new(0);
        assert!(!tracker.is_lost());
        tracker.on_sent();
        assert!(tracker.is_lost());
        tracker.reset();
        assert!(!tracker.is_lost());
    }
}
