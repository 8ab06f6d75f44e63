use std::time::Duration;

use tokio::time::Instant;

/// Producer-side credit regulator.
///
/// `credit` is the difference between the granted and received monotonic
/// counters and never exceeds `rate`, which bounds `granted − received` over
/// any one-second window. The receive path replaces consumed credit only
/// within the current window's budget; once the budget is spent the flow is
/// stopped until the timed replenishment opens a fresh window.
#[derive(Debug)]
pub(crate) struct RateFlowControl {
    rate: u32,
    credit: u32,
    last_grant: Option<Instant>,
    window_start: Option<Instant>,
    granted_in_window: u32,
}

const WINDOW: Duration = Duration::from_secs(1);
const INITIAL_CREDIT_CAP: u32 = 300;
const MAX_SCHEDULED_DELAY: Duration = Duration::from_millis(500);

impl RateFlowControl {
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            credit: 0,
            last_grant: None,
            window_start: None,
            granted_in_window: 0,
        }
    }

    /// Credit currently held by the producer.
    pub fn credit(&self) -> u32 {
        self.credit
    }

    /// Credit to issue when the session becomes ready to send.
    pub fn initial_credit(&self) -> u32 {
        self.rate.min(INITIAL_CREDIT_CAP)
    }

    /// Producer has no credit and the window that exhausted it is still
    /// current. A producer frame arriving now is a rate violation.
    pub fn flow_stopped(&self, now: Instant) -> bool {
        self.credit == 0
            && self
                .last_grant
                .map(|at| now.duration_since(at) < WINDOW)
                .unwrap_or(false)
    }

    /// Account for received messages and return the credit that may be
    /// granted back right now (possibly zero).
    pub fn received_message(&mut self, now: Instant, msgs: u32) -> u32 {
        self.credit = self.credit.saturating_sub(msgs);
        let budget = match self.window_start {
            Some(start) if now.duration_since(start) < WINDOW => {
                self.rate.saturating_sub(self.granted_in_window)
            }
            _ => self.rate,
        };
        budget.min(self.rate - self.credit)
    }

    /// Record credit actually sent to the producer.
    pub fn sent_credit(&mut self, now: Instant, credit: u32) {
        match self.window_start {
            Some(start) if now.duration_since(start) < WINDOW => {}
            _ => {
                self.window_start = Some(now);
                self.granted_in_window = 0;
            }
        }
        self.granted_in_window = self.granted_in_window.saturating_add(credit);
        self.credit = (self.credit + credit).min(self.rate);
        self.last_grant = Some(now);
    }

    /// Timed replenishment: open a fresh window and return the credit that
    /// restores the producer to a full rate's worth.
    pub fn replenish(&mut self, now: Instant) -> u32 {
        self.window_start = Some(now);
        self.granted_in_window = 0;
        self.rate - self.credit
    }

    /// Deferred-grant delay: time for 50 messages at the configured rate,
    /// capped at 500 ms.
    pub fn scheduled_delay(&self) -> Duration {
        let per_fifty = Duration::from_millis(50_000 / u64::from(self.rate.max(1)));
        per_fifty.min(MAX_SCHEDULED_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_consumes_initial_grant_without_regrant() {
        let mut flow = RateFlowControl::new(10);
        let t0 = Instant::now();
        assert_eq!(flow.initial_credit(), 10);
        flow.sent_credit(t0, 10);

        for _ in 0..10 {
            tokio::time::advance(Duration::from_millis(10)).await;
            assert_eq!(flow.received_message(Instant::now(), 1), 0);
        }
        assert!(flow.flow_stopped(Instant::now()));

        // scheduled task fires at 500 ms and restores a full grant
        tokio::time::advance(Duration::from_millis(400)).await;
        let now = Instant::now();
        let granted = flow.replenish(now);
        assert_eq!(granted, 10);
        flow.sent_credit(now, granted);
        assert!(!flow.flow_stopped(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn receive_path_grants_after_window_expiry() {
        let mut flow = RateFlowControl::new(5);
        flow.sent_credit(Instant::now(), 5);
        for _ in 0..5 {
            flow.received_message(Instant::now(), 1);
        }
        tokio::time::advance(Duration::from_millis(1100)).await;
        // window expired: budget is fresh and the consumed credit comes back
        assert_eq!(flow.received_message(Instant::now(), 0), 5);
        assert!(!flow.flow_stopped(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn credit_never_exceeds_rate() {
        let mut flow = RateFlowControl::new(8);
        let mut grant = flow.initial_credit();
        flow.sent_credit(Instant::now(), grant);
        for step in 0..50u32 {
            tokio::time::advance(Duration::from_millis(37)).await;
            let now = Instant::now();
            grant = if step % 7 == 0 {
                flow.replenish(now)
            } else {
                flow.received_message(now, step % 3)
            };
            if grant > 0 {
                flow.sent_credit(now, grant);
            }
            assert!(flow.credit() <= flow.rate);
        }
    }

    #[test]
    fn scheduled_delay_is_capped() {
        assert_eq!(
            RateFlowControl::new(10).scheduled_delay(),
            Duration::from_millis(500)
        );
        assert_eq!(
            RateFlowControl::new(1000).scheduled_delay(),
            Duration::from_millis(50)
        );
    }
}
