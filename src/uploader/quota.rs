use std::time::Duration;

/// "At most `budget` uploads in any trailing `window`", enforced by pruning a
/// ledger of epoch-millisecond timestamps rather than resetting a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaWindow {
    pub budget: usize,
    pub window: Duration,
}

impl QuotaWindow {
    pub fn new(budget: usize, window: Duration) -> Self {
        Self { budget, window }
    }

    pub fn window_ms(&self) -> i64 {
        self.window.as_millis() as i64
    }

    /// An entry stays in the window while `now - ts < window`.
    fn in_window(&self, ts: i64, now: i64) -> bool {
        now - ts < self.window_ms()
    }

    pub fn prune(&self, ledger: &mut Vec<i64>, now: i64) {
        ledger.retain(|ts| self.in_window(*ts, now));
    }

    pub fn used(&self, ledger: &[i64], now: i64) -> usize {
        ledger.iter().filter(|ts| self.in_window(**ts, now)).count()
    }

    /// Time until the oldest in-window entry leaves the window.
    pub fn wait_until_free(&self, ledger: &[i64], now: i64) -> Option<Duration> {
        let oldest = ledger
            .iter()
            .copied()
            .filter(|ts| self.in_window(*ts, now))
            .min()?;
        let wait_ms = (oldest + self.window_ms() - now).max(0);
        Some(Duration::from_millis(wait_ms as u64))
    }

    /// Rough time to drain `pending` uploads at the configured rate.
    pub fn estimate_drain(&self, pending: usize) -> Duration {
        if pending == 0 || self.budget == 0 {
            return Duration::ZERO;
        }
        let windows = pending.div_ceil(self.budget) as u32;
        self.window.saturating_mul(windows)
    }
}
