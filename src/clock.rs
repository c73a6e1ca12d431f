use chrono::Utc;
use tokio::time::Instant;

/// Source of epoch-millisecond timestamps for the quota ledger.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Wall-clock time anchored once, then advanced by tokio's monotonic clock.
///
/// Under `tokio::time::pause()` the ledger moves with virtual time, which keeps
/// quota waits deterministic in tests.
#[derive(Debug, Clone)]
pub struct TokioClock {
    epoch_millis: i64,
    anchor: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now().timestamp_millis())
    }

    pub fn starting_at(epoch_millis: i64) -> Self {
        Self {
            epoch_millis,
            anchor: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> i64 {
        self.epoch_millis + self.anchor.elapsed().as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn follows_virtual_time() {
        let clock = TokioClock::starting_at(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(clock.now_millis(), 91_000);
    }
}
