use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};

/// Paces a stream publisher
#[async_trait]
pub trait Ticker: Send {
    /// Wait for the next tick
    async fn tick(&mut self);
}

/// Fixed-rate ticker; ticks missed while the publisher was busy are skipped
#[derive(Debug)]
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_interval_ticker_period() {
        let mut ticker = IntervalTicker::new(Duration::from_millis(100));
        let start = Instant::now();

        // First tick is immediate
        ticker.tick().await;
        ticker.tick().await;
        ticker.tick().await;

        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_ticker_skips_missed() {
        let mut ticker = IntervalTicker::new(Duration::from_millis(100));
        ticker.tick().await;

        tokio::time::sleep(Duration::from_millis(350)).await;
        let start = Instant::now();

        // The overdue tick fires at once, then the schedule realigns
        ticker.tick().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        ticker.tick().await;
        assert_eq!(start.elapsed(), Duration::from_millis(50));
    }

    #[test]
    fn test_zero_period_clamped() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let ticker = rt.block_on(async { IntervalTicker::new(Duration::ZERO) });
        assert_eq!(ticker.period(), Duration::from_millis(1));
    }
}
