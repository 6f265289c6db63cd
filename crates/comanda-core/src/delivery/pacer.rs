//! Pacer - Gates batch starts at a fixed rate

use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Spaces out batch starts; a zero period disables pacing
pub struct Pacer {
    interval: Option<Interval>,
}

impl Pacer {
    pub fn new(period: Duration) -> Self {
        let ticker = (!period.is_zero()).then(|| {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        Self { interval: ticker }
    }

    /// Wait until the next batch may start. The first call returns at once.
    pub async fn ready(&mut self) {
        if let Some(ticker) = self.interval.as_mut() {
            ticker.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_batches_are_spaced() {
        let mut pacer = Pacer::new(Duration::from_millis(1000));
        let start = Instant::now();

        pacer.ready().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        pacer.ready().await;
        pacer.ready().await;
        assert_eq!(start.elapsed(), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_does_not_wait() {
        let mut pacer = Pacer::new(Duration::ZERO);
        let start = Instant::now();

        for _ in 0..5 {
            pacer.ready().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
