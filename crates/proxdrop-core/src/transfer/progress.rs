//! 进度回调限流
//!
//! 回调之间至少间隔一秒，期间的更新直接丢弃；`finish` 不受限流影响。

use std::time::{Duration, Instant};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// 一次传输的进度，`processed` 单调不减
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressState {
    pub total: u64,
    pub processed: u64,
}

pub struct ProgressThrottler<F> {
    state: ProgressState,
    interval: Duration,
    last_fired: Option<Instant>,
    callback: F,
}

impl<F: FnMut(u64, u64)> ProgressThrottler<F> {
    /// `callback` 参数为 `(total, processed)`
    pub fn new(total: u64, callback: F) -> Self {
        Self::with_interval(total, DEFAULT_INTERVAL, callback)
    }

    pub fn with_interval(total: u64, interval: Duration, callback: F) -> Self {
        Self {
            state: ProgressState {
                total,
                processed: 0,
            },
            interval,
            last_fired: None,
            callback,
        }
    }

    pub fn state(&self) -> ProgressState {
        self.state
    }

    pub fn update(&mut self, processed: u64) -> bool {
        self.update_at(processed, Instant::now())
    }

    /// 以指定时刻更新，返回本次是否触发了回调
    pub fn update_at(&mut self, processed: u64, now: Instant) -> bool {
        self.state.processed = self.state.processed.max(processed);

        let due = self
            .last_fired
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if due {
            self.fire(now);
        }
        due
    }

    /// 最终进度，总是触发回调
    pub fn finish(&mut self, processed: u64) {
        self.state.processed = self.state.processed.max(processed);
        self.fire(Instant::now());
    }

    fn fire(&mut self, now: Instant) {
        self.last_fired = Some(now);
        (self.callback)(self.state.total, self.state.processed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_throttles_within_interval() {
        let calls = RefCell::new(Vec::new());
        let mut throttler = ProgressThrottler::new(100, |total, processed| {
            calls.borrow_mut().push((total, processed));
        });

        let start = Instant::now();
        assert!(throttler.update_at(10, start));
        assert!(!throttler.update_at(20, start + Duration::from_millis(200)));
        assert!(throttler.update_at(30, start + Duration::from_millis(1100)));

        assert_eq!(*calls.borrow(), vec![(100, 10), (100, 30)]);
    }

    #[test]
    fn test_finish_always_fires() {
        let mut count = 0;
        let mut throttler = ProgressThrottler::new(50, |_, _| count += 1);

        let start = Instant::now();
        throttler.update_at(10, start);
        throttler.finish(50);
        throttler.finish(50);
        drop(throttler);

        assert_eq!(count, 3);
    }

    #[test]
    fn test_processed_is_monotonic() {
        let mut seen = Vec::new();
        let mut throttler =
            ProgressThrottler::with_interval(10, Duration::ZERO, |_, processed| seen.push(processed));

        let now = Instant::now();
        throttler.update_at(5, now);
        throttler.update_at(3, now);
        throttler.update_at(8, now);
        assert_eq!(throttler.state().processed, 8);
        drop(throttler);

        assert_eq!(seen, vec![5, 5, 8]);
    }
}
