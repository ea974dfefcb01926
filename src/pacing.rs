//! 적응형 청크 전송 간격
//!
//! 최근 전송 시도의 성공률로 청크 간 대기 시간을 조정한다.
//! 손실이 관측되면 처리량을 희생해 간격을 늘리고, 안정적이면 줄인다.

use std::collections::VecDeque;
use std::time::Duration;

use crate::Config;

/// 적응형 페이서
#[derive(Debug, Clone)]
pub struct AdaptivePacer {
    current: Duration,
    min: Duration,
    max: Duration,
    threshold_low: f64,
    threshold_high: f64,
    increase_factor: f64,
    decrease_factor: f64,
    enabled: bool,

    /// 최근 시도 결과 (true = 성공)
    outcomes: VecDeque<bool>,
    window_size: usize,
}

impl AdaptivePacer {
    pub fn new(config: &Config) -> Self {
        let min = Duration::from_millis(config.min_chunk_delay_ms);
        let max = Duration::from_millis(config.max_chunk_delay_ms);
        let window_size = config.pacing_window.max(1);

        Self {
            current: config.chunk_delay().clamp(min, max),
            min,
            max,
            threshold_low: config.success_threshold_low,
            threshold_high: config.success_threshold_high,
            increase_factor: config.delay_increase_factor,
            decrease_factor: config.delay_decrease_factor,
            enabled: config.adaptive_delay,
            outcomes: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    fn record(&mut self, success: bool) {
        if self.outcomes.len() >= self.window_size {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    pub fn record_success(&mut self) {
        self.record(true);
    }

    pub fn record_failure(&mut self) {
        self.record(false);
    }

    /// 윈도우 내 성공률 (기록이 없으면 1.0)
    pub fn success_ratio(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 1.0;
        }
        let ok = self.outcomes.iter().filter(|&&s| s).count();
        ok as f64 / self.outcomes.len() as f64
    }

    /// 성공률에 따라 간격 조정. 변경되면 (이전, 새 값) 반환
    pub fn adjust(&mut self) -> Option<(Duration, Duration)> {
        if !self.enabled {
            return None;
        }

        let ratio = self.success_ratio();
        let old = self.current;

        if ratio < self.threshold_low {
            self.current = old.mul_f64(self.increase_factor).min(self.max);
        } else if ratio >= self.threshold_high && old > self.min {
            self.current = old.mul_f64(self.decrease_factor).max(self.min);
        }

        let change = if self.current > old {
            self.current - old
        } else {
            old - self.current
        };
        if change > Duration::from_millis(10) {
            tracing::info!(
                "전송 간격 조정: {:.2}s -> {:.2}s (성공률 {:.1}%)",
                old.as_secs_f64(),
                self.current.as_secs_f64(),
                ratio * 100.0
            );
            Some((old, self.current))
        } else {
            None
        }
    }

    pub fn current_delay(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_low_success_increases_toward_ceiling() {
        let mut pacer = AdaptivePacer::new(&Config::default());
        for i in 0..10 {
            if i < 7 {
                pacer.record_success();
            } else {
                pacer.record_failure();
            }
        }
        assert!((pacer.success_ratio() - 0.7).abs() < 1e-9);

        pacer.adjust();
        let delay = pacer.current_delay().as_secs_f64();
        assert!((delay - 4.8).abs() < 1e-3);

        for _ in 0..20 {
            pacer.adjust();
        }
        assert_eq!(pacer.current_delay(), Duration::from_secs(10));
    }

    #[test]
    fn test_high_success_decreases_toward_floor() {
        let mut pacer = AdaptivePacer::new(&Config::default());
        pacer.record_failure();
        for _ in 0..49 {
            pacer.record_success();
        }
        assert!((pacer.success_ratio() - 0.98).abs() < 1e-9);

        pacer.adjust();
        assert!(pacer.current_delay() < Duration::from_secs(4));

        for _ in 0..100 {
            pacer.adjust();
        }
        assert_eq!(pacer.current_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_middle_band_holds_delay() {
        let mut pacer = AdaptivePacer::new(&Config::default());
        for i in 0..20 {
            if i == 0 {
                pacer.record_failure();
            } else {
                pacer.record_success();
            }
        }
        // 95%: 조정 구간 밖
        assert!(pacer.adjust().is_none());
        assert_eq!(pacer.current_delay(), Duration::from_secs(4));
    }

    #[test]
    fn test_window_forgets_old_failures() {
        let config = Config {
            pacing_window: 10,
            ..Config::default()
        };
        let mut pacer = AdaptivePacer::new(&config);
        for _ in 0..5 {
            pacer.record_failure();
        }
        for _ in 0..10 {
            pacer.record_success();
        }
        assert_eq!(pacer.success_ratio(), 1.0);
    }

    #[test]
    fn test_disabled_never_adjusts() {
        let mut pacer = AdaptivePacer::new(&Config::fast());
        for _ in 0..10 {
            pacer.record_failure();
        }
        assert!(pacer.adjust().is_none());
        assert_eq!(pacer.current_delay(), Duration::from_secs(1));
    }
}
