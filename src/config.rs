//! 프로토콜 설정

use std::time::Duration;

use crate::DEFAULT_CHUNK_SIZE;

/// Meshsend 프로토콜 설정
///
/// 시간 값은 밀리초 단위로 보관하고 사용하는 곳에서 `Duration`으로 변환한다.
#[derive(Debug, Clone)]
pub struct Config {
    /// 헤더 포함 청크 크기 (바이트, 전송 계층 MTU)
    pub chunk_size: usize,

    /// 청크당 최대 전송 시도 횟수
    pub max_retries: u32,

    /// 재시도 기본 지연 (밀리초)
    /// 시도 n 실패 후 base * 2^(n-1) 대기
    pub base_retry_delay_ms: u64,

    /// 청크 간 초기 전송 간격 (밀리초)
    pub chunk_delay_ms: u64,

    /// 청크 간격 하한 (밀리초)
    pub min_chunk_delay_ms: u64,

    /// 청크 간격 상한 (밀리초)
    pub max_chunk_delay_ms: u64,

    /// 성공률 기반 간격 자동 조정
    pub adaptive_delay: bool,

    /// 이 성공률 미만이면 간격 증가
    pub success_threshold_low: f64,

    /// 이 성공률 이상이면 간격 감소
    pub success_threshold_high: f64,

    /// 간격 증가 배율
    pub delay_increase_factor: f64,

    /// 간격 감소 배율
    pub delay_decrease_factor: f64,

    /// 성공률 측정 윈도우 (전송 시도 수)
    pub pacing_window: usize,

    /// 페이로드 압축 시도 여부
    pub compress_payload: bool,

    /// 이 크기를 넘는 페이로드만 압축 시도 (바이트)
    pub compression_min_size: usize,

    /// 압축 채택에 필요한 최소 절감 비율 (0.05 = 5%)
    pub compression_min_savings: f64,

    /// 초기 전송 후 수신자 응답 대기 라운드 수
    pub wait_rounds: u32,

    /// 대기 라운드 길이 (밀리초)
    pub wait_round_interval_ms: u64,

    /// 정체 검사 주기 (밀리초)
    pub stall_check_interval_ms: u64,

    /// 이 시간 동안 갱신이 없으면 누락 청크 요청 (밀리초)
    pub stall_request_timeout_ms: u64,

    /// 전송 만료 타임아웃 하한 (밀리초)
    pub transfer_timeout_ms: u64,

    /// 타임아웃 계산용 청크당 오버헤드 (밀리초)
    pub chunk_overhead_ms: u64,

    /// 예상 전송 시간에 곱하는 배율
    pub timeout_multiplier: f64,

    /// 전송 만료 타임아웃 상한 (밀리초)
    pub max_transfer_timeout_ms: u64,

    /// 완료된 전송 기록 보존 기간 (밀리초)
    pub completed_retention_ms: u64,

    /// 완료 확인(OK) 반복 전송 횟수
    pub completion_repeats: u32,

    /// 완료 확인 반복 간격 (밀리초)
    pub completion_repeat_interval_ms: u64,

    /// 텍스트 메시지 최대 길이 (바이트)
    pub max_text_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: 3,
            base_retry_delay_ms: 3_000,       // 3s, 6s, 12s
            chunk_delay_ms: 4_000,
            min_chunk_delay_ms: 1_000,
            max_chunk_delay_ms: 10_000,
            adaptive_delay: true,
            success_threshold_low: 0.90,
            success_threshold_high: 0.98,
            delay_increase_factor: 1.2,
            delay_decrease_factor: 0.95,
            pacing_window: 50,
            compress_payload: true,
            compression_min_size: 500,
            compression_min_savings: 0.05,
            wait_rounds: 10,                  // 최대 150초 대기
            wait_round_interval_ms: 15_000,
            stall_check_interval_ms: 15_000,
            stall_request_timeout_ms: 20_000,
            transfer_timeout_ms: 60_000,
            chunk_overhead_ms: 2_000,
            timeout_multiplier: 1.5,
            max_transfer_timeout_ms: 300_000, // 5분
            completed_retention_ms: 300_000,
            completion_repeats: 3,
            completion_repeat_interval_ms: 500,
            max_text_len: 200,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 청크 간격 설정 (상한/하한으로 제한)
    pub fn with_chunk_delay_ms(mut self, delay_ms: u64) -> Self {
        self.chunk_delay_ms = delay_ms.clamp(self.min_chunk_delay_ms, self.max_chunk_delay_ms);
        self
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    pub fn wait_round_interval(&self) -> Duration {
        Duration::from_millis(self.wait_round_interval_ms)
    }

    pub fn stall_check_interval(&self) -> Duration {
        Duration::from_millis(self.stall_check_interval_ms)
    }

    pub fn stall_request_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_request_timeout_ms)
    }

    pub fn completed_retention(&self) -> Duration {
        Duration::from_millis(self.completed_retention_ms)
    }

    /// 재시도 대기 시간 계산 (attempt는 1부터)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_retry_delay_ms.saturating_mul(factor))
    }

    /// 고속 모드: 최소 간격, 자동 조정 비활성화
    pub fn fast() -> Self {
        let base = Self::default();
        Self {
            chunk_delay_ms: base.min_chunk_delay_ms,
            adaptive_delay: false,
            ..base
        }
    }

    /// 불안정한 메시용 설정
    pub fn unstable_network() -> Self {
        Self {
            max_retries: 5,
            chunk_delay_ms: 6_000,
            success_threshold_low: 0.95,
            pacing_window: 20,
            wait_rounds: 20,                  // 최대 5분 대기
            stall_request_timeout_ms: 30_000,
            transfer_timeout_ms: 120_000,
            chunk_overhead_ms: 4_000,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff() {
        let config = Config::default();
        assert_eq!(config.retry_delay(1), Duration::from_secs(3));
        assert_eq!(config.retry_delay(2), Duration::from_secs(6));
        assert_eq!(config.retry_delay(3), Duration::from_secs(12));
    }

    #[test]
    fn test_chunk_delay_clamped() {
        assert_eq!(Config::new().with_chunk_delay_ms(50).chunk_delay_ms, 1_000);
        assert_eq!(Config::new().with_chunk_delay_ms(60_000).chunk_delay_ms, 10_000);
        assert_eq!(Config::new().with_chunk_delay_ms(2_500).chunk_delay_ms, 2_500);
    }

    #[test]
    fn test_fast_preset() {
        let config = Config::fast();
        assert!(!config.adaptive_delay);
        assert_eq!(config.chunk_delay_ms, config.min_chunk_delay_ms);
    }
}
