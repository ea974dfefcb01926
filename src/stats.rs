//! 전송 통계

use std::time::Duration;

use tokio::time::Instant;

use crate::frame::TransferId;
use crate::transport::NodeId;

/// 송신 통계 (send 호출 하나)
#[derive(Debug, Clone)]
pub struct SendStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 총 청크 수
    pub total_chunks: usize,

    /// 초기 전송에서 성공한 청크 수
    pub sent_chunks: usize,

    /// 실패한 전송 시도 수
    pub failed_attempts: u64,

    /// 재시도 수 (재전송 요청 응답 포함)
    pub retries: u64,

    /// REQ에 응답해 다시 보낸 청크 수
    pub resent_chunks: u64,

    /// 실제 전송 바이트 (압축 후)
    pub total_bytes: usize,

    /// 원본 크기
    pub original_bytes: usize,

    /// 압축 사용 여부
    pub compressed: bool,

    /// 종료 시점의 청크 간격
    pub final_delay: Duration,

    /// 수신자가 ACK한 청크 수
    pub acked_chunks: usize,
}

impl SendStats {
    pub fn new(total_chunks: usize, total_bytes: usize, original_bytes: usize, compressed: bool) -> Self {
        Self {
            start_time: Instant::now(),
            total_chunks,
            sent_chunks: 0,
            failed_attempts: 0,
            retries: 0,
            resent_chunks: 0,
            total_bytes,
            original_bytes,
            compressed,
            final_delay: Duration::ZERO,
            acked_chunks: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 평균 속도 (bytes/sec)
    pub fn average_speed(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.total_bytes as f64 / elapsed
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Chunks: {} | Size: {} bytes (원본 {}{}) | Time: {:.1}s | Speed: {:.2} B/s | Retries: {} | Resent: {} | Delay: {:.2}s",
            self.total_chunks,
            self.total_bytes,
            self.original_bytes,
            if self.compressed { ", 압축" } else { "" },
            self.elapsed().as_secs_f64(),
            self.average_speed(),
            self.retries,
            self.resent_chunks,
            self.final_delay.as_secs_f64(),
        )
    }
}

/// 수신 전송 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Active,
    /// 오래 갱신이 없어 정체된 상태 (만료 전)
    Timeout,
}

/// 수신 중인 전송의 진행 상황 스냅샷
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub sender: NodeId,
    pub transfer_id: TransferId,
    pub received_chunks: usize,
    pub total_chunks: usize,
    pub bytes: usize,
    pub total_bytes: u32,
    pub elapsed: Duration,
    pub status: TransferStatus,
}

impl TransferProgress {
    pub fn percent(&self) -> u8 {
        if self.total_chunks == 0 {
            return 0;
        }
        (self.received_chunks * 100 / self.total_chunks) as u8
    }

    pub fn bytes_per_sec(&self) -> f64 {
        let elapsed = self.elapsed.as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.bytes as f64 / elapsed
    }

    pub fn summary(&self) -> String {
        let speed = match self.status {
            TransferStatus::Active => format!("{:.1} B/s", self.bytes_per_sec()),
            TransferStatus::Timeout => "Stalled".to_string(),
        };
        format!(
            "{} ({:08x}): {}% | Chunks: {}/{} | Data: {:.1}KB/{:.1}KB | {} | {:.1}s",
            self.sender,
            self.transfer_id,
            self.percent(),
            self.received_chunks,
            self.total_chunks,
            self.bytes as f64 / 1024.0,
            self.total_bytes as f64 / 1024.0,
            speed,
            self.elapsed.as_secs_f64(),
        )
    }
}
