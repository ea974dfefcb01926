//! 에러 타입 정의
//!
//! 어떤 에러도 프로세스 단위로 전파되지 않는다. 전송 계층 에러는 청크 단위로
//! 재시도되고, 프로토콜/무결성 에러는 해당 패킷 또는 해당 전송만 폐기한다.

use thiserror::Error;

use crate::frame::TransferId;

/// Meshsend 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    /// 단일 전송 시도 실패
    #[error("전송 계층 에러: {0}")]
    Transport(String),

    #[error("청크 {chunk_index} 전송 실패: {attempts}회 시도 후 포기")]
    RetriesExhausted { chunk_index: u8, attempts: u32 },

    #[error("패킷이 너무 짧음: {len} bytes (헤더 {min} bytes 필요)")]
    PacketTooShort { len: usize, min: usize },

    #[error("유효하지 않은 total_chunks: 0")]
    InvalidTotalChunks,

    #[error("유효하지 않은 청크 인덱스: {index} >= {total}")]
    InvalidChunkIndex { index: u8, total: u8 },

    #[error("비현실적인 전체 크기: {size} bytes (최대 {max})")]
    TotalSizeTooLarge { size: u32, max: u32 },

    #[error("청크 수 불일치: transfer={transfer_id:08x}, expected {expected}, got {got}")]
    ChunkCountMismatch {
        transfer_id: TransferId,
        expected: u8,
        got: u8,
    },

    #[error("빈 페이로드는 전송할 수 없음")]
    EmptyPayload,

    #[error("페이로드가 너무 큼: {size} bytes (최대 {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("청크가 너무 많음: {needed}개 필요 (최대 {max})")]
    TooManyChunks { needed: usize, max: usize },

    #[error("CRC 불일치: expected {expected:08x}, got {got:08x}")]
    CrcMismatch { expected: u32, got: u32 },

    #[error("조립 크기 불일치: expected {expected}, got {got}")]
    SizeMismatch { expected: u32, got: usize },

    #[error("압축 해제 실패: {0}")]
    Decompression(String),

    #[error("전송 타임아웃: transfer={transfer_id:08x}, missing_chunks={missing_count}")]
    StallTimeout {
        transfer_id: TransferId,
        missing_count: usize,
    },

    #[error("잘못된 제어 메시지: {0}")]
    InvalidControl(String),

    #[error("알 수 없는 노드: {0}")]
    UnknownPeer(String),

    #[error("패킷이 MTU 초과: {len} bytes (MTU {mtu})")]
    PacketTooLarge { len: usize, mtu: usize },

    #[error("페이로드 싱크 에러: {0}")]
    Sink(String),

    #[error("채널 종료")]
    ChannelClosed,
}

impl Error {
    /// 단일 패킷만 폐기하면 되는 프로토콜 에러인지 여부
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::PacketTooShort { .. }
                | Error::InvalidTotalChunks
                | Error::InvalidChunkIndex { .. }
                | Error::TotalSizeTooLarge { .. }
                | Error::ChunkCountMismatch { .. }
                | Error::InvalidControl(_)
        )
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
