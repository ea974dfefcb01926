//! # meshsend
//!
//! 손실이 많은 저대역 패킷 라디오 메시용 신뢰성 이미지 전송 프로토콜
//!
//! ## 핵심 특징
//! - **MTU 단위 분할**: 15바이트 헤더 + 페이로드 조각 (기본 200바이트 데이터그램)
//! - **청크 재시도**: 전송 계층 실패 시 지수 백오프
//! - **적응형 간격**: 최근 성공률로 청크 간 대기 시간 조정
//! - **선택적 재전송**: 수신자가 누락 청크만 REQ로 요청, OK로 완료 확인
//! - **무결성**: 전송 스트림 전체 CRC32, 필요 시 zlib 압축
//! - **정체 감시**: 전송 크기에 비례하는 만료 타임아웃

pub mod compression;
pub mod config;
pub mod control;
pub mod error;
pub mod frame;
pub mod monitor;
pub mod node;
pub mod pacing;
pub mod payload;
pub mod receiver;
pub mod sender;
pub mod stats;
pub mod transport;
pub mod udp;

pub use config::Config;
pub use control::{ControlInbox, ControlMessage};
pub use error::{Error, Result};
pub use frame::{Chunk, ChunkIndex, FrameBuilder, TransferHeader, TransferId};
pub use monitor::{MonitorHandle, StallMonitor};
pub use node::{AppMessage, MeshNode};
pub use payload::{ChannelSink, Delivery, DirectorySink, PayloadSink};
pub use receiver::Receiver;
pub use sender::{SendOutcome, SendReport, Sender};
pub use stats::{SendStats, TransferProgress, TransferStatus};
pub use transport::{InboundPacket, MemoryMesh, NodeId, TransferKey, Transport};
pub use udp::UdpTransport;

/// 청크 헤더 크기 (바이트)
pub const HEADER_SIZE: usize = 15;

/// 기본 청크 크기 = 메시 데이터그램 MTU (바이트)
pub const DEFAULT_CHUNK_SIZE: usize = 200;

/// 전송 가능한 최대 페이로드 (10MB)
pub const MAX_PAYLOAD_SIZE: usize = 10_000_000;

/// 전송당 최대 청크 수 (u8 인덱스)
pub const MAX_CHUNKS: usize = 255;
