//! 수신자
//!
//! - (송신 노드, 전송 ID) 단위 청크 재조립
//! - 압축 해제 전 CRC 검증
//! - 완료된 전송의 중복 수신은 보존 기간 동안 OK 재전송으로만 응답
//!
//! 수신 패킷 처리와 정체 검사가 동시에 상태를 건드리므로 전송 기록과 완료 캐시는
//! 하나의 뮤텍스 뒤에 둔다. 락은 `.await` 전에 항상 해제한다.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::compression;
use crate::control::ControlMessage;
use crate::frame::{Chunk, ChunkIndex, TransferHeader, TransferId};
use crate::monitor::adaptive_timeout;
use crate::payload::{Delivery, PayloadSink};
use crate::stats::{TransferProgress, TransferStatus};
use crate::transport::{NodeId, TransferKey, Transport};
use crate::{Config, Error};

/// 수신 중인 전송 기록
#[derive(Debug)]
struct TransferRecord {
    /// 인덱스 순 청크 슬롯
    chunks: Vec<Option<Bytes>>,

    /// 누적 수신 바이트 (중복 제외)
    bytes: usize,

    /// 헤더에 선언된 전체 크기
    total_size: u32,

    crc32: u32,
    compressed: bool,
    created_at: Instant,

    /// 마지막 갱신 (청크 수신 또는 재전송 요청)
    last_update: Instant,

    /// 마지막 청크 수신
    last_chunk_at: Instant,

    status: TransferStatus,
}

impl TransferRecord {
    fn new(header: &TransferHeader, now: Instant) -> Self {
        Self {
            chunks: vec![None; header.total_chunks as usize],
            bytes: 0,
            total_size: header.total_size,
            crc32: header.crc32,
            compressed: header.compressed,
            created_at: now,
            last_update: now,
            last_chunk_at: now,
            status: TransferStatus::Active,
        }
    }

    fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    fn received_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    fn missing(&self) -> Vec<ChunkIndex> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_none())
            .map(|(idx, _)| idx as ChunkIndex)
            .collect()
    }

    fn is_complete(&self) -> bool {
        self.chunks.iter().all(Option::is_some)
    }

    /// 인덱스 순으로 이어붙이기
    fn assemble(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.bytes);
        for chunk in self.chunks.iter().flatten() {
            buf.extend_from_slice(chunk);
        }
        buf.freeze()
    }

    fn progress(&self, key: &TransferKey, now: Instant) -> TransferProgress {
        TransferProgress {
            sender: key.node.clone(),
            transfer_id: key.transfer_id,
            received_chunks: self.received_count(),
            total_chunks: self.total_chunks(),
            bytes: self.bytes,
            total_bytes: self.total_size,
            elapsed: now.saturating_duration_since(self.created_at),
            status: self.status,
        }
    }
}

/// 완료 캐시 항목
#[derive(Debug, Clone, Copy)]
struct CompletedEntry {
    at: Instant,

    /// 싱크 처리가 끝나 OK를 보낸 전송
    confirmed: bool,
}

/// 청크 하나를 처리한 결과
#[derive(Debug)]
enum ChunkOutcome {
    /// 헤더가 기존 기록과 맞지 않아 패킷만 폐기
    Rejected(Error),

    /// 보존 기간 내의 완료된 전송
    AlreadyCompleted,

    /// 재조립은 끝났고 싱크 처리 중
    Delivering,

    Stored {
        received: usize,
        total: usize,
        duplicate: bool,
    },

    /// 무결성/압축 해제 실패로 전송 전체 폐기
    Discarded(Error),

    Completed(Delivery),
}

/// 만료된 전송
#[derive(Debug, Clone)]
pub struct ExpiredTransfer {
    pub key: TransferKey,
    pub received: usize,
    pub total: usize,
    pub missing: Vec<ChunkIndex>,
    pub idle: Duration,
}

/// 정체 검사 결과
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// 보낼 재전송 요청 (대상 노드, 메시지)
    pub requests: Vec<(NodeId, ControlMessage)>,

    pub expired: Vec<ExpiredTransfer>,
}

/// 수신 상태 (전송 기록 + 완료 캐시)
#[derive(Debug, Default)]
struct ReceiverState {
    transfers: HashMap<TransferKey, TransferRecord>,
    completed: HashMap<TransferKey, CompletedEntry>,
}

impl ReceiverState {
    fn accept(&mut self, from: &str, chunk: Chunk, now: Instant, config: &Config) -> ChunkOutcome {
        let header = chunk.header;
        if let Err(e) = header.validate() {
            return ChunkOutcome::Rejected(e);
        }
        let key = TransferKey::new(from, header.transfer_id);

        if let Some(entry) = self.completed.get(&key) {
            if now.saturating_duration_since(entry.at) < config.completed_retention() {
                return if entry.confirmed {
                    ChunkOutcome::AlreadyCompleted
                } else {
                    ChunkOutcome::Delivering
                };
            }
            self.completed.remove(&key);
        }

        // 처리하는 동안 맵에서 꺼내 두고, 미완료면 다시 넣는다
        let mut record = match self.transfers.remove(&key) {
            Some(record) => record,
            None => {
                self.discard_previous(from);
                info!(
                    "새 전송 수신: {} ({} bytes{}, {} 청크, CRC {:08x})",
                    key,
                    header.total_size,
                    if header.compressed { ", 압축" } else { "" },
                    header.total_chunks,
                    header.crc32
                );
                TransferRecord::new(&header, now)
            }
        };

        if record.total_chunks() != header.total_chunks as usize {
            let expected = record.total_chunks() as u8;
            self.transfers.insert(key, record);
            return ChunkOutcome::Rejected(Error::ChunkCountMismatch {
                transfer_id: header.transfer_id,
                expected,
                got: header.total_chunks,
            });
        }

        // 재전송을 위해 덮어쓰기 허용
        let new_len = chunk.payload.len();
        let previous = record.chunks[header.chunk_index as usize].replace(chunk.payload);
        let duplicate = previous.is_some();
        record.bytes = record.bytes - previous.map_or(0, |p| p.len()) + new_len;
        record.last_update = now;
        record.last_chunk_at = now;
        record.status = TransferStatus::Active;

        if !record.is_complete() {
            let outcome = ChunkOutcome::Stored {
                received: record.received_count(),
                total: record.total_chunks(),
                duplicate,
            };
            self.transfers.insert(key, record);
            return outcome;
        }

        match verify(&record) {
            Ok(data) => {
                self.completed.insert(
                    key.clone(),
                    CompletedEntry {
                        at: now,
                        confirmed: false,
                    },
                );
                ChunkOutcome::Completed(Delivery {
                    from: key.node,
                    transfer_id: key.transfer_id,
                    data,
                    compressed: record.compressed,
                    elapsed: now.saturating_duration_since(record.created_at),
                })
            }
            Err(e) => ChunkOutcome::Discarded(e),
        }
    }

    /// 송신자당 하나의 전송만 유지
    fn discard_previous(&mut self, from: &str) {
        self.transfers.retain(|old, record| {
            if old.node != from {
                return true;
            }
            warn!(
                "이전 전송 폐기: {} ({}/{} 청크)",
                old,
                record.received_count(),
                record.total_chunks()
            );
            false
        });
    }

    fn sweep(&mut self, now: Instant, config: &Config) -> SweepReport {
        let mut report = SweepReport::default();
        let request_after = config.stall_request_timeout();
        let stalled_after = Duration::from_millis(config.transfer_timeout_ms);

        self.transfers.retain(|key, record| {
            let missing = record.missing();

            if now.saturating_duration_since(record.last_update) > request_after
                && !missing.is_empty()
            {
                report.requests.extend(
                    ControlMessage::requests(key.transfer_id, &missing, config.max_text_len)
                        .into_iter()
                        .map(|msg| (key.node.clone(), msg)),
                );
                // 요청 폭주 방지
                record.last_update = now;
            }

            let idle = now.saturating_duration_since(record.last_chunk_at);
            if idle > adaptive_timeout(record.total_chunks(), config) {
                report.expired.push(ExpiredTransfer {
                    key: key.clone(),
                    received: record.received_count(),
                    total: record.total_chunks(),
                    missing,
                    idle,
                });
                return false;
            }

            if idle > stalled_after {
                record.status = TransferStatus::Timeout;
            }
            true
        });

        let retention = config.completed_retention();
        self.completed
            .retain(|_, entry| now.saturating_duration_since(entry.at) < retention);

        report
    }
}

/// CRC 검증 후 필요하면 압축 해제
fn verify(record: &TransferRecord) -> crate::Result<Bytes> {
    let assembled = record.assemble();

    let crc = crc32fast::hash(&assembled);
    if crc != record.crc32 {
        return Err(Error::CrcMismatch {
            expected: record.crc32,
            got: crc,
        });
    }
    if assembled.len() != record.total_size as usize {
        return Err(Error::SizeMismatch {
            expected: record.total_size,
            got: assembled.len(),
        });
    }

    if record.compressed {
        Ok(Bytes::from(compression::decompress(&assembled)?))
    } else {
        Ok(assembled)
    }
}

/// 수신자
pub struct Receiver {
    config: Config,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn PayloadSink>,
    state: Mutex<ReceiverState>,
}

impl Receiver {
    pub fn new(config: Config, transport: Arc<dyn Transport>, sink: Arc<dyn PayloadSink>) -> Self {
        Self {
            config,
            transport,
            sink,
            state: Mutex::new(ReceiverState::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 데이터그램 수신. 잘못된 헤더는 로그만 남기고 폐기
    pub async fn on_datagram(&self, from: &str, datagram: &[u8]) {
        match Chunk::from_bytes(datagram) {
            Ok(chunk) => self.on_chunk(from, chunk).await,
            Err(e) => warn!("잘못된 패킷 폐기 (from {}): {}", from, e),
        }
    }

    pub async fn on_chunk(&self, from: &str, chunk: Chunk) {
        let transfer_id = chunk.header.transfer_id;
        let chunk_index = chunk.header.chunk_index;
        let len = chunk.payload.len();

        let outcome = {
            let mut state = self.state.lock();
            state.accept(from, chunk, Instant::now(), &self.config)
        };

        match outcome {
            ChunkOutcome::Rejected(e) => {
                warn!("패킷 폐기 (from {}): {}", from, e);
            }
            ChunkOutcome::AlreadyCompleted => {
                debug!(
                    "완료된 전송의 청크 재수신: {}/{:08x}, OK 재전송",
                    from, transfer_id
                );
                self.send_ok(from, transfer_id, 1).await;
            }
            ChunkOutcome::Stored {
                received,
                total,
                duplicate,
            } => {
                if duplicate {
                    debug!(
                        "[RETRY] 청크 {}/{} ({} bytes) from {}",
                        chunk_index,
                        total - 1,
                        len,
                        from
                    );
                } else {
                    debug!(
                        "[RCV] 청크 {}/{} ({} bytes), {}/{} 수신",
                        chunk_index,
                        total - 1,
                        len,
                        received,
                        total
                    );
                }
            }
            ChunkOutcome::Delivering => {
                debug!(
                    "처리 중인 전송의 청크 무시: {}/{:08x}",
                    from, transfer_id
                );
            }
            ChunkOutcome::Discarded(e) => {
                warn!("전송 폐기 {}/{:08x}: {}", from, transfer_id, e);
            }
            ChunkOutcome::Completed(delivery) => {
                self.finish(delivery).await;
            }
        }
    }

    async fn finish(&self, delivery: Delivery) {
        let from = delivery.from.clone();
        let transfer_id = delivery.transfer_id;
        let size = delivery.data.len();
        let elapsed = delivery.elapsed;

        let key = TransferKey::new(from.clone(), transfer_id);
        if let Err(e) = self.sink.deliver(delivery).await {
            warn!("페이로드 처리 실패 {}: {}", key, e);
            self.state.lock().completed.remove(&key);
            return;
        }
        if let Some(entry) = self.state.lock().completed.get_mut(&key) {
            entry.confirmed = true;
        }

        info!(
            "[SUCCESS] {}: {} bytes, {:.1}s",
            key,
            size,
            elapsed.as_secs_f64()
        );

        // 제어 채널은 확인 응답이 없으므로 여러 번 보낸다
        self.send_ok(&from, transfer_id, self.config.completion_repeats)
            .await;
    }

    async fn send_ok(&self, to: &str, transfer_id: TransferId, repeats: u32) {
        let text = ControlMessage::Ok { transfer_id }.to_string();
        let interval = Duration::from_millis(self.config.completion_repeat_interval_ms);

        for i in 0..repeats {
            if i > 0 {
                tokio::time::sleep(interval).await;
            }
            if let Err(e) = self.transport.send_text(&text, to).await {
                warn!("OK 전송 실패 ({}): {}", to, e);
            }
        }
    }

    /// 정체 전송 검사: 누락 청크 요청 전송 및 만료 전송 정리
    pub async fn check_stalled(&self) -> SweepReport {
        let report = {
            let mut state = self.state.lock();
            state.sweep(Instant::now(), &self.config)
        };

        for expired in &report.expired {
            let err = Error::StallTimeout {
                transfer_id: expired.key.transfer_id,
                missing_count: expired.missing.len(),
            };
            warn!(
                "{} 만료 ({:.0}s 동안 데이터 없음): {}/{} 청크 수신, {}",
                expired.key,
                expired.idle.as_secs_f64(),
                expired.received,
                expired.total,
                err
            );
            if !expired.missing.is_empty() {
                let shown: Vec<_> = expired.missing.iter().take(20).collect();
                warn!(
                    "누락 청크: {:?}{}",
                    shown,
                    if expired.missing.len() > 20 { " ..." } else { "" }
                );
            }
        }

        for (node, msg) in &report.requests {
            if let ControlMessage::Req { chunks, .. } = msg {
                info!("[REQ] {}에 누락 청크 {}개 요청", node, chunks.len());
            }
            if let Err(e) = self.transport.send_text(&msg.to_string(), node).await {
                warn!("재전송 요청 실패 ({}): {}", node, e);
            }
        }

        report
    }

    /// 수신 중인 전송 진행 상황
    pub fn progress(&self) -> Vec<TransferProgress> {
        let now = Instant::now();
        let state = self.state.lock();
        let mut list: Vec<_> = state
            .transfers
            .iter()
            .map(|(key, record)| record.progress(key, now))
            .collect();
        list.sort_by(|a, b| a.sender.cmp(&b.sender));
        list
    }

    /// 수신 중인 전송 수
    pub fn active_transfers(&self) -> usize {
        self.state.lock().transfers.len()
    }

    /// 보존 기간 내 완료(OK 송신) 기록 여부
    pub fn is_completed(&self, from: &str, transfer_id: TransferId) -> bool {
        self.state
            .lock()
            .completed
            .get(&TransferKey::new(from, transfer_id))
            .map_or(false, |entry| entry.confirmed)
    }
}
