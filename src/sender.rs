//! 송신자
//!
//! - 청크 단위 재시도 (지수 백오프)
//! - 성공률 기반 적응형 전송 간격
//! - 수신자의 REQ에 따른 선택적 재전송, OK 수신 시 완료
//!
//! 같은 목적지로의 송신은 한 번에 하나만 진행된다.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::compression::encode_payload;
use crate::control::ControlInbox;
use crate::frame::{Chunk, ChunkIndex, FrameBuilder, TransferId};
use crate::pacing::AdaptivePacer;
use crate::stats::SendStats;
use crate::transport::{NodeId, TransferKey, Transport};
use crate::{Config, Error, Result, MAX_PAYLOAD_SIZE};

/// 송신 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// 수신자가 OK로 완료를 확인
    Completed,

    /// 대기 라운드 소진 (수신 여부 불명)
    Incomplete,
}

/// 송신 보고서
#[derive(Debug, Clone)]
pub struct SendReport {
    pub transfer_id: TransferId,
    pub outcome: SendOutcome,
    pub stats: SendStats,
}

/// 송신자
pub struct Sender {
    /// 설정
    config: Config,

    /// 메시 전송 계층
    transport: Arc<dyn Transport>,

    /// 수신자 제어 메시지 수신함
    inbox: Arc<ControlInbox>,

    /// 청크 분할기
    builder: FrameBuilder,

    /// 목적지별 송신 직렬화 락
    destinations: DashMap<NodeId, Arc<AsyncMutex<()>>>,

    /// 마지막으로 발급한 전송 ID
    last_transfer_id: AtomicU32,
}

impl Sender {
    /// 새 송신자 생성
    pub fn new(config: Config, transport: Arc<dyn Transport>, inbox: Arc<ControlInbox>) -> Self {
        let builder = FrameBuilder::new(config.chunk_size);
        Self {
            config,
            transport,
            inbox,
            builder,
            destinations: DashMap::new(),
            last_transfer_id: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn inbox(&self) -> &Arc<ControlInbox> {
        &self.inbox
    }

    /// 밀리초 타임스탬프 기반 전송 ID (인스턴스 내에서 단조 증가)
    fn next_transfer_id(&self) -> TransferId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u32;
        let next = |last: u32| if now > last { now } else { last.wrapping_add(1) };

        match self
            .last_transfer_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(next(last)))
        {
            Ok(prev) | Err(prev) => next(prev),
        }
    }

    /// 페이로드를 `destination`으로 전송
    ///
    /// 초기 전송 중 청크 하나라도 재시도를 모두 소진하면 에러로 중단한다.
    /// 대기 라운드 안에 OK를 받지 못하면 `SendOutcome::Incomplete`.
    pub async fn send(&self, destination: &str, payload: Bytes) -> Result<SendReport> {
        if payload.is_empty() {
            return Err(Error::EmptyPayload);
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let lock = self
            .destinations
            .entry(destination.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        let original_size = payload.len();
        let original_crc = crc32fast::hash(&payload);
        let encoded = encode_payload(payload, &self.config);
        let crc = crc32fast::hash(&encoded.data);

        let transfer_id = self.next_transfer_id();
        let chunks = self
            .builder
            .split(transfer_id, &encoded.data, encoded.compressed, crc)?;

        info!(
            "전송 시작 -> {}: ID {:08x}, {} bytes (원본 {}, CRC {:08x}), {} 청크",
            destination,
            transfer_id,
            encoded.data.len(),
            original_size,
            original_crc,
            chunks.len()
        );

        let mut stats = SendStats::new(
            chunks.len(),
            encoded.data.len(),
            original_size,
            encoded.compressed,
        );

        let key = TransferKey::new(destination, transfer_id);
        let notify = self.inbox.register(key.clone());
        let result = self
            .transmit(destination, &key, &chunks, &notify, &mut stats)
            .await;
        self.inbox.forget(&key);

        let outcome = result?;
        match outcome {
            SendOutcome::Completed => info!("[COMPLETE] {} | {}", key, stats.summary()),
            SendOutcome::Incomplete => warn!("[INCOMPLETE] {} | {}", key, stats.summary()),
        }

        Ok(SendReport {
            transfer_id,
            outcome,
            stats,
        })
    }

    async fn transmit(
        &self,
        destination: &str,
        key: &TransferKey,
        chunks: &[Chunk],
        notify: &Notify,
        stats: &mut SendStats,
    ) -> Result<SendOutcome> {
        let mut pacer = AdaptivePacer::new(&self.config);

        for (i, chunk) in chunks.iter().enumerate() {
            if let Err(e) = self.send_chunk(destination, chunk, &mut pacer, stats).await {
                warn!("전송 중단 {}: {}", key, e);
                return Err(e);
            }
            stats.sent_chunks += 1;

            if i > 0 {
                pacer.adjust();
            }

            if i + 1 < chunks.len() {
                sleep(pacer.current_delay()).await;
            }
        }

        info!("초기 전송 완료 {}: {} 청크, 응답 대기", key, chunks.len());

        let outcome = self
            .await_completion(destination, key, chunks, notify, &mut pacer, stats)
            .await;
        stats.final_delay = pacer.current_delay();
        Ok(outcome)
    }

    /// 청크 하나를 재시도 포함 전송
    async fn send_chunk(
        &self,
        destination: &str,
        chunk: &Chunk,
        pacer: &mut AdaptivePacer,
        stats: &mut SendStats,
    ) -> Result<()> {
        let datagram = chunk.to_bytes();
        let index = chunk.header.chunk_index;
        let last = chunk.header.total_chunks.saturating_sub(1);
        let attempts = self.config.max_retries;

        for attempt in 1..=attempts {
            match self
                .transport
                .send_data(datagram.clone(), destination, true)
                .await
            {
                Ok(()) => {
                    pacer.record_success();
                    debug!(
                        "[SEND] 청크 {}/{} ({} bytes) -> {}",
                        index,
                        last,
                        chunk.payload.len(),
                        destination
                    );
                    return Ok(());
                }
                Err(e) => {
                    pacer.record_failure();
                    stats.failed_attempts += 1;

                    if attempt == attempts {
                        warn!("청크 {} 전송 실패 (시도 {}/{}): {}", index, attempt, attempts, e);
                        break;
                    }

                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        "청크 {} 전송 실패 (시도 {}/{}): {}, {:.1}s 후 재시도",
                        index,
                        attempt,
                        attempts,
                        e,
                        delay.as_secs_f64()
                    );
                    stats.retries += 1;
                    sleep(delay).await;
                }
            }
        }

        Err(Error::RetriesExhausted {
            chunk_index: index,
            attempts,
        })
    }

    /// 수신자 응답 대기. OK면 완료, REQ면 요청 청크 재전송
    ///
    /// `wait_rounds`는 대기 횟수를 제한한다. 재전송 한 번은 라운드 하나를 쓰고,
    /// 끝난 뒤에는 마지막 라운드였더라도 한 라운드를 온전히 기다린다.
    async fn await_completion(
        &self,
        destination: &str,
        key: &TransferKey,
        chunks: &[Chunk],
        notify: &Notify,
        pacer: &mut AdaptivePacer,
        stats: &mut SendStats,
    ) -> SendOutcome {
        let rounds = self.config.wait_rounds;
        if rounds == 0 {
            return SendOutcome::Incomplete;
        }

        let round_len = self.config.wait_round_interval();
        let mut round = 1;
        let mut round_end = Instant::now() + round_len;

        loop {
            let events = self.inbox.take(key);

            if events.acked > stats.acked_chunks {
                stats.acked_chunks = events.acked;
                info!("[ACK] {}: {}/{} 청크 확인", key, events.acked, chunks.len());
            }

            if events.completed {
                info!("[OK] {} 수신 완료 확인", key);
                return SendOutcome::Completed;
            }

            if !events.requested.is_empty() {
                self.resend(destination, key, chunks, &events.requested, pacer, stats)
                    .await;
                // 재전송에 걸린 시간과 무관하게 새 라운드 동안 응답을 기다린다
                round += 1;
                round_end = Instant::now() + round_len;
                debug!("{} 재전송 후 대기 라운드 {}/{}", key, round.min(rounds), rounds);
                continue;
            }

            if Instant::now() >= round_end {
                if round >= rounds {
                    warn!("{} 응답 없음: 대기 라운드 {}회 소진", key, rounds);
                    return SendOutcome::Incomplete;
                }
                round += 1;
                round_end += round_len;
                debug!("{} 응답 대기 라운드 {}/{}", key, round, rounds);
            }

            let _ = timeout_at(round_end, notify.notified()).await;
        }
    }

    async fn resend(
        &self,
        destination: &str,
        key: &TransferKey,
        chunks: &[Chunk],
        requested: &[ChunkIndex],
        pacer: &mut AdaptivePacer,
        stats: &mut SendStats,
    ) {
        let valid: Vec<&Chunk> = requested
            .iter()
            .filter_map(|&idx| {
                let chunk = chunks.get(idx as usize);
                if chunk.is_none() {
                    warn!("{}: 범위 밖 청크 요청 무시 ({})", key, idx);
                }
                chunk
            })
            .collect();

        info!("[REQ] {}: 청크 {}개 재전송 {:?}", key, valid.len(), requested);

        for (i, chunk) in valid.iter().enumerate() {
            stats.retries += 1;
            match self.send_chunk(destination, chunk, pacer, stats).await {
                Ok(()) => stats.resent_chunks += 1,
                Err(e) => warn!("{}: 재전송 실패: {}", key, e),
            }
            if i + 1 < valid.len() {
                sleep(pacer.current_delay()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlMessage;
    use crate::transport::{InboundPacket, MemoryMesh};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn setup(config: Config) -> (Arc<MemoryMesh>, Sender, mpsc::UnboundedReceiver<InboundPacket>) {
        let mesh = MemoryMesh::new();
        let (tx_transport, _tx_inbox) = mesh.join("!tx");
        let (_rx_transport, rx_inbox) = mesh.join("!rx");
        let sender = Sender::new(config, Arc::new(tx_transport), Arc::new(ControlInbox::new()));
        (mesh, sender, rx_inbox)
    }

    async fn next_chunk(rx: &mut mpsc::UnboundedReceiver<InboundPacket>) -> Chunk {
        loop {
            if let Some(InboundPacket::Data { payload, .. }) = rx.recv().await {
                return Chunk::from_bytes(&payload).unwrap();
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_on_ok() {
        let (_mesh, sender, mut rx) = setup(Config::fast());
        let inbox = sender.inbox().clone();

        let responder = tokio::spawn(async move {
            let first = next_chunk(&mut rx).await;
            for _ in 1..first.header.total_chunks {
                next_chunk(&mut rx).await;
            }
            inbox.record(
                "!rx",
                ControlMessage::Ok {
                    transfer_id: first.header.transfer_id,
                },
            );
        });

        let report = sender
            .send("!rx", Bytes::from(vec![0x5a; 480]))
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(report.outcome, SendOutcome::Completed);
        assert_eq!(report.stats.total_chunks, 3);
        assert_eq!(report.stats.sent_chunks, 3);
        assert_eq!(report.stats.retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_aborts() {
        let (mesh, sender, _rx) = setup(Config::fast());
        mesh.fail_next_sends(3);

        let start = Instant::now();
        let result = sender.send("!rx", Bytes::from_static(b"abc")).await;

        assert!(matches!(
            result,
            Err(Error::RetriesExhausted {
                chunk_index: 0,
                attempts: 3
            })
        ));
        assert!(mesh.sent().is_empty());
        // 3s + 6s 백오프
        assert_eq!(start.elapsed(), Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers() {
        let config = Config {
            wait_rounds: 1,
            ..Config::fast()
        };
        let (mesh, sender, _rx) = setup(config);
        mesh.fail_next_sends(2);

        let report = sender
            .send("!rx", Bytes::from_static(b"hello mesh"))
            .await
            .unwrap();

        assert_eq!(report.outcome, SendOutcome::Incomplete);
        assert_eq!(report.stats.retries, 2);
        assert_eq!(report.stats.failed_attempts, 2);
        assert_eq!(mesh.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resends_requested_chunks() {
        let (_mesh, sender, mut rx) = setup(Config::fast());
        let inbox = sender.inbox().clone();

        let responder = tokio::spawn(async move {
            let first = next_chunk(&mut rx).await;
            let transfer_id = first.header.transfer_id;
            for _ in 1..first.header.total_chunks {
                next_chunk(&mut rx).await;
            }

            inbox.record(
                "!rx",
                ControlMessage::Req {
                    transfer_id,
                    chunks: vec![1, 200],
                },
            );
            let resent = next_chunk(&mut rx).await;
            inbox.record("!rx", ControlMessage::Ok { transfer_id });
            resent
        });

        let start = Instant::now();
        let report = sender
            .send("!rx", Bytes::from(vec![1u8; 400]))
            .await
            .unwrap();
        let resent = responder.await.unwrap();

        assert_eq!(report.outcome, SendOutcome::Completed);
        assert_eq!(resent.header.chunk_index, 1);
        assert_eq!(report.stats.resent_chunks, 1);
        // 첫 라운드 안에 완료
        assert!(start.elapsed() < Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_full_round_after_long_resend() {
        // 11 청크, 10s 간격: 재전송 6개에 50s가 걸려 대기 예산 45s를 넘는다
        let config = Config {
            chunk_delay_ms: 10_000,
            adaptive_delay: false,
            compress_payload: false,
            wait_rounds: 3,
            ..Config::default()
        };
        let (_mesh, sender, mut rx) = setup(config);
        let inbox = sender.inbox().clone();

        let responder = tokio::spawn(async move {
            let first = next_chunk(&mut rx).await;
            let transfer_id = first.header.transfer_id;
            for _ in 1..first.header.total_chunks {
                next_chunk(&mut rx).await;
            }

            sleep(Duration::from_secs(1)).await;
            inbox.record(
                "!rx",
                ControlMessage::Req {
                    transfer_id,
                    chunks: (0..6).collect(),
                },
            );
            for _ in 0..6 {
                next_chunk(&mut rx).await;
            }

            sleep(Duration::from_secs(1)).await;
            inbox.record("!rx", ControlMessage::Ok { transfer_id });
        });

        let report = sender
            .send("!rx", Bytes::from(vec![7u8; 2000]))
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(report.stats.total_chunks, 11);
        assert_eq!(report.stats.resent_chunks, 6);
        assert_eq!(report.outcome, SendOutcome::Completed);
    }

    fn data_transfer_ids(mesh: &MemoryMesh) -> Vec<TransferId> {
        mesh.sent()
            .iter()
            .filter_map(|p| match &p.packet {
                InboundPacket::Data { payload, .. } => {
                    Some(Chunk::from_bytes(payload).unwrap().header.transfer_id)
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_to_same_destination_are_serialized() {
        let config = Config {
            wait_rounds: 1,
            compress_payload: false,
            ..Config::fast()
        };
        let (mesh, sender, _rx) = setup(config);
        let payload = Bytes::from(vec![3u8; 600]);

        let start = Instant::now();
        let (a, b) = tokio::join!(
            sender.send("!rx", payload.clone()),
            sender.send("!rx", payload)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.transfer_id, b.transfer_id);

        // 4 청크씩, 한 전송이 대기까지 끝난 뒤 다음 전송 시작
        let ids = data_transfer_ids(&mesh);
        assert_eq!(ids.len(), 8);
        assert!(ids[..4].iter().all(|&id| id == ids[0]));
        assert!(ids[4..].iter().all(|&id| id != ids[0]));
        assert_eq!(start.elapsed(), Duration::from_secs(36));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_to_different_destinations_overlap() {
        let config = Config {
            wait_rounds: 1,
            compress_payload: false,
            ..Config::fast()
        };
        let mesh = MemoryMesh::new();
        let (tx_transport, _tx_inbox) = mesh.join("!tx");
        let (_a, _a_inbox) = mesh.join("!a");
        let (_b, _b_inbox) = mesh.join("!b");
        let sender = Sender::new(config, Arc::new(tx_transport), Arc::new(ControlInbox::new()));
        let payload = Bytes::from(vec![3u8; 600]);

        let start = Instant::now();
        let (a, b) = tokio::join!(
            sender.send("!a", payload.clone()),
            sender.send("!b", payload)
        );
        assert!(a.is_ok() && b.is_ok());

        let order: Vec<String> = mesh.sent().into_iter().map(|p| p.to).collect();
        assert_eq!(order.len(), 8);
        assert_eq!(&order[..2], ["!a", "!b"]);
        // 3s 송신 + 15s 대기, 두 전송이 겹침
        assert_eq!(start.elapsed(), Duration::from_secs(18));
    }

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_after_wait_rounds() {
        let config = Config {
            wait_rounds: 2,
            ..Config::fast()
        };
        let (_mesh, sender, _rx) = setup(config);

        let start = Instant::now();
        let report = sender
            .send("!rx", Bytes::from_static(b"nobody answers"))
            .await
            .unwrap();

        assert_eq!(report.outcome, SendOutcome::Incomplete);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_invalid_payloads() {
        let (mesh, sender, _rx) = setup(Config::fast());

        assert!(matches!(
            sender.send("!rx", Bytes::new()).await,
            Err(Error::EmptyPayload)
        ));
        assert!(matches!(
            sender.send("!rx", Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1])).await,
            Err(Error::PayloadTooLarge { .. })
        ));
        assert!(mesh.sent().is_empty());
    }

    #[test]
    fn test_transfer_ids_strictly_increase() {
        let mesh = MemoryMesh::new();
        let (transport, _rx) = mesh.join("!tx");
        let sender = Sender::new(Config::default(), Arc::new(transport), Arc::new(ControlInbox::new()));

        let a = sender.next_transfer_id();
        let b = sender.next_transfer_id();
        let c = sender.next_transfer_id();
        assert!(a < b && b < c);
    }
}
