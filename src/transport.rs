//! 전송 계층 인터페이스
//!
//! 메시 장치 연결은 이 크레이트 밖의 책임이다. 코어는 `Transport`를 통해
//! 텍스트/데이터 패킷을 보내고, 수신 패킷은 `InboundPacket`으로 전달받는다.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;

use crate::frame::TransferId;
use crate::{Error, Result, DEFAULT_CHUNK_SIZE};

/// 메시 노드 ID (예: "!a1b2c3d4")
pub type NodeId = String;

/// (노드, 전송 ID) 복합 키
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferKey {
    pub node: NodeId,
    pub transfer_id: TransferId,
}

impl TransferKey {
    pub fn new(node: impl Into<NodeId>, transfer_id: TransferId) -> Self {
        Self {
            node: node.into(),
            transfer_id,
        }
    }
}

impl std::fmt::Display for TransferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:08x}", self.node, self.transfer_id)
    }
}

/// 수신 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundPacket {
    /// 텍스트 메시지 (제어 또는 애플리케이션)
    Text { from: NodeId, text: String },

    /// 애플리케이션 데이터그램 (청크)
    Data { from: NodeId, payload: Bytes },
}

impl InboundPacket {
    pub fn from(&self) -> &str {
        match self {
            InboundPacket::Text { from, .. } | InboundPacket::Data { from, .. } => from,
        }
    }
}

/// 메시 전송 계층
#[async_trait]
pub trait Transport: Send + Sync {
    /// 이 노드의 ID
    fn local_id(&self) -> &str;

    /// 텍스트 메시지 전송
    async fn send_text(&self, text: &str, destination: &str) -> Result<()>;

    /// 데이터그램 전송. `want_ack`는 링크 계층 확인 요청
    async fn send_data(&self, data: Bytes, destination: &str, want_ack: bool) -> Result<()>;
}

/// 패킷 전달 여부를 결정하는 필터 (from, to, packet) -> 전달 여부
pub type PacketFilter = Box<dyn Fn(&str, &str, &InboundPacket) -> bool + Send + Sync>;

/// 메시로 보내진 패킷 기록
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub to: NodeId,
    pub packet: InboundPacket,
}

/// 프로세스 내 메시 (시뮬레이션/테스트용)
///
/// 무작위 손실, 결정적 필터, 전송 실패 주입을 지원한다.
pub struct MemoryMesh {
    nodes: DashMap<NodeId, mpsc::UnboundedSender<InboundPacket>>,
    mtu: usize,
    max_text_len: usize,
    loss_rate: Mutex<f64>,
    filter: Mutex<Option<PacketFilter>>,
    fail_sends: AtomicU32,
    sent: Mutex<Vec<SentPacket>>,
}

impl MemoryMesh {
    pub fn new() -> Arc<Self> {
        Self::with_limits(DEFAULT_CHUNK_SIZE, 200)
    }

    pub fn with_limits(mtu: usize, max_text_len: usize) -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            mtu,
            max_text_len,
            loss_rate: Mutex::new(0.0),
            filter: Mutex::new(None),
            fail_sends: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// 노드 참가. 전송 핸들과 수신 채널 반환
    pub fn join(
        self: &Arc<Self>,
        node_id: impl Into<NodeId>,
    ) -> (MemoryTransport, mpsc::UnboundedReceiver<InboundPacket>) {
        let node_id = node_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.nodes.insert(node_id.clone(), tx);
        (
            MemoryTransport {
                node_id,
                mesh: self.clone(),
            },
            rx,
        )
    }

    /// 무작위 패킷 손실률 (0.0 ~ 1.0)
    pub fn set_loss_rate(&self, rate: f64) {
        *self.loss_rate.lock() = rate.clamp(0.0, 1.0);
    }

    pub fn set_filter<F>(&self, filter: F)
    where
        F: Fn(&str, &str, &InboundPacket) -> bool + Send + Sync + 'static,
    {
        *self.filter.lock() = Some(Box::new(filter));
    }

    /// 다음 n번의 전송 시도를 실패시킴
    pub fn fail_next_sends(&self, n: u32) {
        self.fail_sends.store(n, Ordering::SeqCst);
    }

    /// 지금까지 전송 계층이 수락한 패킷 (손실된 패킷 포함)
    pub fn sent(&self) -> Vec<SentPacket> {
        self.sent.lock().clone()
    }

    fn route(&self, to: &str, packet: InboundPacket) -> Result<()> {
        let fail = self
            .fail_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(Error::Transport("주입된 전송 실패".into()));
        }

        let target = self
            .nodes
            .get(to)
            .map(|tx| tx.clone())
            .ok_or_else(|| Error::UnknownPeer(to.to_string()))?;

        self.sent.lock().push(SentPacket {
            to: to.to_string(),
            packet: packet.clone(),
        });

        let loss_rate = *self.loss_rate.lock();
        if loss_rate > 0.0 && rand::thread_rng().gen_bool(loss_rate) {
            return Ok(());
        }
        if let Some(filter) = self.filter.lock().as_ref() {
            if !filter(packet.from(), to, &packet) {
                return Ok(());
            }
        }

        // 수신 노드가 종료되었으면 무선 구간 손실과 동일하게 취급
        let _ = target.send(packet);
        Ok(())
    }
}

/// `MemoryMesh` 노드의 전송 핸들
#[derive(Clone)]
pub struct MemoryTransport {
    node_id: NodeId,
    mesh: Arc<MemoryMesh>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_id(&self) -> &str {
        &self.node_id
    }

    async fn send_text(&self, text: &str, destination: &str) -> Result<()> {
        if text.len() > self.mesh.max_text_len {
            return Err(Error::PacketTooLarge {
                len: text.len(),
                mtu: self.mesh.max_text_len,
            });
        }
        self.mesh.route(
            destination,
            InboundPacket::Text {
                from: self.node_id.clone(),
                text: text.to_string(),
            },
        )
    }

    async fn send_data(&self, data: Bytes, destination: &str, _want_ack: bool) -> Result<()> {
        if data.len() > self.mesh.mtu {
            return Err(Error::PacketTooLarge {
                len: data.len(),
                mtu: self.mesh.mtu,
            });
        }
        self.mesh.route(
            destination,
            InboundPacket::Data {
                from: self.node_id.clone(),
                payload: data,
            },
        )
    }
}
