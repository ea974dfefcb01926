//! UDP 전송 어댑터
//!
//! 메시 장치 대신 UDP로 노드를 연결한다. 각 데이터그램은 bincode로 직렬화한
//! `Envelope` 하나이며, 송신 노드 ID를 함께 실어 보낸다.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{InboundPacket, NodeId, Transport};
use crate::{Error, Result, DEFAULT_CHUNK_SIZE};

/// 수신 버퍼 크기
const RECV_BUFFER_SIZE: usize = 2048;

/// UDP 데이터그램 봉투
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    Text {
        from: NodeId,
        text: String,
    },
    Data {
        from: NodeId,
        payload: Vec<u8>,
        want_ack: bool,
    },
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn into_packet(self) -> InboundPacket {
        match self {
            Envelope::Text { from, text } => InboundPacket::Text { from, text },
            Envelope::Data { from, payload, .. } => InboundPacket::Data {
                from,
                payload: Bytes::from(payload),
            },
        }
    }

    fn sender(&self) -> &str {
        match self {
            Envelope::Text { from, .. } | Envelope::Data { from, .. } => from,
        }
    }
}

/// UDP 전송 계층
pub struct UdpTransport {
    node_id: NodeId,
    socket: Arc<UdpSocket>,

    /// 노드 ID -> 주소 (수신 트래픽으로 자동 학습)
    peers: Arc<DashMap<NodeId, SocketAddr>>,

    mtu: usize,
    max_text_len: usize,
}

impl UdpTransport {
    pub async fn bind(node_id: impl Into<NodeId>, addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let node_id = node_id.into();
        info!("{}: UDP 바인드 {}", node_id, socket.local_addr()?);

        Ok(Self {
            node_id,
            socket: Arc::new(socket),
            peers: Arc::new(DashMap::new()),
            mtu: DEFAULT_CHUNK_SIZE,
            max_text_len: 200,
        })
    }

    pub fn with_limits(mut self, mtu: usize, max_text_len: usize) -> Self {
        self.mtu = mtu;
        self.max_text_len = max_text_len;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// 피어 주소 등록
    pub fn add_peer(&self, node_id: impl Into<NodeId>, addr: SocketAddr) {
        self.peers.insert(node_id.into(), addr);
    }

    pub fn peer_addr(&self, node_id: &str) -> Option<SocketAddr> {
        self.peers.get(node_id).map(|addr| *addr)
    }

    /// 수신 태스크 시작. 채널이 닫히면 종료
    pub fn spawn_inbound(&self, tx: mpsc::UnboundedSender<InboundPacket>) -> JoinHandle<()> {
        let socket = self.socket.clone();
        let peers = self.peers.clone();
        let node_id = self.node_id.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                let (len, addr) = match socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("{}: 수신 에러: {}", node_id, e);
                        continue;
                    }
                };

                let envelope = match Envelope::from_bytes(&buf[..len]) {
                    Ok(env) => env,
                    Err(e) => {
                        debug!("{}: 알 수 없는 데이터그램 ({} bytes from {}): {}", node_id, len, addr, e);
                        continue;
                    }
                };

                let from = envelope.sender().to_string();
                if peers.insert(from.clone(), addr) != Some(addr) {
                    info!("{}: 피어 학습 {} -> {}", node_id, from, addr);
                }

                if tx.send(envelope.into_packet()).is_err() {
                    break;
                }
            }
        })
    }

    async fn send_envelope(&self, envelope: &Envelope, destination: &str) -> Result<()> {
        let addr = self
            .peer_addr(destination)
            .ok_or_else(|| Error::UnknownPeer(destination.to_string()))?;
        let bytes = envelope.to_bytes()?;
        self.socket
            .send_to(&bytes, addr)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_id(&self) -> &str {
        &self.node_id
    }

    async fn send_text(&self, text: &str, destination: &str) -> Result<()> {
        if text.len() > self.max_text_len {
            return Err(Error::PacketTooLarge {
                len: text.len(),
                mtu: self.max_text_len,
            });
        }
        let envelope = Envelope::Text {
            from: self.node_id.clone(),
            text: text.to_string(),
        };
        self.send_envelope(&envelope, destination).await
    }

    async fn send_data(&self, data: Bytes, destination: &str, want_ack: bool) -> Result<()> {
        if data.len() > self.mtu {
            return Err(Error::PacketTooLarge {
                len: data.len(),
                mtu: self.mtu,
            });
        }
        let envelope = Envelope::Data {
            from: self.node_id.clone(),
            payload: data.to_vec(),
            want_ack,
        };
        self.send_envelope(&envelope, destination).await
    }
}
