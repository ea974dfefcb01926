//! 메시 노드
//!
//! 하나의 전송 계층 위에서 송신자/수신자/정체 감시를 묶고, 수신 패킷을 분배한다.
//! - 데이터 패킷 → 수신자
//! - 제어 텍스트 (ACK/REQ/OK) → 송신측 제어 수신함
//! - 그 외 텍스트 → 애플리케이션 채널

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::control::{classify, ControlInbox, Inbound};
use crate::monitor::{MonitorHandle, StallMonitor};
use crate::payload::PayloadSink;
use crate::receiver::Receiver;
use crate::sender::{SendReport, Sender};
use crate::transport::{InboundPacket, NodeId, Transport};
use crate::{Config, Result};

/// 프로토콜 메시지가 아닌 텍스트
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppMessage {
    pub from: NodeId,
    pub text: String,
}

/// 메시 노드
pub struct MeshNode {
    id: NodeId,
    sender: Arc<Sender>,
    receiver: Option<Arc<Receiver>>,
    inbox: Arc<ControlInbox>,
    app_tx: Option<mpsc::UnboundedSender<AppMessage>>,
}

impl MeshNode {
    /// 송신 전용 노드
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Self {
        let inbox = Arc::new(ControlInbox::new());
        Self {
            id: transport.local_id().to_string(),
            sender: Arc::new(Sender::new(config, transport, inbox.clone())),
            receiver: None,
            inbox,
            app_tx: None,
        }
    }

    /// 수신 기능 추가
    pub fn with_receiver(
        mut self,
        config: Config,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn PayloadSink>,
    ) -> Self {
        self.receiver = Some(Arc::new(Receiver::new(config, transport, sink)));
        self
    }

    /// 애플리케이션 텍스트를 받을 채널 연결
    pub fn with_app_channel(mut self) -> (Self, mpsc::UnboundedReceiver<AppMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.app_tx = Some(tx);
        (self, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sender(&self) -> &Arc<Sender> {
        &self.sender
    }

    pub fn receiver(&self) -> Option<&Arc<Receiver>> {
        self.receiver.as_ref()
    }

    pub fn inbox(&self) -> &Arc<ControlInbox> {
        &self.inbox
    }

    /// 페이로드 전송
    pub async fn send(&self, destination: &str, payload: Bytes) -> Result<SendReport> {
        self.sender.send(destination, payload).await
    }

    /// 수신 패킷 하나 처리
    pub async fn handle_packet(&self, packet: InboundPacket) {
        match packet {
            InboundPacket::Data { from, payload } => match &self.receiver {
                Some(receiver) => receiver.on_datagram(&from, &payload).await,
                None => debug!("수신자 없음, 데이터 패킷 무시 (from {})", from),
            },
            InboundPacket::Text { from, text } => match classify(&text) {
                Ok(Inbound::Control(msg)) => {
                    debug!("제어 메시지 수신: {} from {}", msg, from);
                    self.inbox.record(&from, msg);
                }
                Ok(Inbound::Application(text)) => match &self.app_tx {
                    Some(tx) => {
                        let _ = tx.send(AppMessage { from, text });
                    }
                    None => debug!("애플리케이션 메시지 (from {}): {}", from, text),
                },
                Err(e) => warn!("제어 메시지 폐기 (from {}): {}", from, e),
            },
        }
    }

    /// 수신 채널을 소비하는 태스크 시작. 채널이 닫히면 종료
    pub fn spawn_inbound(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<InboundPacket>,
    ) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                node.handle_packet(packet).await;
            }
            info!("{}: 수신 채널 종료", node.id);
        })
    }

    /// 수신자가 있으면 정체 감시 시작
    pub fn start_monitor(&self) -> Option<MonitorHandle> {
        self.receiver
            .as_ref()
            .map(|receiver| StallMonitor::spawn(receiver.clone()))
    }
}
