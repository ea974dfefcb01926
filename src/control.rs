//! 제어 채널
//!
//! 전송 계층의 텍스트 메시지 위에 얹힌 최소한의 제어 문법.
//!
//! ```text
//! ACK:<transfer_id_hex>:<chunk,list>
//! REQ:<transfer_id_hex>:<chunk,list>
//! OK:<transfer_id_hex>
//! ```
//!
//! 세 접두어 중 어느 것과도 맞지 않는 텍스트는 애플리케이션 메시지로 넘긴다.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;

use crate::frame::{ChunkIndex, TransferId};
use crate::transport::TransferKey;
use crate::{Error, Result};

const ACK_PREFIX: &str = "ACK:";
const REQ_PREFIX: &str = "REQ:";
const OK_PREFIX: &str = "OK:";

/// 제어 메시지
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// 수신 확인된 청크 목록
    Ack {
        transfer_id: TransferId,
        chunks: Vec<ChunkIndex>,
    },

    /// 재전송 요청 청크 목록
    Req {
        transfer_id: TransferId,
        chunks: Vec<ChunkIndex>,
    },

    /// 전송 완료 확인
    Ok { transfer_id: TransferId },
}

/// 수신 텍스트 분류 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Control(ControlMessage),
    Application(String),
}

impl ControlMessage {
    pub fn transfer_id(&self) -> TransferId {
        match self {
            ControlMessage::Ack { transfer_id, .. }
            | ControlMessage::Req { transfer_id, .. }
            | ControlMessage::Ok { transfer_id } => *transfer_id,
        }
    }

    /// 제어 텍스트 파싱
    ///
    /// 프로토콜 접두어가 아니면 `Ok(None)`, 접두어는 맞지만 본문이 잘못되면 에러.
    pub fn parse(text: &str) -> Result<Option<Self>> {
        if let Some(body) = text.strip_prefix(ACK_PREFIX) {
            let (transfer_id, chunks) = parse_list_body(text, body)?;
            Ok(Some(ControlMessage::Ack { transfer_id, chunks }))
        } else if let Some(body) = text.strip_prefix(REQ_PREFIX) {
            let (transfer_id, chunks) = parse_list_body(text, body)?;
            Ok(Some(ControlMessage::Req { transfer_id, chunks }))
        } else if let Some(body) = text.strip_prefix(OK_PREFIX) {
            let id = body.split(':').next().unwrap_or_default();
            Ok(Some(ControlMessage::Ok {
                transfer_id: parse_transfer_id(text, id)?,
            }))
        } else {
            Ok(None)
        }
    }

    /// 누락 청크 목록을 텍스트 길이 제한에 맞춰 여러 REQ로 분할
    pub fn requests(
        transfer_id: TransferId,
        missing: &[ChunkIndex],
        max_text_len: usize,
    ) -> Vec<ControlMessage> {
        // "REQ:" + 8자리 id + ":"
        let budget = max_text_len.saturating_sub(REQ_PREFIX.len() + 9).max(3);

        let mut batches = Vec::new();
        let mut current: Vec<ChunkIndex> = Vec::new();
        let mut used = 0;

        for &idx in missing {
            let width = digits(idx) + usize::from(!current.is_empty());
            if !current.is_empty() && used + width > budget {
                batches.push(std::mem::take(&mut current));
                used = 0;
            }
            used += digits(idx) + usize::from(!current.is_empty());
            current.push(idx);
        }
        if !current.is_empty() {
            batches.push(current);
        }

        batches
            .into_iter()
            .map(|chunks| ControlMessage::Req {
                transfer_id,
                chunks,
            })
            .collect()
    }
}

/// 텍스트를 제어 메시지 또는 애플리케이션 메시지로 분류
pub fn classify(text: &str) -> Result<Inbound> {
    Ok(match ControlMessage::parse(text)? {
        Some(msg) => Inbound::Control(msg),
        None => Inbound::Application(text.to_string()),
    })
}

fn digits(idx: ChunkIndex) -> usize {
    match idx {
        0..=9 => 1,
        10..=99 => 2,
        _ => 3,
    }
}

fn parse_transfer_id(text: &str, id: &str) -> Result<TransferId> {
    if id.is_empty() || id.len() > 8 {
        return Err(Error::InvalidControl(text.to_string()));
    }
    u32::from_str_radix(id, 16).map_err(|_| Error::InvalidControl(text.to_string()))
}

fn parse_list_body(text: &str, body: &str) -> Result<(TransferId, Vec<ChunkIndex>)> {
    let (id, list) = body
        .split_once(':')
        .ok_or_else(|| Error::InvalidControl(text.to_string()))?;
    let transfer_id = parse_transfer_id(text, id)?;

    let chunks = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<ChunkIndex>()
                .map_err(|_| Error::InvalidControl(text.to_string()))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok((transfer_id, chunks))
}

fn write_list(f: &mut fmt::Formatter<'_>, chunks: &[ChunkIndex]) -> fmt::Result {
    for (i, idx) in chunks.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{}", idx)?;
    }
    Ok(())
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMessage::Ack {
                transfer_id,
                chunks,
            } => {
                write!(f, "{}{:08x}:", ACK_PREFIX, transfer_id)?;
                write_list(f, chunks)
            }
            ControlMessage::Req {
                transfer_id,
                chunks,
            } => {
                write!(f, "{}{:08x}:", REQ_PREFIX, transfer_id)?;
                write_list(f, chunks)
            }
            ControlMessage::Ok { transfer_id } => write!(f, "{}{:08x}", OK_PREFIX, transfer_id),
        }
    }
}

/// 진행 중인 송신 하나에 대해 누적된 제어 이벤트
#[derive(Debug, Default)]
struct PendingControl {
    completed: bool,
    requested: BTreeSet<ChunkIndex>,
    acked: BTreeSet<ChunkIndex>,
    notify: Arc<Notify>,
}

/// 대기 중인 송신자가 소비하는 이벤트 스냅샷
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlEvents {
    /// OK 수신 여부
    pub completed: bool,

    /// 새로 요청된 청크 (스냅샷 시 비워짐)
    pub requested: Vec<ChunkIndex>,

    /// 지금까지 ACK된 청크 수
    pub acked: usize,
}

/// 제어 이벤트 수신함 (송신측)
///
/// 송신 시작 시 등록된 (목적지, 전송 ID)에 대한 이벤트만 보관한다.
#[derive(Debug, Default)]
pub struct ControlInbox {
    pending: DashMap<TransferKey, PendingControl>,
}

impl ControlInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// 송신 등록. 이벤트 도착 시 깨어날 `Notify` 반환
    pub fn register(&self, key: TransferKey) -> Arc<Notify> {
        self.pending.entry(key).or_default().notify.clone()
    }

    /// 등록 해제
    pub fn forget(&self, key: &TransferKey) {
        self.pending.remove(key);
    }

    /// `from` 노드가 보낸 제어 메시지 기록. 등록된 송신이 없으면 false
    pub fn record(&self, from: &str, msg: ControlMessage) -> bool {
        let key = TransferKey::new(from, msg.transfer_id());
        let Some(mut entry) = self.pending.get_mut(&key) else {
            debug!("등록되지 않은 전송의 제어 메시지 무시: {} from {}", msg, from);
            return false;
        };

        match msg {
            ControlMessage::Ok { .. } => entry.completed = true,
            ControlMessage::Req { chunks, .. } => entry.requested.extend(chunks),
            ControlMessage::Ack { chunks, .. } => entry.acked.extend(chunks),
        }
        entry.notify.notify_one();
        true
    }

    /// 누적 이벤트 스냅샷 (요청 목록은 소비됨)
    pub fn take(&self, key: &TransferKey) -> ControlEvents {
        match self.pending.get_mut(key) {
            Some(mut entry) => ControlEvents {
                completed: entry.completed,
                requested: std::mem::take(&mut entry.requested).into_iter().collect(),
                acked: entry.acked.len(),
            },
            None => ControlEvents::default(),
        }
    }
}
