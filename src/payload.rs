//! 페이로드 소스/싱크
//!
//! 소스는 이미 인코딩된 바이너리(이미지)를 만들고, 싱크는 재조립·검증·압축 해제가
//! 끝난 버퍼를 받아 디코딩하거나 저장한다.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::info;

use crate::frame::TransferId;
use crate::transport::NodeId;
use crate::{Error, Result};

/// 완료된 전송
#[derive(Debug, Clone)]
pub struct Delivery {
    /// 송신 노드
    pub from: NodeId,

    pub transfer_id: TransferId,

    /// 압축 해제된 최종 데이터
    pub data: Bytes,

    /// 전송 중 압축 사용 여부
    pub compressed: bool,

    /// 첫 청크부터 완료까지 걸린 시간
    pub elapsed: Duration,
}

/// 페이로드 싱크
#[async_trait]
pub trait PayloadSink: Send + Sync {
    /// 에러를 반환하면 완료 확인(OK)을 보내지 않는다
    async fn deliver(&self, delivery: Delivery) -> Result<()>;
}

/// 채널로 완료 전송을 넘기는 싱크
pub struct ChannelSink {
    tx: mpsc::Sender<Delivery>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl PayloadSink for ChannelSink {
    async fn deliver(&self, delivery: Delivery) -> Result<()> {
        self.tx
            .send(delivery)
            .await
            .map_err(|_| Error::ChannelClosed)
    }
}

/// 수신 이미지를 디렉터리(갤러리)에 저장하는 싱크
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// RIFF....WEBP 매직이면 webp, 아니면 jpg
pub fn image_extension(data: &[u8]) -> &'static str {
    if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        "webp"
    } else {
        "jpg"
    }
}

#[async_trait]
impl PayloadSink for DirectorySink {
    async fn deliver(&self, delivery: Delivery) -> Result<()> {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let ext = image_extension(&delivery.data);

        // 같은 초에 여러 장이 도착하면 전송 ID로 구분
        let mut path = self.dir.join(format!("img_{}.{}", secs, ext));
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            path = self
                .dir
                .join(format!("img_{}_{:08x}.{}", secs, delivery.transfer_id, ext));
        }

        tokio::fs::write(&path, &delivery.data)
            .await
            .map_err(|e| Error::Sink(format!("{}: {}", path.display(), e)))?;

        info!(
            "저장 완료: {} ({} bytes, {:.1}s, from {})",
            path.display(),
            delivery.data.len(),
            delivery.elapsed.as_secs_f64(),
            delivery.from
        );
        Ok(())
    }
}

/// 페이로드 소스
pub trait PayloadSource {
    fn load(&self) -> Result<Bytes>;
}

/// 파일에서 읽는 소스
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PayloadSource for FileSource {
    fn load(&self) -> Result<Bytes> {
        Ok(Bytes::from(std::fs::read(&self.path)?))
    }
}

/// 메모리 버퍼 소스
pub struct StaticSource(pub Bytes);

impl PayloadSource for StaticSource {
    fn load(&self) -> Result<Bytes> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(data: &'static [u8], transfer_id: TransferId) -> Delivery {
        Delivery {
            from: "!cam".into(),
            transfer_id,
            data: Bytes::from_static(data),
            compressed: false,
            elapsed: Duration::from_secs(3),
        }
    }

    #[test]
    fn test_image_extension_sniffing() {
        assert_eq!(image_extension(b"RIFF\x10\x00\x00\x00WEBPVP8 "), "webp");
        assert_eq!(image_extension(b"\xFF\xD8\xFF\xE0"), "jpg");
        assert_eq!(image_extension(b"RIFF"), "jpg");
    }

    #[tokio::test]
    async fn test_directory_sink_writes_files() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(tmp.path().join("gallery")).unwrap();

        sink.deliver(delivery(b"RIFF\x04\x00\x00\x00WEBPdata", 1))
            .await
            .unwrap();
        sink.deliver(delivery(b"\xFF\xD8jpeg", 2)).await.unwrap();

        let mut names: Vec<String> = std::fs::read_dir(sink.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        assert_eq!(names.len(), 2);
        assert!(names.iter().any(|n| n.ends_with(".webp")));
        assert!(names.iter().any(|n| n.ends_with(".jpg")));
        assert!(names.iter().all(|n| n.starts_with("img_")));
    }

    #[tokio::test]
    async fn test_channel_sink_closed() {
        let (sink, rx) = ChannelSink::new(1);
        drop(rx);
        assert!(matches!(
            sink.deliver(delivery(b"x", 1)).await,
            Err(Error::ChannelClosed)
        ));
    }

    #[test]
    fn test_sources() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"image bytes").unwrap();

        assert_eq!(
            FileSource::new(tmp.path()).load().unwrap().as_ref(),
            b"image bytes"
        );
        assert_eq!(
            StaticSource(Bytes::from_static(b"abc")).load().unwrap().as_ref(),
            b"abc"
        );
        assert!(FileSource::new("/nonexistent/meshsend/img.jpg").load().is_err());
    }
}
