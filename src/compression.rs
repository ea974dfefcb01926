//! zlib 페이로드 압축
//!
//! 이미지는 대개 이미 압축되어 있으므로 절감 효과가 있을 때만 압축본을 사용한다.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::{Config, Error, Result, MAX_PAYLOAD_SIZE};

/// 압축 판단 결과
#[derive(Debug, Clone)]
pub struct Encoded {
    /// 실제 전송할 바이트 스트림
    pub data: Bytes,

    /// 압축 적용 여부
    pub compressed: bool,

    /// 원본 크기
    pub original_size: usize,
}

/// zlib 최고 압축 레벨로 압축
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::best());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// zlib 압축 해제 (출력은 최대 페이로드 크기로 제한)
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 2);
    ZlibDecoder::new(data)
        .take(MAX_PAYLOAD_SIZE as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| Error::Decompression(e.to_string()))?;

    if out.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::Decompression(format!(
            "압축 해제 결과가 {} bytes 초과",
            MAX_PAYLOAD_SIZE
        )));
    }
    Ok(out)
}

/// 설정에 따라 압축을 시도하고, 충분히 줄어들 때만 압축본 채택
pub fn encode_payload(payload: Bytes, config: &Config) -> Encoded {
    let original_size = payload.len();

    if !config.compress_payload || original_size <= config.compression_min_size {
        return Encoded {
            data: payload,
            compressed: false,
            original_size,
        };
    }

    match compress(&payload) {
        Ok(packed)
            if (packed.len() as f64)
                < original_size as f64 * (1.0 - config.compression_min_savings) =>
        {
            tracing::info!(
                "압축 적용: {} -> {} bytes ({:.1}% 절감)",
                original_size,
                packed.len(),
                (1.0 - packed.len() as f64 / original_size as f64) * 100.0
            );
            Encoded {
                data: Bytes::from(packed),
                compressed: true,
                original_size,
            }
        }
        Ok(packed) => {
            tracing::debug!(
                "압축 효과 부족: {} -> {} bytes, 원본 전송",
                original_size,
                packed.len()
            );
            Encoded {
                data: payload,
                compressed: false,
                original_size,
            }
        }
        Err(e) => {
            tracing::warn!("압축 실패, 원본 전송: {}", e);
            Encoded {
                data: payload,
                compressed: false,
                original_size,
            }
        }
    }
}
