//! 청크 프레임 코덱
//!
//! 모든 청크는 15바이트 고정 헤더(빅엔디언) 뒤에 페이로드 조각이 붙는다.
//!
//! ```text
//! transfer_id(4) | total_chunks(1) | chunk_index(1) | compressed(1) | crc32(4) | total_size(4)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result, HEADER_SIZE, MAX_CHUNKS, MAX_PAYLOAD_SIZE};

/// 전송 ID (32비트)
pub type TransferId = u32;

/// 청크 인덱스 (전송 내 위치)
pub type ChunkIndex = u8;

/// 청크 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferHeader {
    /// 전송 ID
    pub transfer_id: TransferId,

    /// 전송의 총 청크 수 (1 ~ 255)
    pub total_chunks: u8,

    /// 이 청크의 인덱스
    pub chunk_index: ChunkIndex,

    /// 페이로드 압축 여부
    pub compressed: bool,

    /// 전송되는 바이트 스트림 전체의 CRC32
    pub crc32: u32,

    /// 전송되는 바이트 스트림 전체 크기
    pub total_size: u32,
}

impl TransferHeader {
    /// 필드 범위 검증
    pub fn validate(&self) -> Result<()> {
        if self.total_chunks == 0 {
            return Err(Error::InvalidTotalChunks);
        }
        if self.chunk_index >= self.total_chunks {
            return Err(Error::InvalidChunkIndex {
                index: self.chunk_index,
                total: self.total_chunks,
            });
        }
        if self.total_size > MAX_PAYLOAD_SIZE as u32 {
            return Err(Error::TotalSizeTooLarge {
                size: self.total_size,
                max: MAX_PAYLOAD_SIZE as u32,
            });
        }
        Ok(())
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.transfer_id);
        buf.put_u8(self.total_chunks);
        buf.put_u8(self.chunk_index);
        buf.put_u8(self.compressed as u8);
        buf.put_u32(self.crc32);
        buf.put_u32(self.total_size);
    }

    /// 헤더 디코딩 및 검증
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::PacketTooShort {
                len: bytes.len(),
                min: HEADER_SIZE,
            });
        }

        let header = Self {
            transfer_id: bytes.get_u32(),
            total_chunks: bytes.get_u8(),
            chunk_index: bytes.get_u8(),
            compressed: bytes.get_u8() != 0,
            crc32: bytes.get_u32(),
            total_size: bytes.get_u32(),
        };
        header.validate()?;
        Ok(header)
    }
}

/// 청크 (전송 데이터그램 단위)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub header: TransferHeader,
    pub payload: Bytes,
}

impl Chunk {
    /// 데이터그램으로 직렬화
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// 데이터그램에서 역직렬화
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = TransferHeader::decode(bytes)?;
        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&bytes[HEADER_SIZE..]),
        })
    }
}

/// 바이트 스트림을 청크로 분할하는 빌더 (송신측)
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    payload_capacity: usize,
}

impl FrameBuilder {
    /// `chunk_size`는 헤더를 포함한 데이터그램 크기
    pub fn new(chunk_size: usize) -> Self {
        Self {
            payload_capacity: chunk_size.saturating_sub(HEADER_SIZE).max(1),
        }
    }

    pub fn payload_capacity(&self) -> usize {
        self.payload_capacity
    }

    /// 필요한 청크 수
    pub fn chunk_count(&self, len: usize) -> usize {
        (len + self.payload_capacity - 1) / self.payload_capacity
    }

    /// 데이터를 청크들로 분할
    ///
    /// `crc32`는 `data` 전체(실제 전송 스트림)에 대한 값이어야 한다.
    pub fn split(
        &self,
        transfer_id: TransferId,
        data: &Bytes,
        compressed: bool,
        crc32: u32,
    ) -> Result<Vec<Chunk>> {
        if data.is_empty() {
            return Err(Error::EmptyPayload);
        }
        if data.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge {
                size: data.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let needed = self.chunk_count(data.len());
        if needed > MAX_CHUNKS {
            return Err(Error::TooManyChunks {
                needed,
                max: MAX_CHUNKS,
            });
        }

        let total_chunks = needed as u8;
        let total_size = data.len() as u32;

        Ok((0..needed)
            .map(|idx| {
                let start = idx * self.payload_capacity;
                let end = (start + self.payload_capacity).min(data.len());
                Chunk {
                    header: TransferHeader {
                        transfer_id,
                        total_chunks,
                        chunk_index: idx as ChunkIndex,
                        compressed,
                        crc32,
                        total_size,
                    },
                    payload: data.slice(start..end),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> TransferHeader {
        TransferHeader {
            transfer_id: 0x0102_0304,
            total_chunks: 11,
            chunk_index: 5,
            compressed: true,
            crc32: 0xDEAD_BEEF,
            total_size: 2000,
        }
    }

    #[test]
    fn test_header_layout() {
        let chunk = Chunk {
            header: header(),
            payload: Bytes::from_static(b"xy"),
        };
        let bytes = chunk.to_bytes();

        assert_eq!(bytes.len(), HEADER_SIZE + 2);
        assert_eq!(
            &bytes[..HEADER_SIZE],
            &[1, 2, 3, 4, 11, 5, 1, 0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0x07, 0xD0]
        );
        assert_eq!(Chunk::from_bytes(&bytes).unwrap(), chunk);
    }

    #[test]
    fn test_nonzero_flag_means_compressed() {
        let mut bytes = Chunk {
            header: TransferHeader {
                compressed: false,
                ..header()
            },
            payload: Bytes::new(),
        }
        .to_bytes()
        .to_vec();
        bytes[6] = 7;

        assert!(TransferHeader::decode(&bytes).unwrap().compressed);
    }

    #[test]
    fn test_decode_rejects_invalid_fields() {
        assert!(matches!(
            Chunk::from_bytes(&[0u8; 14]),
            Err(Error::PacketTooShort { len: 14, .. })
        ));

        let mut buf = BytesMut::new();
        TransferHeader {
            total_chunks: 0,
            chunk_index: 0,
            ..header()
        }
        .encode(&mut buf);
        assert!(matches!(
            TransferHeader::decode(&buf),
            Err(Error::InvalidTotalChunks)
        ));

        let mut buf = BytesMut::new();
        TransferHeader {
            chunk_index: 11,
            ..header()
        }
        .encode(&mut buf);
        assert!(matches!(
            TransferHeader::decode(&buf),
            Err(Error::InvalidChunkIndex { index: 11, total: 11 })
        ));

        let mut buf = BytesMut::new();
        TransferHeader {
            total_size: 10_000_001,
            ..header()
        }
        .encode(&mut buf);
        let err = TransferHeader::decode(&buf).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_split_2000_bytes() {
        let builder = FrameBuilder::new(200);
        let data = Bytes::from((0..2000).map(|i| (i % 251) as u8).collect::<Vec<u8>>());
        let chunks = builder.split(7, &data, false, 42).unwrap();

        assert_eq!(builder.payload_capacity(), 185);
        assert_eq!(chunks.len(), 11);
        assert!(chunks.iter().all(|c| c.header.total_chunks == 11));
        assert!(chunks.iter().all(|c| c.to_bytes().len() <= 200));
        assert_eq!(chunks[10].payload.len(), 2000 - 10 * 185);

        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.payload.to_vec()).collect();
        assert_eq!(joined, data.to_vec());
    }

    #[test]
    fn test_split_limits() {
        let builder = FrameBuilder::new(200);
        assert!(matches!(
            builder.split(1, &Bytes::new(), false, 0),
            Err(Error::EmptyPayload)
        ));

        let max = Bytes::from(vec![0u8; 185 * 255]);
        assert_eq!(builder.split(1, &max, false, 0).unwrap().len(), 255);

        let over = Bytes::from(vec![0u8; 185 * 255 + 1]);
        assert!(matches!(
            builder.split(1, &over, false, 0),
            Err(Error::TooManyChunks { needed: 256, .. })
        ));
    }
}
