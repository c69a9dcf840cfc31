//! 데이터그램 헤더 코덱
//!
//! ```text
//! [0..16]   Stream ID (UUID)
//! [16..24]  Total size (u64 BE)
//! [24..32]  Offset (u64 BE)
//! [32..34]  Chunk size (u16 BE)
//! [34..]    Payload (0 ~ chunk size)
//! ```
//!
//! 헤더 자체의 무결성은 검사하지 않음. 재조립된 스트림의 FlowFile 체크섬이 담당

use std::fmt;
use std::sync::OnceLock;

use bincode::Options;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::MIN_CHUNK_SIZE;

/// 스트림 ID (128비트)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StreamId(pub [u8; 16]);

impl StreamId {
    /// 새 랜덤 ID (UUID v4)
    pub fn random() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    /// UUID 문자열 파싱
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(|u| Self(*u.as_bytes()))
    }

    pub fn as_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_uuid().hyphenated())
    }
}

/// 모든 데이터그램 앞에 붙는 고정 크기 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PacketHeader {
    /// 논리 전송 단위 ID
    pub stream_id: StreamId,

    /// 인코딩된 스트림 전체 크기
    pub total_size: u64,

    /// 이 청크의 스트림 내 오프셋
    pub offset: u64,

    /// 스트림 분할에 사용한 청크 크기 (스트림 동안 고정)
    pub chunk_size: u16,
}

/// 빅엔디안 고정폭 인코딩
fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
}

/// 헤더 크기 (최초 호출 시 한 번 계산)
pub fn header_size() -> usize {
    static SIZE: OnceLock<usize> = OnceLock::new();
    *SIZE.get_or_init(|| {
        codec()
            .serialized_size(&PacketHeader::default())
            .map(|n| n as usize)
            .unwrap_or(34)
    })
}

impl PacketHeader {
    pub fn new(stream_id: StreamId, total_size: u64, chunk_size: u16) -> Self {
        Self {
            stream_id,
            total_size,
            offset: 0,
            chunk_size,
        }
    }

    /// 청크 수 = ceil(total_size / chunk_size)
    pub fn chunk_count(&self) -> u64 {
        if self.chunk_size == 0 {
            return 0;
        }
        self.total_size.div_ceil(self.chunk_size as u64)
    }

    /// 오프셋의 청크 인덱스
    ///
    /// 오프셋이 청크 경계가 아니거나 범위를 벗어나면 None
    pub fn chunk_index(&self) -> Option<u64> {
        let chunk = self.chunk_size as u64;
        if chunk == 0 || self.offset % chunk != 0 {
            return None;
        }
        let idx = self.offset / chunk;
        (idx < self.chunk_count()).then_some(idx)
    }

    /// 이 오프셋에 와야 할 페이로드 길이
    pub fn expected_payload_len(&self) -> usize {
        let remaining = self.total_size.saturating_sub(self.offset);
        remaining.min(self.chunk_size as u64) as usize
    }

    /// 헤더 + 페이로드를 `out`에 기록
    pub fn encode_datagram(&self, payload: &[u8], out: &mut Vec<u8>) {
        out.clear();
        out.reserve(header_size() + payload.len());
        // 고정 크기 구조체라 Vec 쓰기는 실패하지 않음
        if codec().serialize_into(&mut *out, self).is_err() {
            out.clear();
            return;
        }
        out.extend_from_slice(payload);
    }
}

/// 데이터그램 디코딩
///
/// 헤더보다 짧거나, 청크 크기가 최소값 미만이거나, 페이로드가 청크 크기를
/// 넘으면 노이즈로 보고 None 반환
pub fn decode(datagram: &[u8]) -> Option<(PacketHeader, &[u8])> {
    let size = header_size();
    if datagram.len() < size {
        return None;
    }
    let header: PacketHeader = codec().deserialize(&datagram[..size]).ok()?;
    if (header.chunk_size as usize) < MIN_CHUNK_SIZE {
        return None;
    }
    let payload = &datagram[size..];
    if payload.len() > header.chunk_size as usize {
        return None;
    }
    Some((header, payload))
}

/// 메모리 상의 스트림을 데이터그램들로 분할 (announce 포함)
#[cfg(test)]
pub(crate) fn fragment(stream_id: StreamId, data: &[u8], chunk_size: u16) -> Vec<Vec<u8>> {
    let mut header = PacketHeader::new(stream_id, data.len() as u64, chunk_size);
    let mut datagrams = Vec::with_capacity(header.chunk_count() as usize + 1);

    let mut announce = Vec::new();
    header.encode_datagram(&[], &mut announce);
    datagrams.push(announce);

    for piece in data.chunks(chunk_size.max(1) as usize) {
        let mut out = Vec::new();
        header.encode_datagram(piece, &mut out);
        datagrams.push(out);
        header.offset += piece.len() as u64;
    }

    datagrams
}
