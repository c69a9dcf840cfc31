//! 에러 타입 정의

use thiserror::Error;

/// FlowFile UDP 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("유효하지 않은 포트 지정: {0}")]
    InvalidPortSpec(String),

    #[error("유효하지 않은 MTU: {mtu} (청크 크기 {chunk_size})")]
    InvalidMtu { mtu: usize, chunk_size: i64 },

    #[error("FlowFile 헤더가 아님")]
    NotFlowFile,

    #[error("FlowFile 레코드가 잘림")]
    TruncatedFlowFile,

    #[error("지원하지 않는 체크섬 타입: {0}")]
    UnsupportedChecksum(String),

    #[error("체크섬 속성 없음")]
    ChecksumMissing,

    #[error("체크섬 불일치: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("부분 전송: expected {expected} bytes, wrote {written}")]
    ShortWrite { expected: usize, written: usize },

    #[error("스트림이 일찍 끝남: expected {expected} bytes, got {got}")]
    ShortStream { expected: u64, got: u64 },

    #[error("스트림 크기 초과: {size} > {max}")]
    StreamTooLarge { size: u64, max: u64 },

    #[error("전송 취소됨")]
    Cancelled,

    #[error("워커 풀 닫힘")]
    PoolClosed,

    #[error("하위 전달 실패: {0}")]
    Sink(String),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
