//! # FlowFile UDP
//!
//! FlowFile 레코드를 단방향 UDP로 분할 전송/재조립하는 전송 계층
//!
//! ## 핵심 특징
//! - **고정 헤더**: 모든 데이터그램에 스트림 ID/전체 크기/오프셋/청크 크기
//! - **오프셋 비트맵 조립**: 순서 뒤바뀜, 중복 도착과 무관하게 완료 판정
//! - **스트리밍 체크섬**: 연속 구간이 생기는 즉시 해시, 재읽기 최소화
//! - **하이브리드 버퍼**: 메모리 윈도우 + 임시 파일, 초과 시 직접 쓰기로 전환
//! - **고정 1회 재전송**: ACK 없이 지연 후 전체 스트림을 한 번 더 전송
//! - **대역폭 제한**: 워커별 또는 공유 throttle

pub mod bitmap;
pub mod buffer;
pub mod config;
pub mod error;
pub mod flowfile;
pub mod liveness;
pub mod packet;
pub mod pool;
pub mod receiver;
pub mod sender;
pub mod sink;
pub mod stats;
pub mod throttle;

pub use buffer::{BufferMode, ContiguousSink, HybridBuffer};
pub use config::{Config, Endpoints};
pub use error::{Error, Result};
pub use flowfile::{Attributes, ChecksumKind, FlowFile};
pub use liveness::LivenessTable;
pub use packet::{PacketHeader, StreamId};
pub use pool::{WorkerLease, WorkerPool};
pub use receiver::{FlowFileSink, Reassembler, Receiver};
pub use sender::{Fragmenter, SendReport};
pub use sink::{ChannelSink, DirectorySink};
pub use stats::TransferStats;
pub use throttle::Throttle;

/// 기본 MTU (바이트)
pub const DEFAULT_MTU: usize = 1200;

/// IPv4 + UDP 헤더 크기
pub const IPV4_UDP_OVERHEAD: usize = 28;

/// 허용하는 최소 청크 크기 (이보다 작으면 노이즈)
pub const MIN_CHUNK_SIZE: usize = 100;
