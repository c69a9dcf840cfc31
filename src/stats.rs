//! 전송 통계

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// 송신/수신 공용 통계 핸들
pub type SharedStats = Arc<RwLock<TransferStats>>;

/// 전체 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    // 수신
    /// 시작된 스트림 수
    pub streams_started: u64,

    /// 완료된 스트림 수
    pub streams_completed: u64,

    /// 다른 스트림에 밀려 버려진 스트림 수
    pub streams_superseded: u64,

    /// 유휴 만료된 스트림 수
    pub streams_expired: u64,

    /// 새로 받은 청크 수
    pub chunks_accepted: u64,

    /// 중복 청크 수
    pub chunks_duplicate: u64,

    /// 노이즈로 버린 데이터그램 수
    pub noise_datagrams: u64,

    /// 하위로 전달한 레코드 수
    pub records_forwarded: u64,

    /// 체크섬 검증 실패 수
    pub checksum_failures: u64,

    /// 직접 쓰기 모드로 전환된 버퍼 수
    pub buffer_fallbacks: u64,

    /// 수신 바이트 (페이로드)
    pub bytes_received: u64,

    // 송신
    /// 전송 데이터그램 수
    pub datagrams_sent: u64,

    /// 전송 바이트 (페이로드)
    pub bytes_sent: u64,

    /// 완료된 재전송 패스 수
    pub resend_passes: u64,

    /// 중단된 송신 수
    pub aborted_sends: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            streams_started: 0,
            streams_completed: 0,
            streams_superseded: 0,
            streams_expired: 0,
            chunks_accepted: 0,
            chunks_duplicate: 0,
            noise_datagrams: 0,
            records_forwarded: 0,
            checksum_failures: 0,
            buffer_fallbacks: 0,
            bytes_received: 0,
            datagrams_sent: 0,
            bytes_sent: 0,
            resend_passes: 0,
            aborted_sends: 0,
        }
    }

    pub fn shared() -> SharedStats {
        Arc::new(RwLock::new(Self::new()))
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 송신 처리율 (bytes/sec)
    pub fn send_throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.bytes_sent as f64 / elapsed
    }

    /// 수신 처리율 (bytes/sec)
    pub fn receive_throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.bytes_received as f64 / elapsed
    }

    /// 중복 청크 비율
    pub fn duplicate_ratio(&self) -> f64 {
        let total = self.chunks_accepted + self.chunks_duplicate;
        if total == 0 {
            return 0.0;
        }
        self.chunks_duplicate as f64 / total as f64
    }

    /// 송신측 요약
    pub fn send_summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Datagrams: {} | Bytes: {} | Throughput: {:.2} MB/s | Resends: {} | Aborted: {}",
            self.elapsed().as_secs_f64(),
            self.datagrams_sent,
            self.bytes_sent,
            self.send_throughput() / 1_000_000.0,
            self.resend_passes,
            self.aborted_sends,
        )
    }

    /// 수신측 요약
    pub fn receive_summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Streams: {}/{} (superseded {}, expired {}) | Records: {} | Checksum failures: {} | Dup: {:.2}% | Noise: {} | Fallbacks: {}",
            self.elapsed().as_secs_f64(),
            self.streams_completed,
            self.streams_started,
            self.streams_superseded,
            self.streams_expired,
            self.records_forwarded,
            self.checksum_failures,
            self.duplicate_ratio() * 100.0,
            self.noise_datagrams,
            self.buffer_fallbacks,
        )
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!("{} || {}", self.send_summary(), self.receive_summary())
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}
