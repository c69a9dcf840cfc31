//! 대역폭 제한기
//!
//! 설정된 bits/sec, 프레임 크기, 프레임 간격으로 전송 간격을 계산하고
//! 데이터그램마다 허가(permit)를 내줌. 데이터 경로와는 독립

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// 전송 허가 발급기
///
/// 워커마다 하나씩 쓰거나 `Arc`로 모든 워커가 공유 가능.
/// 공유하면 병렬 전송이 직렬화됨
#[derive(Debug)]
pub struct Throttle {
    /// 허가 간격
    interval: Duration,

    /// 다음 허가 가능 시각
    next: Mutex<Instant>,
}

impl Throttle {
    /// bits/sec 예산과 프레임 크기로 생성
    ///
    /// `gap`은 매체상의 프레임 오버헤드(바이트). 클수록 전송 빈도가 낮아짐
    pub fn new(bits_per_second: u64, frame_size: usize, gap: i64) -> Self {
        if bits_per_second == 0 {
            return Self::unlimited();
        }
        let frame_bits = (frame_size as i64 + gap).max(0) as u128 * 8;
        let nanos = frame_bits * 1_000_000_000 / bits_per_second as u128;
        Self::with_interval(Duration::from_nanos(nanos.min(u64::MAX as u128) as u64))
    }

    /// 초당 `permits`개
    pub fn per_second(permits: u64) -> Self {
        if permits == 0 {
            return Self::unlimited();
        }
        Self::with_interval(Duration::from_nanos(1_000_000_000 / permits))
    }

    /// 제한 없음
    pub fn unlimited() -> Self {
        Self::with_interval(Duration::ZERO)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            next: Mutex::new(Instant::now()),
        }
    }

    /// 허가 간격
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 다음 허가까지 대기
    ///
    /// 유휴 후에도 누적 버스트는 허용하지 않음
    pub async fn acquire(&self) {
        if self.interval.is_zero() {
            return;
        }
        let mut next = self.next.lock().await;
        let now = Instant::now();
        if *next > now {
            sleep_until(*next).await;
        }
        *next = (*next).max(now) + self.interval;
    }
}
