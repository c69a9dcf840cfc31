//! 상위 연결 생존 관리
//!
//! 송신 중인 스트림마다 취소 토큰을 등록해 두고, 상위 연결이 끊기면
//! 토큰을 취소해서 진행 중인 전송(재전송 포함)을 중단시킴

use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 연결 키 → 취소 토큰
#[derive(Debug, Default)]
pub struct LivenessTable {
    entries: DashMap<String, CancellationToken>,
}

impl LivenessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 연결 등록. 같은 키가 있으면 기존 토큰 반환
    pub fn register(&self, key: &str) -> CancellationToken {
        self.entries
            .entry(key.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<CancellationToken> {
        self.entries.get(key).map(|t| t.clone())
    }

    /// 연결 종료: 토큰 취소 후 제거. 등록되어 있었으면 true
    pub fn close(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, token)) => {
                token.cancel();
                info!(connection = key, "상위 연결 종료, 전송 중단");
                true
            }
            None => false,
        }
    }

    /// 모든 연결 종료 (프로세스 종료 시)
    pub fn close_all(&self) -> usize {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.iter().filter(|k| self.close(k)).count()
    }

    /// 정상 완료: 취소 없이 제거
    pub fn release(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 주기적으로 `probe`를 호출해 false면 토큰 취소
///
/// 토큰이 (다른 곳에서라도) 취소되면 종료
pub fn spawn_liveness_poll<F>(token: CancellationToken, interval: Duration, probe: F) -> JoinHandle<()>
where
    F: Fn() -> bool + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if !probe() {
                        debug!("생존 확인 실패");
                        token.cancel();
                        break;
                    }
                }
            }
        }
    })
}
