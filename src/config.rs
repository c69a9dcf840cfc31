//! 전송 설정
//!
//! - `Config`: 송신/수신 공통 설정
//! - `Endpoints`: `host:2100-2104,2106` 형식의 포트 범위 지정

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::flowfile::{Attributes, ChecksumKind};
use crate::packet::header_size;
use crate::{Error, Result, IPV4_UDP_OVERHEAD, MIN_CHUNK_SIZE};

/// FlowFile UDP 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 최대 전송 단위 (IP/UDP 헤더 포함)
    pub mtu: usize,

    /// 첫 전송과 재전송 사이의 지연
    /// 0이면 재전송 비활성화
    pub resend_delay: Duration,

    /// 데이터 전 빈 announce 패킷 전송 여부
    pub send_announce: bool,

    /// 대역폭 제한 (bits/sec)
    pub throttle_bps: u64,

    /// 매체 프레임 간격 보정 (바이트, 음수 가능)
    pub throttle_gap: i64,

    /// 모든 워커가 하나의 throttle 공유 (비권장)
    pub throttle_shared: bool,

    /// 체크섬이 없을 때 추가할 알고리즘
    pub checksum_type: ChecksumKind,

    /// 체크섬 없는 레코드에 체크섬 추가
    pub add_checksum: bool,

    /// 수신측 체크섬 검증 여부
    pub verify_checksums: bool,

    /// 최대 동시 송신 스트림 수 (재전송 포함)
    pub max_concurrent_sends: usize,

    /// 임시 파일 디렉토리
    pub temp_dir: PathBuf,

    /// 하이브리드 버퍼 메모리 윈도우 (바이트)
    pub buffer_window: usize,

    /// 수신 소켓 버퍼 크기
    pub recv_buffer_size: usize,

    /// 송신 소켓 버퍼 크기
    pub send_buffer_size: usize,

    /// 미완료 작업 유휴 만료 시간
    /// None이면 새 스트림이 올 때까지 유지
    pub job_idle_timeout: Option<Duration>,

    /// 허용하는 최대 스트림 크기 (바이트)
    pub max_stream_size: u64,

    /// custodyChain 속성 갱신 여부
    pub update_chain: bool,

    /// custodyChain.0.local.hostname 값
    pub hostname: Option<String>,

    /// 모든 레코드에 추가할 속성
    pub extra_attributes: Attributes,

    /// 상위 연결 생존 확인 주기
    pub liveness_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mtu: crate::DEFAULT_MTU,
            resend_delay: Duration::from_secs(1),
            send_announce: true,
            throttle_bps: 83_886_080, // 80Mbps
            throttle_gap: 0,
            throttle_shared: false,
            checksum_type: ChecksumKind::Sha256,
            add_checksum: true,
            verify_checksums: true,
            max_concurrent_sends: 20,
            temp_dir: std::env::temp_dir(),
            buffer_window: 1 << 20,            // 1MB
            recv_buffer_size: 2 * 1024 * 1024, // 2MB
            send_buffer_size: 2 * 1024 * 1024, // 2MB
            job_idle_timeout: Some(Duration::from_secs(600)),
            max_stream_size: 16 << 30, // 16GB
            update_chain: true,
            hostname: None,
            extra_attributes: Attributes::new(),
            liveness_poll_interval: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 손실이 많은 링크용 설정
    pub fn lossy_link() -> Self {
        Self {
            resend_delay: Duration::from_secs(3),
            buffer_window: 8 << 20,            // 8MB, 순서 뒤바뀜 흡수
            recv_buffer_size: 8 * 1024 * 1024, // 8MB
            send_buffer_size: 8 * 1024 * 1024,
            job_idle_timeout: Some(Duration::from_secs(1800)),
            ..Self::default()
        }
    }

    /// UDP 페이로드 최대 크기 (MTU - IPv4/UDP 헤더)
    pub fn max_datagram_payload(&self) -> usize {
        self.mtu.saturating_sub(IPV4_UDP_OVERHEAD)
    }

    /// 패킷 헤더를 뺀 청크 크기
    pub fn chunk_size(&self) -> Result<u16> {
        let chunk = self.max_datagram_payload() as i64 - header_size() as i64;
        if chunk < MIN_CHUNK_SIZE as i64 || chunk > u16::MAX as i64 {
            return Err(Error::InvalidMtu {
                mtu: self.mtu,
                chunk_size: chunk,
            });
        }
        Ok(chunk as u16)
    }

    /// 추가 속성 파일 로드 (`name: value`, `#` 주석)
    pub fn load_attributes(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let text = std::fs::read_to_string(path)?;
        let mut loaded = 0;
        for line in text.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            if let Some((name, value)) = line.split_once(':') {
                self.extra_attributes.set(name.trim(), value.trim());
                loaded += 1;
            }
        }
        Ok(loaded)
    }
}

/// 호스트 + 포트 목록
///
/// 포트 하나당 워커(송신) 또는 리스너(수신) 하나가 만들어짐
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub host: String,
    pub ports: Vec<u16>,
}

impl Endpoints {
    /// `host:2100-2104,2106` 파싱
    pub fn parse(input: &str) -> Result<Self> {
        let (host, ports) = input
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidPortSpec(input.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(Self {
            host: host.to_string(),
            ports: parse_port_range(ports)?,
        })
    }

    /// 포트 수
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// 각 포트를 소켓 주소로 해석
    pub async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let host = if self.host.is_empty() {
            "0.0.0.0"
        } else {
            self.host.as_str()
        };
        let mut addrs = Vec::with_capacity(self.ports.len());
        for &port in &self.ports {
            let addr = tokio::net::lookup_host((host, port))
                .await?
                .next()
                .ok_or_else(|| Error::InvalidPortSpec(format!("{}:{}", host, port)))?;
            addrs.push(addr);
        }
        Ok(addrs)
    }
}

/// `500ms`, `2s`, `10m`, `1h` 형식 (단위 없으면 초)
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(input.len());
    let (num, unit) = input.split_at(split);
    let value: f64 = num.parse().ok()?;
    let secs = match unit.trim() {
        "ms" => value / 1000.0,
        "" | "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return None,
    };
    (secs >= 0.0 && secs.is_finite()).then(|| Duration::from_secs_f64(secs))
}

/// 쉼표 구분 단일 포트와 하이픈 범위 파싱
///
/// 결과는 정렬/중복 제거됨. 1024 이하 포트는 거부
pub fn parse_port_range(input: &str) -> Result<Vec<u16>> {
    let invalid = || Error::InvalidPortSpec(input.to_string());
    let mut ports = BTreeSet::new();

    for part in input.split(',') {
        let part = part.trim();
        let (start, end) = match part.split_once('-') {
            Some((a, b)) => (a.trim(), b.trim()),
            None => (part, part),
        };
        let start: u32 = start.parse().map_err(|_| invalid())?;
        let end: u32 = end.parse().map_err(|_| invalid())?;
        if start > end {
            return Err(invalid());
        }
        for port in start..=end {
            if port <= 1024 || port > u16::MAX as u32 {
                return Err(Error::InvalidPortSpec(format!("포트 범위 밖: {}", port)));
            }
            ports.insert(port as u16);
        }
    }

    Ok(ports.into_iter().collect())
}
