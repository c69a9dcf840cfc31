//! 송신 워커 풀
//!
//! 워커 = UDP 소켓 + 목적지 + throttle + 재전송용 버퍼.
//! 체크아웃한 워커는 `WorkerLease`가 drop될 때 버퍼를 비우고 반환됨

use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::buffer::HybridBuffer;
use crate::config::{Config, Endpoints};
use crate::packet::PacketHeader;
use crate::throttle::Throttle;
use crate::{Error, Result};

/// socket2로 커널 버퍼 크기를 잡은 뒤 tokio 소켓으로 변환
pub fn bind_socket(addr: SocketAddr, recv_buffer: usize, send_buffer: usize) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if recv_buffer > 0 {
        if let Err(e) = socket.set_recv_buffer_size(recv_buffer) {
            warn!(%addr, size = recv_buffer, "수신 버퍼 크기 설정 실패: {}", e);
        }
    }
    if send_buffer > 0 {
        if let Err(e) = socket.set_send_buffer_size(send_buffer) {
            warn!(%addr, size = send_buffer, "송신 버퍼 크기 설정 실패: {}", e);
        }
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// 송신 워커
pub struct Worker {
    /// 워커 번호
    pub id: usize,

    socket: UdpSocket,
    dest: SocketAddr,
    throttle: Arc<Throttle>,

    /// 재전송용 스트림 사본
    buffer: HybridBuffer,

    /// 데이터그램 조립 버퍼
    scratch: Vec<u8>,
}

impl Worker {
    pub fn new(
        id: usize,
        socket: UdpSocket,
        dest: SocketAddr,
        throttle: Arc<Throttle>,
        buffer: HybridBuffer,
    ) -> Self {
        Self {
            id,
            socket,
            dest,
            throttle,
            buffer,
            scratch: Vec::new(),
        }
    }

    pub fn dest(&self) -> SocketAddr {
        self.dest
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn buffer_mut(&mut self) -> &mut HybridBuffer {
        &mut self.buffer
    }

    /// throttle 허가를 받은 뒤 데이터그램 하나 전송
    pub async fn send_datagram(&mut self, header: &PacketHeader, payload: &[u8]) -> Result<()> {
        header.encode_datagram(payload, &mut self.scratch);
        self.throttle.acquire().await;
        let written = self.socket.send_to(&self.scratch, self.dest).await?;
        if written != self.scratch.len() {
            return Err(Error::ShortWrite {
                expected: self.scratch.len(),
                written,
            });
        }
        Ok(())
    }
}

struct PoolInner {
    idle: Mutex<Vec<Worker>>,
    available: Arc<Semaphore>,
    size: usize,
}

/// 워커 풀
///
/// 유휴 워커 목록은 내부 락으로, 대기는 세마포어로 처리
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// 소스/목적지 포트를 1:1로 짝지어 워커 생성
    pub async fn bind(config: &Config, src: &Endpoints, dst: &Endpoints) -> Result<Self> {
        if src.len() != dst.len() || src.is_empty() {
            return Err(Error::InvalidPortSpec(format!(
                "소스 포트 {}개와 목적지 포트 {}개가 맞지 않음",
                src.len(),
                dst.len()
            )));
        }

        let frame = config.max_datagram_payload();
        let shared = config
            .throttle_shared
            .then(|| Arc::new(Throttle::new(config.throttle_bps, frame, config.throttle_gap)));
        if shared.is_some() {
            info!(bps = config.throttle_bps, "전체 워커 공유 throttle");
        } else {
            info!(bps = config.throttle_bps, "워커별 throttle");
        }

        let src_addrs = src.resolve().await?;
        let dst_addrs = dst.resolve().await?;

        let mut workers = Vec::with_capacity(src_addrs.len());
        for (id, (local, dest)) in src_addrs.into_iter().zip(dst_addrs).enumerate() {
            let socket = bind_socket(local, 0, config.send_buffer_size)?;
            let throttle = match &shared {
                Some(t) => t.clone(),
                None => Arc::new(Throttle::new(config.throttle_bps, frame, config.throttle_gap)),
            };
            let buffer = HybridBuffer::new(&config.temp_dir, config.buffer_window, Default::default())?;
            debug!(worker = id, %local, %dest, "워커 생성");
            workers.push(Worker::new(id, socket, dest, throttle, buffer));
        }

        Ok(Self::from_workers(workers))
    }

    /// 이미 만든 워커로 풀 구성
    pub fn from_workers(workers: Vec<Worker>) -> Self {
        let size = workers.len();
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(workers),
                available: Arc::new(Semaphore::new(size)),
                size,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// 지금 바로 쓸 수 있는 워커 수
    pub fn available(&self) -> usize {
        self.inner.available.available_permits()
    }

    /// 워커 체크아웃. 모두 사용 중이면 반환될 때까지 대기
    pub async fn checkout(&self) -> Result<WorkerLease> {
        let permit = self
            .inner
            .available
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::PoolClosed)?;
        let worker = self.inner.idle.lock().pop().ok_or(Error::PoolClosed)?;
        Ok(WorkerLease {
            worker: Some(worker),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// 이후 체크아웃 거부
    pub fn close(&self) {
        self.inner.available.close();
    }
}

/// 체크아웃된 워커
///
/// drop 시 버퍼를 비우고 풀에 반환한 뒤 허가를 돌려줌
pub struct WorkerLease {
    worker: Option<Worker>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for WorkerLease {
    type Target = Worker;

    fn deref(&self) -> &Worker {
        // drop 전까지 항상 Some
        self.worker.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for WorkerLease {
    fn deref_mut(&mut self) -> &mut Worker {
        self.worker.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            if let Err(e) = worker.buffer.reset() {
                warn!(worker = worker.id, "버퍼 초기화 실패: {}", e);
            }
            self.pool.idle.lock().push(worker);
        }
    }
}
