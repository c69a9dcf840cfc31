//! 송신측 분할 전송
//!
//! - 스트림을 청크로 나눠 헤더를 붙이고 워커 소켓으로 전송
//! - 재전송 지연이 설정되면 같은 스트림을 버퍼에서 한 번 더 전송 (ACK 없음)
//! - 상위 연결이 끊기면 (취소 토큰) 재전송 포함 전송 중단

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::flowfile::{declared_checksum, update_chain, FlowFile};
use crate::packet::{PacketHeader, StreamId};
use crate::pool::{WorkerLease, WorkerPool};
use crate::stats::{SharedStats, TransferStats};
use crate::{Error, Result};

/// 한 번의 전송 패스 결과
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PassTotals {
    datagrams: u64,
    bytes: u64,
}

/// 백그라운드 재전송 작업
#[derive(Debug)]
pub struct ResendHandle {
    pub stream_id: StreamId,
    handle: JoinHandle<Result<u64>>,
}

impl ResendHandle {
    /// 재전송 완료 대기. 보낸 데이터그램 수 반환
    pub async fn wait(self) -> Result<u64> {
        self.handle.await.map_err(|_| Error::Cancelled)?
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// 스트림 송신 결과
#[derive(Debug)]
pub struct SendReport {
    pub stream_id: StreamId,
    /// 첫 패스에서 보낸 페이로드 바이트
    pub bytes: u64,
    /// 첫 패스 데이터그램 수 (announce 포함)
    pub datagrams: u64,
    /// 재전송이 설정된 경우 진행 중인 재전송
    pub resend: Option<ResendHandle>,
}

/// 스트림 분할 송신기
#[derive(Clone)]
pub struct Fragmenter {
    config: Arc<Config>,
    pool: WorkerPool,
    /// 재전송 포함 동시 스트림 제한
    limit: Arc<Semaphore>,
    chunk_size: u16,
    stats: SharedStats,
}

impl Fragmenter {
    pub fn new(config: Config, pool: WorkerPool) -> Result<Self> {
        let chunk_size = config.chunk_size()?;
        info!(
            chunk_size,
            workers = pool.size(),
            max_sessions = config.max_concurrent_sends,
            resend_ms = config.resend_delay.as_millis() as u64,
            "FlowFile UDP sender ready"
        );
        Ok(Self {
            limit: Arc::new(Semaphore::new(config.max_concurrent_sends.max(1))),
            config: Arc::new(config),
            pool,
            chunk_size,
            stats: TransferStats::shared(),
        })
    }

    pub fn chunk_size(&self) -> u16 {
        self.chunk_size
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn stats(&self) -> TransferStats {
        self.stats.read().clone()
    }

    /// 인코딩된 스트림 전송
    ///
    /// 첫 패스가 끝나면 반환. 재전송은 `SendReport::resend`에서 계속되며
    /// 그동안 워커와 동시성 허가를 붙잡고 있음
    pub async fn send_stream<R>(
        &self,
        stream_id: StreamId,
        reader: R,
        total: u64,
        cancel: CancellationToken,
    ) -> Result<SendReport>
    where
        R: AsyncRead + Unpin,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if total > self.config.max_stream_size {
            return Err(Error::StreamTooLarge {
                size: total,
                max: self.config.max_stream_size,
            });
        }

        let permit = tokio::select! {
            permit = self.limit.clone().acquire_owned() => permit.map_err(|_| Error::PoolClosed)?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        let mut worker = tokio::select! {
            worker = self.pool.checkout() => worker?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        let header = PacketHeader::new(stream_id, total, self.chunk_size);
        debug!(stream = %stream_id, worker = worker.id, size = total, "전송 시작");

        let first = match self.first_pass(&mut worker, header, reader, &cancel).await {
            Ok(totals) => totals,
            Err(e) => {
                self.stats.write().aborted_sends += 1;
                warn!(stream = %stream_id, worker = worker.id, "전송 중단: {}", e);
                return Err(e);
            }
        };
        {
            let mut stats = self.stats.write();
            stats.datagrams_sent += first.datagrams;
            stats.bytes_sent += first.bytes;
        }

        let resend = if self.config.resend_delay.is_zero() {
            None
        } else {
            let handle = tokio::spawn(resend_pass(
                worker,
                permit,
                header,
                self.config.clone(),
                self.stats.clone(),
                cancel,
            ));
            Some(ResendHandle { stream_id, handle })
        };

        Ok(SendReport {
            stream_id,
            bytes: first.bytes,
            datagrams: first.datagrams,
            resend,
        })
    }

    async fn first_pass<R>(
        &self,
        worker: &mut WorkerLease,
        mut header: PacketHeader,
        reader: R,
        cancel: &CancellationToken,
    ) -> Result<PassTotals>
    where
        R: AsyncRead + Unpin,
    {
        let total = header.total_size;
        let mut totals = PassTotals::default();

        if self.config.send_announce || total == 0 {
            worker.send_datagram(&header, &[]).await?;
            totals.datagrams += 1;
        }

        let mut reader = reader.take(total);
        let mut chunk = vec![0u8; self.chunk_size as usize];
        let mut offset = 0u64;
        while offset < total {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let want = (total - offset).min(self.chunk_size as u64) as usize;
            let got = read_full(&mut reader, &mut chunk[..want]).await?;
            if got < want {
                return Err(Error::ShortStream {
                    expected: total,
                    got: offset + got as u64,
                });
            }

            worker.buffer_mut().append(&chunk[..want])?;
            header.offset = offset;
            worker.send_datagram(&header, &chunk[..want]).await?;

            offset += want as u64;
            totals.datagrams += 1;
            totals.bytes += want as u64;
        }

        Ok(totals)
    }

    /// FlowFile 레코드 하나 전송
    ///
    /// uuid 속성을 스트림 ID로 쓰고(없으면 생성), 관리 연속성을 기록한 뒤
    /// 체크섬을 검증하거나 추가해서 전송
    pub async fn send_record(&self, mut record: FlowFile, cancel: CancellationToken) -> Result<SendReport> {
        let parsed = record.attrs.get("uuid").and_then(StreamId::parse);
        let stream_id = match parsed {
            Some(id) => id,
            None => {
                let id = StreamId::random();
                record.attrs.set("uuid", &id.to_string());
                id
            }
        };
        let filename = record.attrs.get("filename").unwrap_or("").to_string();

        if declared_checksum(&record.attrs)?.is_some() {
            if let Err(e) = record.verify() {
                warn!(stream = %stream_id, filename = %filename, "체크섬 검증 실패, 전송 거부: {}", e);
                return Err(e);
            }
        } else if self.config.add_checksum {
            record.add_checksum(self.config.checksum_type);
        }

        update_chain(&mut record.attrs, "HTTP-UDP", &self.config);

        let encoded = record.encode();
        info!(
            stream = %stream_id,
            filename = %filename,
            size = record.size(),
            encoded = encoded.len(),
            "레코드 전송"
        );
        self.send_stream(stream_id, &encoded[..], encoded.len() as u64, cancel)
            .await
    }
}

/// 가능한 만큼 채움. EOF면 읽은 만큼 반환
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// 지연 후 버퍼에서 전체 스트림 재전송
///
/// 끝나면 워커와 허가가 drop되어 풀에 반환됨
async fn resend_pass(
    mut worker: WorkerLease,
    _permit: OwnedSemaphorePermit,
    mut header: PacketHeader,
    config: Arc<Config>,
    stats: SharedStats,
    cancel: CancellationToken,
) -> Result<u64> {
    let stream_id = header.stream_id;
    let result = replay(&mut worker, &mut header, &config, &cancel).await;

    let mut s = stats.write();
    match result {
        Ok(totals) => {
            s.datagrams_sent += totals.datagrams;
            s.bytes_sent += totals.bytes;
            s.resend_passes += 1;
            debug!(stream = %stream_id, datagrams = totals.datagrams, "재전송 완료");
            Ok(totals.datagrams)
        }
        Err(e) => {
            s.aborted_sends += 1;
            warn!(stream = %stream_id, "재전송 중단: {}", e);
            Err(e)
        }
    }
}

async fn replay(
    worker: &mut WorkerLease,
    header: &mut PacketHeader,
    config: &Config,
    cancel: &CancellationToken,
) -> Result<PassTotals> {
    tokio::select! {
        _ = tokio::time::sleep(config.resend_delay) => {}
        _ = cancel.cancelled() => return Err(Error::Cancelled),
    }

    let total = header.total_size;
    let mut totals = PassTotals::default();
    if config.send_announce || total == 0 {
        header.offset = 0;
        worker.send_datagram(header, &[]).await?;
        totals.datagrams += 1;
    }

    let mut chunk = vec![0u8; header.chunk_size as usize];
    let mut offset = 0u64;
    while offset < total {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let n = worker.buffer_mut().read_at(offset, &mut chunk)?;
        if n == 0 {
            return Err(Error::ShortStream {
                expected: total,
                got: offset,
            });
        }
        header.offset = offset;
        worker.send_datagram(header, &chunk[..n]).await?;
        offset += n as u64;
        totals.datagrams += 1;
        totals.bytes += n as u64;
    }
    Ok(totals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::HybridBuffer;
    use crate::packet::decode;
    use crate::pool::{bind_socket, Worker};
    use crate::receiver::{Reassembler, Receiver};
    use crate::sink::ChannelSink;
    use crate::throttle::Throttle;
    use std::io::Read;
    use std::net::SocketAddr;
    use std::path::Path;
    use std::time::{Duration, Instant};
    use tokio::net::UdpSocket;

    /// 청크 크기 1000이 되는 MTU
    const MTU_1000: usize = 1000 + 34 + 28;

    fn test_config(dir: &Path, resend: Duration) -> Config {
        Config {
            mtu: MTU_1000,
            resend_delay: resend,
            temp_dir: dir.to_path_buf(),
            ..Config::default()
        }
    }

    fn test_pool(dir: &Path, dest: SocketAddr, size: usize, throttle: Option<Arc<Throttle>>) -> WorkerPool {
        let workers = (0..size)
            .map(|id| {
                let socket = bind_socket("127.0.0.1:0".parse().unwrap(), 0, 0).unwrap();
                let buffer = HybridBuffer::new(dir, 1 << 16, Default::default()).unwrap();
                let throttle = throttle.clone().unwrap_or_else(|| Arc::new(Throttle::unlimited()));
                Worker::new(id, socket, dest, throttle, buffer)
            })
            .collect();
        WorkerPool::from_workers(workers)
    }

    async fn collect(socket: &UdpSocket, count: usize) -> Vec<(Instant, PacketHeader, usize)> {
        let mut buf = vec![0u8; 65536];
        let mut out = Vec::new();
        while out.len() < count {
            let (n, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let (header, payload) = decode(&buf[..n]).unwrap();
            out.push((Instant::now(), header, payload.len()));
        }
        out
    }

    #[tokio::test]
    async fn test_resend_pass_repeats_stream() {
        let dir = tempfile::tempdir().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let pool = test_pool(dir.path(), peer.local_addr().unwrap(), 1, None);
        let sender = Fragmenter::new(test_config(dir.path(), Duration::from_millis(200)), pool).unwrap();

        let data = vec![5u8; 5000];
        let report = sender
            .send_stream(StreamId::random(), &data[..], 5000, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.datagrams, 6);
        assert_eq!(report.bytes, 5000);

        let got = collect(&peer, 12).await;
        assert_eq!(report.resend.unwrap().wait().await.unwrap(), 6);

        let offsets: Vec<(u64, usize)> = got.iter().map(|(_, h, n)| (h.offset, *n)).collect();
        let pass = vec![(0, 0), (0, 1000), (1000, 1000), (2000, 1000), (3000, 1000), (4000, 1000)];
        assert_eq!(&offsets[..6], &pass[..]);
        assert_eq!(&offsets[6..], &pass[..]);

        let gap = got[6].0.duration_since(got[5].0);
        assert!(gap >= Duration::from_millis(190), "gap {:?}", gap);

        let stats = sender.stats();
        assert_eq!(stats.datagrams_sent, 12);
        assert_eq!(stats.resend_passes, 1);
    }

    #[tokio::test]
    async fn test_worker_held_through_resend() {
        let dir = tempfile::tempdir().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let pool = test_pool(dir.path(), peer.local_addr().unwrap(), 1, None);
        let sender = Fragmenter::new(test_config(dir.path(), Duration::from_millis(300)), pool).unwrap();

        let start = Instant::now();
        let first = sender
            .send_stream(StreamId::random(), &b"first"[..], 5, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(sender.pool().available(), 0);

        // 풀이 비어 있으므로 재전송이 끝날 때까지 대기
        let second = sender
            .send_stream(StreamId::random(), &b"second"[..], 6, CancellationToken::new())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(290));
        first.resend.unwrap().wait().await.unwrap();
        second.resend.unwrap().wait().await.unwrap();
        assert_eq!(sender.pool().available(), 1);
    }

    #[tokio::test]
    async fn test_sizes_reassemble_through_sender() {
        let dir = tempfile::tempdir().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let pool = test_pool(dir.path(), peer.local_addr().unwrap(), 1, None);
        let c = 1000usize;

        let cases = [0, 1, c - 1, c, c + 1, 10 * c, 10 * c + 1]
            .into_iter()
            .map(|n| (n, true))
            .chain([(0, false), (1, false), (10 * c + 1, false)]);

        for (n, announce) in cases {
            let config = Config {
                send_announce: announce,
                ..test_config(dir.path(), Duration::ZERO)
            };
            let sender = Fragmenter::new(config.clone(), pool.clone()).unwrap();
            let data: Vec<u8> = (0..n).map(|i| (i % 199) as u8).collect();

            let report = sender
                .send_stream(StreamId::random(), &data[..], n as u64, CancellationToken::new())
                .await
                .unwrap();
            let expected = (n + c - 1) / c + usize::from(announce || n == 0);
            assert_eq!(report.datagrams as usize, expected, "size {} announce {}", n, announce);
            assert!(report.resend.is_none());

            let mut reassembler = Reassembler::new(Arc::new(config), TransferStats::shared());
            let mut buf = vec![0u8; 65536];
            let mut completed = Vec::new();
            for _ in 0..expected {
                let (len, from) = tokio::time::timeout(Duration::from_secs(5), peer.recv_from(&mut buf))
                    .await
                    .unwrap()
                    .unwrap();
                completed.extend(reassembler.handle_datagram(&buf[..len], from).unwrap());
            }

            assert_eq!(completed.len(), 1, "size {} announce {}", n, announce);
            let mut out = Vec::new();
            completed[0].reader().read_to_end(&mut out).unwrap();
            assert_eq!(out, data, "size {} announce {}", n, announce);
        }
    }

    #[tokio::test]
    async fn test_cancel_aborts_resend() {
        let dir = tempfile::tempdir().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let pool = test_pool(dir.path(), peer.local_addr().unwrap(), 1, None);
        let sender = Fragmenter::new(test_config(dir.path(), Duration::from_secs(30)), pool).unwrap();

        let cancel = CancellationToken::new();
        let report = sender
            .send_stream(StreamId::random(), &[1u8; 3000][..], 3000, cancel.clone())
            .await
            .unwrap();
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), report.resend.unwrap().wait())
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(sender.pool().available(), 1);
        assert_eq!(sender.stats().aborted_sends, 1);

        // 이미 취소된 토큰으로는 시작하지 않음
        let result = sender
            .send_stream(StreamId::random(), &b"x"[..], 1, cancel)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_short_stream_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let pool = test_pool(dir.path(), peer.local_addr().unwrap(), 1, None);
        let sender = Fragmenter::new(test_config(dir.path(), Duration::ZERO), pool).unwrap();

        let result = sender
            .send_stream(StreamId::random(), &[0u8; 1500][..], 2500, CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(Error::ShortStream { expected: 2500, got: 1500 })
        ));
        assert_eq!(sender.pool().available(), 1);
    }

    #[tokio::test]
    async fn test_throttle_paces_datagrams() {
        let dir = tempfile::tempdir().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let throttle = Arc::new(Throttle::per_second(10));
        let pool = test_pool(dir.path(), peer.local_addr().unwrap(), 1, Some(throttle));
        let sender = Fragmenter::new(test_config(dir.path(), Duration::ZERO), pool).unwrap();

        // announce + 29청크 = 30 데이터그램
        let data = vec![3u8; 29_000];
        let start = Instant::now();
        let report = sender
            .send_stream(StreamId::random(), &data[..], data.len() as u64, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.datagrams, 30);
        assert!(start.elapsed() >= Duration::from_millis(2850));
    }

    #[tokio::test]
    async fn test_bad_checksum_refused() {
        let dir = tempfile::tempdir().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let pool = test_pool(dir.path(), peer.local_addr().unwrap(), 1, None);
        let sender = Fragmenter::new(test_config(dir.path(), Duration::ZERO), pool).unwrap();

        let mut record = FlowFile::from_file_contents("bad.bin", "./", &b"payload"[..]);
        record.attrs.set("checksumType", "SHA256");
        record.attrs.set("checksum", "00");

        let result = sender.send_record(record, CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));

        let mut buf = [0u8; 64];
        assert!(tokio::time::timeout(Duration::from_millis(100), peer.recv_from(&mut buf))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_record_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), Duration::from_millis(100));

        let (sink, rx) = ChannelSink::unbounded();
        let socket = bind_socket("127.0.0.1:0".parse().unwrap(), 1 << 20, 0).unwrap();
        let mut receiver = Receiver::bind(config.clone(), vec![socket], Arc::new(sink)).unwrap();
        let dest = receiver.local_addrs()[0];

        let pool = test_pool(dir.path(), dest, 2, None);
        let sender = Fragmenter::new(config, pool).unwrap();

        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 241) as u8).collect();
        let record = FlowFile::from_file_contents("e2e.bin", "./in/", payload.clone());
        let report = sender.send_record(record, CancellationToken::new()).await.unwrap();
        let id = report.stream_id;
        report.resend.unwrap().wait().await.unwrap();

        let got = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got.payload[..], &payload[..]);
        assert_eq!(got.attrs.get("uuid"), Some(id.to_string().as_str()));
        assert_eq!(got.attrs.get("checksumType"), Some("SHA256"));
        assert_eq!(got.attrs.get("custodyChain.0.action"), Some("UDP-TO-HTTP"));
        assert_eq!(got.attrs.get("custodyChain.1.action"), Some("HTTP-UDP"));

        receiver.stop().await;
        let stats = receiver.stats();
        assert_eq!(stats.streams_completed, 1);
    }
}
