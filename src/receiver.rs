//! 수신측 재조립
//!
//! - 리스닝 소켓 하나당 `Reassembler` 하나, 작업(TransferJob)은 최대 하나
//! - 오프셋 기반 비트맵으로 순서/중복과 무관하게 완료 판정
//! - 앞에서부터 연속된 바이트는 버퍼 sink에서 바로 해시 (재읽기 없음)
//! - 완료된 스트림은 레코드 단위로 검증 후 하위(`FlowFileSink`)로 전달
//!
//! ```text
//! Idle ──chunk──▶ Receiving ──마지막 청크──▶ Complete ──▶ Dispatch ──▶ Idle
//!                    │  ▲
//!                    └──┘ 다른 StreamID: 기존 작업 폐기 후 새 작업
//! ```

use std::io::{self, Read, Seek, SeekFrom};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bitmap::ChunkBitmap;
use crate::buffer::{BufferReader, ContiguousSink, HybridBuffer};
use crate::config::{Config, Endpoints};
use crate::flowfile::{
    check_digest, declared_checksum, parse_header, update_chain, Attributes, ChecksumKind,
    HeaderParse, RecordInfo, Scanner, StreamHasher,
};
use crate::packet::{self, PacketHeader, StreamId};
use crate::pool::bind_socket;
use crate::stats::{SharedStats, TransferStats};
use crate::{Error, Result};

/// 스트리밍 해시를 위해 헤더를 모으는 최대 크기
const PEEK_LIMIT: usize = 64 * 1024;

/// 수신 루프 폴링 주기
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 수신 데이터그램 버퍼
const RECV_BUFFER: usize = 65536;

/// 하위 전달 인터페이스
///
/// 검증된 레코드 하나당 한 번 호출됨. `payload`는 정확히 `size` 바이트
pub trait FlowFileSink: Send + Sync {
    fn send(&self, attrs: &Attributes, payload: &mut dyn Read, size: u64) -> Result<()>;
}

/// 스트리밍 해시 결과 (첫 레코드)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digested {
    pub kind: ChecksumKind,
    pub expected: String,
    pub actual: String,
}

enum DigestState {
    /// 속성 헤더 수집 중
    Peeking(Vec<u8>),

    Hashing {
        hasher: StreamHasher,
        kind: ChecksumKind,
        expected: String,
        remaining: u64,
    },

    Finished(Digested),

    /// 스트리밍 해시 불가 (체크섬 없음, 헤더 과대, FlowFile 아님)
    Unavailable,
}

/// 연속 바이트로 첫 레코드의 payload를 해시하는 버퍼 sink
pub struct StreamDigest {
    state: DigestState,
}

impl Default for StreamDigest {
    fn default() -> Self {
        Self {
            state: DigestState::Peeking(Vec::new()),
        }
    }
}

impl StreamDigest {
    /// 첫 레코드 payload를 끝까지 해시했으면 결과 반환
    pub fn verdict(&self) -> Option<&Digested> {
        match &self.state {
            DigestState::Finished(d) => Some(d),
            _ => None,
        }
    }

    fn hash(
        mut hasher: StreamHasher,
        kind: ChecksumKind,
        expected: String,
        remaining: u64,
        data: &[u8],
    ) -> DigestState {
        let take = (data.len() as u64).min(remaining) as usize;
        hasher.update(&data[..take]);
        let remaining = remaining - take as u64;
        if remaining == 0 {
            DigestState::Finished(Digested {
                kind,
                expected,
                actual: hasher.finalize_hex(),
            })
        } else {
            DigestState::Hashing {
                hasher,
                kind,
                expected,
                remaining,
            }
        }
    }
}

impl ContiguousSink for StreamDigest {
    fn on_contiguous_bytes(&mut self, _offset: u64, data: &[u8]) {
        self.state = match std::mem::replace(&mut self.state, DigestState::Unavailable) {
            DigestState::Peeking(mut head) => {
                head.extend_from_slice(data);
                match parse_header(&head) {
                    Ok(HeaderParse::Incomplete) if head.len() <= PEEK_LIMIT => {
                        DigestState::Peeking(head)
                    }
                    Ok(HeaderParse::Complete {
                        attrs,
                        payload_size,
                        header_len,
                    }) => match declared_checksum(&attrs) {
                        Ok(Some((kind, expected))) => Self::hash(
                            kind.hasher(),
                            kind,
                            expected,
                            payload_size,
                            &head[header_len..],
                        ),
                        _ => DigestState::Unavailable,
                    },
                    _ => DigestState::Unavailable,
                }
            }
            DigestState::Hashing {
                hasher,
                kind,
                expected,
                remaining,
            } => Self::hash(hasher, kind, expected, remaining, data),
            done => done,
        };
    }
}

/// 청크 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Accepted,
    Duplicate,
    Announce,
    /// 작업과 스트림 크기/청크 크기가 다름
    Mismatch,
}

/// 스트림 하나의 재조립 상태
pub struct TransferJob {
    id: StreamId,
    total_size: u64,
    chunk_size: u16,
    bitmap: ChunkBitmap,
    buffer: HybridBuffer<StreamDigest>,
    source: SocketAddr,
    started: Instant,
    last_seen: Instant,
}

impl TransferJob {
    fn new(header: &PacketHeader, config: &Config, source: SocketAddr) -> Result<Self> {
        let now = Instant::now();
        Ok(Self {
            id: header.stream_id,
            total_size: header.total_size,
            chunk_size: header.chunk_size,
            bitmap: ChunkBitmap::new(header.chunk_count()),
            buffer: HybridBuffer::new(&config.temp_dir, config.buffer_window, StreamDigest::default())?,
            source,
            started: now,
            last_seen: now,
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn received(&self) -> u64 {
        self.bitmap.received()
    }

    pub fn total(&self) -> u64 {
        self.bitmap.total()
    }

    pub fn missing(&self) -> Vec<u64> {
        self.bitmap.missing()
    }

    pub fn is_complete(&self) -> bool {
        self.bitmap.is_complete()
    }

    /// 백업 임시 파일
    pub fn temp_path(&self) -> PathBuf {
        self.buffer.path().to_path_buf()
    }

    /// 검증을 마친 청크 적용. 새 청크만 버퍼에 씀
    fn accept(&mut self, header: &PacketHeader, payload: &[u8]) -> Result<ChunkOutcome> {
        self.last_seen = Instant::now();
        if header.total_size != self.total_size || header.chunk_size != self.chunk_size {
            return Ok(ChunkOutcome::Mismatch);
        }
        if payload.is_empty() {
            return Ok(ChunkOutcome::Announce);
        }
        let Some(idx) = header.chunk_index() else {
            return Ok(ChunkOutcome::Mismatch);
        };
        if self.bitmap.get(idx) {
            return Ok(ChunkOutcome::Duplicate);
        }
        self.buffer.write_at(header.offset, payload)?;
        self.bitmap.set(idx);
        Ok(ChunkOutcome::Accepted)
    }

    fn finish(mut self) -> Result<CompletedStream> {
        let streamed = self.buffer.flush_all()?;
        Ok(CompletedStream {
            id: self.id,
            total_size: self.total_size,
            source: self.source,
            elapsed: self.started.elapsed(),
            bitmap: self.bitmap,
            streamed,
            buffer: self.buffer,
        })
    }
}

enum ReassemblerState {
    Idle { last_completed: Option<StreamId> },
    Receiving(Box<TransferJob>),
}

/// 소켓 하나의 재조립기
pub struct Reassembler {
    config: Arc<Config>,
    stats: SharedStats,
    state: ReassemblerState,
}

impl Reassembler {
    pub fn new(config: Arc<Config>, stats: SharedStats) -> Self {
        Self {
            config,
            stats,
            state: ReassemblerState::Idle {
                last_completed: None,
            },
        }
    }

    /// 진행 중인 작업
    pub fn current_job(&self) -> Option<&TransferJob> {
        match &self.state {
            ReassemblerState::Receiving(job) => Some(&**job),
            ReassemblerState::Idle { .. } => None,
        }
    }

    fn noise(&self, from: SocketAddr, reason: &str) {
        self.stats.write().noise_datagrams += 1;
        debug!(%from, reason, "노이즈 데이터그램 폐기");
    }

    fn start_job(&self, header: &PacketHeader, from: SocketAddr) -> Result<Box<TransferJob>> {
        let job = TransferJob::new(header, &self.config, from)?;
        self.stats.write().streams_started += 1;
        debug!(
            stream = %header.stream_id,
            size = header.total_size,
            chunks = header.chunk_count(),
            %from,
            "새 스트림 수신 시작"
        );
        Ok(Box::new(job))
    }

    /// 데이터그램 하나 처리. 스트림이 완료되면 `CompletedStream` 반환
    pub fn handle_datagram(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
    ) -> Result<Option<CompletedStream>> {
        let Some((header, payload)) = packet::decode(datagram) else {
            self.noise(from, "헤더 디코딩 실패");
            return Ok(None);
        };
        if header.total_size > self.config.max_stream_size {
            self.noise(from, "스트림 크기 초과");
            return Ok(None);
        }
        let announce = payload.is_empty() && header.offset == 0;
        if !announce
            && (header.chunk_index().is_none() || payload.len() != header.expected_payload_len())
        {
            self.noise(from, "청크 경계 불일치");
            return Ok(None);
        }

        let idle = ReassemblerState::Idle {
            last_completed: None,
        };
        let mut job = match std::mem::replace(&mut self.state, idle) {
            ReassemblerState::Receiving(job) if job.id == header.stream_id => job,
            ReassemblerState::Receiving(job) => {
                info!(
                    stream = %job.id,
                    received = job.received(),
                    total = job.total(),
                    next = %header.stream_id,
                    "미완료 스트림 폐기 (새 스트림 도착)"
                );
                self.stats.write().streams_superseded += 1;
                drop(job);
                self.start_job(&header, from)?
            }
            ReassemblerState::Idle { last_completed } if last_completed == Some(header.stream_id) => {
                // 완료 후 도착한 재전송
                self.state = ReassemblerState::Idle { last_completed };
                return Ok(None);
            }
            ReassemblerState::Idle { .. } => self.start_job(&header, from)?,
        };

        let was_direct = job.buffer.is_direct();
        let outcome = match job.accept(&header, payload) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(stream = %job.id, offset = header.offset, "청크 쓰기 실패, 작업 폐기: {}", e);
                return Err(e);
            }
        };

        {
            let mut stats = self.stats.write();
            match outcome {
                ChunkOutcome::Accepted => {
                    stats.chunks_accepted += 1;
                    stats.bytes_received += payload.len() as u64;
                }
                ChunkOutcome::Duplicate => stats.chunks_duplicate += 1,
                ChunkOutcome::Mismatch => stats.noise_datagrams += 1,
                ChunkOutcome::Announce => {}
            }
            if !was_direct && job.buffer.is_direct() {
                stats.buffer_fallbacks += 1;
            }
        }

        if !job.is_complete() {
            self.state = ReassemblerState::Receiving(job);
            return Ok(None);
        }

        let id = job.id;
        self.state = ReassemblerState::Idle {
            last_completed: Some(id),
        };
        let direct_before_finish = job.buffer.is_direct();
        let completed = job.finish()?;
        {
            let mut stats = self.stats.write();
            stats.streams_completed += 1;
            if !direct_before_finish && completed.buffer.is_direct() {
                stats.buffer_fallbacks += 1;
            }
        }
        info!(
            stream = %id,
            size = completed.total_size,
            elapsed_ms = completed.elapsed.as_millis() as u64,
            streamed = completed.streamed,
            "스트림 수신 완료"
        );
        Ok(Some(completed))
    }

    /// 유휴 시간을 넘긴 작업 폐기. 폐기했으면 true
    pub fn expire_idle(&mut self, now: Instant) -> bool {
        let Some(timeout) = self.config.job_idle_timeout else {
            return false;
        };
        let expired = match &self.state {
            ReassemblerState::Receiving(job) => now.saturating_duration_since(job.last_seen) >= timeout,
            ReassemblerState::Idle { .. } => false,
        };
        if !expired {
            return false;
        }
        if let ReassemblerState::Receiving(job) = std::mem::replace(
            &mut self.state,
            ReassemblerState::Idle {
                last_completed: None,
            },
        ) {
            info!(
                stream = %job.id,
                received = job.received(),
                total = job.total(),
                "유휴 스트림 만료"
            );
        }
        self.stats.write().streams_expired += 1;
        true
    }
}

/// 레코드 전달 결과
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// 스캔된 레코드 수
    pub records: usize,
    pub forwarded: usize,
    /// 체크섬 실패로 거부된 수
    pub rejected: usize,
    /// 하위 전달 실패 수
    pub failed: usize,
    /// 스트림 뒷부분이 FlowFile로 해석되지 않음
    pub malformed: bool,
}

/// 재조립이 끝난 스트림
pub struct CompletedStream {
    pub id: StreamId,
    pub total_size: u64,
    pub source: SocketAddr,
    pub elapsed: Duration,
    bitmap: ChunkBitmap,
    /// 모든 바이트가 스트리밍 해시 sink를 거쳤는지
    streamed: bool,
    buffer: HybridBuffer<StreamDigest>,
}

impl CompletedStream {
    /// 청크별 수신 여부 (0/1)
    pub fn chunk_map(&self) -> Vec<u8> {
        self.bitmap.to_vec()
    }

    pub fn streamed(&self) -> bool {
        self.streamed
    }

    /// 첫 레코드의 스트리밍 해시 결과
    pub fn streamed_digest(&self) -> Option<&Digested> {
        self.buffer.sink().verdict()
    }

    /// 재조립된 바이트 리더
    pub fn reader(&mut self) -> BufferReader<'_, StreamDigest> {
        self.buffer.reader()
    }

    /// 레코드 단위로 검증/전달
    ///
    /// 체크섬이 맞지 않는 레코드는 로그 후 건너뛰고 나머지는 계속 전달
    pub fn dispatch(
        mut self,
        sink: &dyn FlowFileSink,
        config: &Config,
        stats: &SharedStats,
    ) -> Result<DispatchReport> {
        let id = self.id;
        let streamed = self.streamed_digest().cloned();
        let mut report = DispatchReport::default();
        let mut scanner = Scanner::new(self.buffer.reader())?;

        while let Some(next) = scanner.next() {
            let record = match next {
                Ok(record) => record,
                Err(e) => {
                    warn!(stream = %id, records = report.records, "레코드 해석 실패: {}", e);
                    report.malformed = true;
                    break;
                }
            };
            report.records += 1;
            let filename = record.attrs.get("filename").unwrap_or("").to_string();

            if config.verify_checksums {
                let verdict = match (report.records, &streamed) {
                    (1, Some(digest)) => check_digest(&digest.expected, digest.actual.clone()),
                    _ => verify_record(scanner.get_mut(), &record),
                };
                if let Err(e) = verdict {
                    warn!(
                        stream = %id,
                        filename = %filename,
                        size = record.payload_size,
                        "체크섬 검증 실패, 레코드 폐기: {}",
                        e
                    );
                    stats.write().checksum_failures += 1;
                    report.rejected += 1;
                    continue;
                }
            }

            let mut attrs = record.attrs.clone();
            update_chain(&mut attrs, "UDP-TO-HTTP", config);

            let reader = scanner.get_mut();
            reader.seek(SeekFrom::Start(record.payload_offset))?;
            let mut payload = reader.by_ref().take(record.payload_size);
            match sink.send(&attrs, &mut payload, record.payload_size) {
                Ok(()) => {
                    info!(stream = %id, filename = %filename, size = record.payload_size, "레코드 전달");
                    stats.write().records_forwarded += 1;
                    report.forwarded += 1;
                }
                Err(e) => {
                    warn!(stream = %id, filename = %filename, "레코드 전달 실패: {}", e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

/// 레코드 payload를 다시 읽어 체크섬 검증
fn verify_record<R: Read + Seek>(reader: &mut R, record: &RecordInfo) -> Result<()> {
    let (kind, expected) = declared_checksum(&record.attrs)?.ok_or(Error::ChecksumMissing)?;
    let mut hasher = kind.hasher();
    reader.seek(SeekFrom::Start(record.payload_offset))?;
    let copied = io::copy(&mut reader.by_ref().take(record.payload_size), &mut hasher)?;
    if copied != record.payload_size {
        return Err(Error::TruncatedFlowFile);
    }
    check_digest(&expected, hasher.finalize_hex())
}

/// 파일 I/O가 섞인 동기 작업 실행
///
/// 멀티스레드 런타임이면 `block_in_place`로 다른 수신 루프를 막지 않음
fn off_runtime<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current().map(|h| h.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(f),
        _ => f(),
    }
}

/// 소켓 하나의 수신 루프
async fn listen(
    socket: UdpSocket,
    mut reassembler: Reassembler,
    sink: Arc<dyn FlowFileSink>,
    running: Arc<AtomicBool>,
) {
    let local = socket.local_addr().ok();
    let mut buf = vec![0u8; RECV_BUFFER];

    while running.load(Ordering::SeqCst) {
        match tokio::time::timeout(POLL_INTERVAL, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => match off_runtime(|| {
                reassembler.handle_datagram(&buf[..len], from)
            }) {
                Ok(Some(completed)) => {
                    let sink = sink.clone();
                    let config = reassembler.config.clone();
                    let stats = reassembler.stats.clone();
                    tokio::task::spawn_blocking(move || {
                        let id = completed.id;
                        match completed.dispatch(sink.as_ref(), &config, &stats) {
                            Ok(report) => debug!(stream = %id, ?report, "전달 완료"),
                            Err(e) => warn!(stream = %id, "전달 실패: {}", e),
                        }
                    });
                }
                Ok(None) => {}
                Err(e) => warn!(?local, "데이터그램 처리 실패: {}", e),
            },
            Ok(Err(e)) => warn!(?local, "수신 에러: {}", e),
            Err(_) => {
                // 타임아웃, 계속
            }
        }
        off_runtime(|| reassembler.expire_idle(Instant::now()));
    }

    debug!(?local, "수신 루프 종료");
}

/// 수신기 핸들 (포트마다 수신 루프 하나)
pub struct Receiver {
    running: Arc<AtomicBool>,
    stats: SharedStats,
    local_addrs: Vec<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl Receiver {
    /// 포트 범위에 바인드 후 시작
    pub async fn start(
        config: Config,
        endpoints: &Endpoints,
        sink: Arc<dyn FlowFileSink>,
    ) -> Result<Self> {
        let mut sockets = Vec::with_capacity(endpoints.len());
        for addr in endpoints.resolve().await? {
            sockets.push(bind_socket(addr, config.recv_buffer_size, 0)?);
        }
        Self::bind(config, sockets, sink)
    }

    /// 이미 바인드된 소켓으로 시작
    pub fn bind(config: Config, sockets: Vec<UdpSocket>, sink: Arc<dyn FlowFileSink>) -> Result<Self> {
        let config = Arc::new(config);
        let stats = TransferStats::shared();
        let running = Arc::new(AtomicBool::new(true));

        let mut local_addrs = Vec::with_capacity(sockets.len());
        let mut tasks = Vec::with_capacity(sockets.len());
        for socket in sockets {
            let addr = socket.local_addr()?;
            info!("FlowFile UDP receiver listening on {}", addr);
            local_addrs.push(addr);

            let reassembler = Reassembler::new(config.clone(), stats.clone());
            tasks.push(tokio::spawn(listen(
                socket,
                reassembler,
                sink.clone(),
                running.clone(),
            )));
        }

        Ok(Self {
            running,
            stats,
            local_addrs,
            tasks,
        })
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// 통계 반환
    pub fn stats(&self) -> TransferStats {
        self.stats.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 정지 (수신 루프 종료 대기)
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowfile::FlowFile;
    use parking_lot::Mutex;
    use rand::seq::SliceRandom;

    #[derive(Default)]
    struct Collect {
        records: Mutex<Vec<FlowFile>>,
    }

    impl FlowFileSink for Collect {
        fn send(&self, attrs: &Attributes, payload: &mut dyn Read, size: u64) -> Result<()> {
            let mut data = Vec::new();
            payload.read_to_end(&mut data)?;
            assert_eq!(data.len() as u64, size);
            self.records.lock().push(FlowFile::new(attrs.clone(), data));
            Ok(())
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 253) as u8).collect()
    }

    fn test_config(dir: &std::path::Path) -> Arc<Config> {
        Arc::new(Config {
            temp_dir: dir.to_path_buf(),
            ..Config::default()
        })
    }

    /// 인코딩 길이가 정확히 `total`인 체크섬 레코드
    fn record_of_len(name: &str, total: usize) -> FlowFile {
        let mut probe = FlowFile::from_file_contents(name, "./", Vec::new());
        probe.add_checksum(ChecksumKind::Sha256);
        let payload_len = total - probe.attrs.encoded_len();

        let mut ff = FlowFile::from_file_contents(name, "./", sample(payload_len));
        ff.add_checksum(ChecksumKind::Sha256);
        assert_eq!(ff.encoded_len(), total as u64);
        ff
    }

    fn feed(
        reassembler: &mut Reassembler,
        datagrams: &[Vec<u8>],
    ) -> Vec<CompletedStream> {
        datagrams
            .iter()
            .filter_map(|d| reassembler.handle_datagram(d, peer()).unwrap())
            .collect()
    }

    fn read_back(done: &mut CompletedStream) -> Vec<u8> {
        let mut out = Vec::new();
        done.reader().read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_out_of_order_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let stats = TransferStats::shared();
        let mut reassembler = Reassembler::new(config.clone(), stats.clone());

        let ff = record_of_len("scenario.bin", 5000);
        let data = ff.encode();
        let datagrams = packet::fragment(StreamId::random(), &data, 1000);
        assert_eq!(datagrams.len(), 6);

        // 오프셋 3000, 0, 4000, 1000, 2000 순서
        let order: Vec<Vec<u8>> = [4, 1, 5, 2, 3].iter().map(|&i| datagrams[i].clone()).collect();
        let mut done = feed(&mut reassembler, &order);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].chunk_map(), vec![1, 1, 1, 1, 1]);

        // 재전송 패스는 무시됨
        assert!(feed(&mut reassembler, &datagrams).is_empty());

        let done = done.remove(0);
        let sink = Collect::default();
        let report = done.dispatch(&sink, &config, &stats).unwrap();
        assert_eq!(report.forwarded, 1);
        assert_eq!(report.rejected, 0);

        let records = sink.records.lock();
        assert_eq!(records[0].payload, ff.payload);
        assert_eq!(records[0].attrs.get("filename"), Some("scenario.bin"));
        assert_eq!(records[0].attrs.get("custodyChain.0.action"), Some("UDP-TO-HTTP"));
        assert_eq!(stats.read().streams_completed, 1);
    }

    #[test]
    fn test_any_order_with_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let data = sample(25_000);
        let datagrams = packet::fragment(StreamId::random(), &data, 1000);
        let mut rng = rand::thread_rng();

        for _ in 0..10 {
            let mut shuffled = datagrams.clone();
            shuffled.extend(datagrams[3..9].iter().cloned());
            shuffled.shuffle(&mut rng);

            let mut reassembler = Reassembler::new(config.clone(), TransferStats::shared());
            let mut done = feed(&mut reassembler, &shuffled);
            assert_eq!(done.len(), 1);
            assert_eq!(read_back(&mut done[0]), data);
        }
    }

    #[test]
    fn test_size_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let c = 1138usize;

        for n in [0, 1, c - 1, c, c + 1, 10 * c, 10 * c + 1] {
            let data = sample(n);
            let datagrams = packet::fragment(StreamId::random(), &data, c as u16);
            let mut reassembler = Reassembler::new(config.clone(), TransferStats::shared());

            let mut done = feed(&mut reassembler, &datagrams);
            assert_eq!(done.len(), 1, "size {}", n);
            assert_eq!(done[0].total_size, n as u64);
            assert_eq!(read_back(&mut done[0]), data, "size {}", n);
        }
    }

    #[test]
    fn test_withheld_chunk_never_completes() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let datagrams = packet::fragment(StreamId::random(), &sample(10_000), 1000);
        let mut reassembler = Reassembler::new(config, TransferStats::shared());

        let without_seven: Vec<Vec<u8>> = datagrams
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != 8)
            .map(|(_, d)| d.clone())
            .collect();
        for _ in 0..3 {
            assert!(feed(&mut reassembler, &without_seven).is_empty());
        }

        let job = reassembler.current_job().unwrap();
        assert_eq!(job.received(), 9);
        assert_eq!(job.missing(), vec![7]);
    }

    #[test]
    fn test_corrupted_byte_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let stats = TransferStats::shared();

        let ff = record_of_len("x.bin", 8000);
        let mut data = ff.encode();
        let last = data.len() - 10;
        data[last] ^= 0xFF;

        let mut reassembler = Reassembler::new(config.clone(), stats.clone());
        let mut done = feed(&mut reassembler, &packet::fragment(StreamId::random(), &data, 1000));
        let done = done.remove(0);
        assert!(done.streamed());
        assert!(done.streamed_digest().is_some());

        let sink = Collect::default();
        let report = done.dispatch(&sink, &config, &stats).unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(report.forwarded, 0);
        assert!(sink.records.lock().is_empty());
        assert_eq!(stats.read().checksum_failures, 1);
    }

    #[test]
    fn test_direct_mode_still_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config {
            temp_dir: dir.path().to_path_buf(),
            buffer_window: 2000,
            ..Config::default()
        });
        let stats = TransferStats::shared();

        let ff = record_of_len("reverse.bin", 20_000);
        let mut datagrams = packet::fragment(StreamId::random(), &ff.encode(), 1000);
        datagrams.reverse();

        let mut reassembler = Reassembler::new(config.clone(), stats.clone());
        let mut done = feed(&mut reassembler, &datagrams);
        let done = done.remove(0);
        assert!(!done.streamed());
        assert!(done.streamed_digest().is_none());
        assert_eq!(stats.read().buffer_fallbacks, 1);

        let sink = Collect::default();
        let report = done.dispatch(&sink, &config, &stats).unwrap();
        assert_eq!(report.forwarded, 1);
        assert_eq!(sink.records.lock()[0].payload, ff.payload);
    }

    #[test]
    fn test_fallback_on_final_chunk_counted_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config {
            temp_dir: dir.path().to_path_buf(),
            buffer_window: 500,
            ..Config::default()
        });
        let stats = TransferStats::shared();
        let data = sample(1000);
        let datagrams = packet::fragment(StreamId::random(), &data, 1000);

        // announce 없이 청크 하나: 완료시키는 청크가 곧 윈도우를 넘는 청크
        let mut reassembler = Reassembler::new(config, stats.clone());
        let mut done = feed(&mut reassembler, &datagrams[1..]);
        assert_eq!(done.len(), 1);
        assert!(!done[0].streamed());
        assert_eq!(read_back(&mut done[0]), data);
        assert_eq!(stats.read().buffer_fallbacks, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listeners_write_direct_on_multi_thread_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            temp_dir: dir.path().to_path_buf(),
            buffer_window: 1500,
            ..Config::default()
        };
        let sockets = (0..2)
            .map(|_| bind_socket("127.0.0.1:0".parse().unwrap(), 1 << 20, 0).unwrap())
            .collect();
        let sink = Arc::new(Collect::default());
        let mut receiver = Receiver::bind(config, sockets, sink.clone()).unwrap();

        let records = [record_of_len("a.bin", 12_000), record_of_len("b.bin", 9_000)];
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for (ff, dest) in records.iter().zip(receiver.local_addrs()) {
            // 역순 전달로 윈도우를 넘겨 직접 쓰기 모드 유도
            let mut datagrams = packet::fragment(StreamId::random(), &ff.encode(), 1000);
            datagrams.reverse();
            for d in &datagrams {
                client.send_to(d, dest).await.unwrap();
            }
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.records.lock().len() < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        receiver.stop().await;

        let mut got: Vec<FlowFile> = sink.records.lock().clone();
        got.sort_by(|a, b| a.attrs.get("filename").cmp(&b.attrs.get("filename")));
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].payload, records[0].payload);
        assert_eq!(got[1].payload, records[1].payload);
        assert_eq!(receiver.stats().buffer_fallbacks, 2);
    }

    #[test]
    fn test_bad_record_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let stats = TransferStats::shared();

        for corrupt_first in [true, false] {
            let a = record_of_len("a.bin", 3000);
            let b = record_of_len("b.bin", 4000);
            let mut enc_a = a.encode();
            let mut enc_b = b.encode();
            if corrupt_first {
                let i = enc_a.len() - 1;
                enc_a[i] ^= 1;
            } else {
                let i = enc_b.len() - 1;
                enc_b[i] ^= 1;
            }
            enc_a.extend(enc_b);

            let mut reassembler = Reassembler::new(config.clone(), stats.clone());
            let mut done = feed(&mut reassembler, &packet::fragment(StreamId::random(), &enc_a, 1000));
            let sink = Collect::default();
            let report = done.remove(0).dispatch(&sink, &config, &stats).unwrap();

            assert_eq!(report.records, 2);
            assert_eq!(report.forwarded, 1);
            assert_eq!(report.rejected, 1);
            let survivor = if corrupt_first { "b.bin" } else { "a.bin" };
            assert_eq!(sink.records.lock()[0].attrs.get("filename"), Some(survivor));
        }
    }

    #[test]
    fn test_missing_checksum_rejected_unless_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let stats = TransferStats::shared();
        let ff = FlowFile::from_file_contents("plain.txt", "./", b"no checksum here".to_vec());
        let datagrams = packet::fragment(StreamId::random(), &ff.encode(), 1000);

        let mut reassembler = Reassembler::new(config.clone(), stats.clone());
        let done = feed(&mut reassembler, &datagrams).remove(0);
        let report = done.dispatch(&Collect::default(), &config, &stats).unwrap();
        assert_eq!(report.rejected, 1);

        let lenient = Config {
            verify_checksums: false,
            ..(*config).clone()
        };
        let mut reassembler = Reassembler::new(config.clone(), stats.clone());
        let done = feed(&mut reassembler, &datagrams).remove(0);
        let report = done.dispatch(&Collect::default(), &lenient, &stats).unwrap();
        assert_eq!(report.forwarded, 1);
    }

    #[test]
    fn test_new_stream_supersedes() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let stats = TransferStats::shared();
        let mut reassembler = Reassembler::new(config, stats.clone());

        let first = packet::fragment(StreamId::random(), &sample(5000), 1000);
        let second_data = sample(3000);
        let second = packet::fragment(StreamId::random(), &second_data, 1000);

        assert!(feed(&mut reassembler, &first[..3]).is_empty());
        let stale = reassembler.current_job().unwrap().temp_path();
        assert!(stale.exists());

        let mut done = feed(&mut reassembler, &second);
        assert_eq!(done.len(), 1);
        assert_eq!(read_back(&mut done[0]), second_data);
        assert!(!stale.exists());

        // 폐기된 스트림의 나머지 청크는 새 작업으로 시작
        assert!(feed(&mut reassembler, &first[3..]).is_empty());
        assert_eq!(reassembler.current_job().unwrap().received(), 3);

        let s = stats.read();
        assert_eq!(s.streams_superseded, 1);
        assert_eq!(s.streams_started, 3);
    }

    #[test]
    fn test_idle_job_expires() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let stats = TransferStats::shared();
        let mut reassembler = Reassembler::new(config, stats.clone());

        let datagrams = packet::fragment(StreamId::random(), &sample(5000), 1000);
        feed(&mut reassembler, &datagrams[..2]);
        let path = reassembler.current_job().unwrap().temp_path();

        assert!(!reassembler.expire_idle(Instant::now()));
        assert!(reassembler.expire_idle(Instant::now() + Duration::from_secs(601)));
        assert!(reassembler.current_job().is_none());
        assert!(!path.exists());
        assert_eq!(stats.read().streams_expired, 1);
    }

    #[test]
    fn test_noise_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let stats = TransferStats::shared();
        let mut reassembler = Reassembler::new(config, stats.clone());
        let id = StreamId::random();

        // 너무 짧음
        assert!(reassembler.handle_datagram(&[1, 2, 3], peer()).unwrap().is_none());

        // 마지막 청크가 아닌데 짧은 페이로드
        let mut out = Vec::new();
        PacketHeader { stream_id: id, total_size: 5000, offset: 1000, chunk_size: 1000 }
            .encode_datagram(&[0u8; 10], &mut out);
        assert!(reassembler.handle_datagram(&out, peer()).unwrap().is_none());

        // 청크 경계가 아닌 오프셋
        PacketHeader { stream_id: id, total_size: 5000, offset: 1500, chunk_size: 1000 }
            .encode_datagram(&[0u8; 1000], &mut out);
        assert!(reassembler.handle_datagram(&out, peer()).unwrap().is_none());

        // 최대 크기 초과
        PacketHeader { stream_id: id, total_size: u64::MAX, offset: 0, chunk_size: 1000 }
            .encode_datagram(&[0u8; 1000], &mut out);
        assert!(reassembler.handle_datagram(&out, peer()).unwrap().is_none());

        assert!(reassembler.current_job().is_none());
        assert_eq!(stats.read().noise_datagrams, 4);
    }

    #[test]
    fn test_streaming_digest_across_small_writes() {
        let ff = record_of_len("d.bin", 3000);
        let data = ff.encode();
        let mut digest = StreamDigest::default();

        let mut offset = 0;
        for piece in data.chunks(7) {
            digest.on_contiguous_bytes(offset, piece);
            offset += piece.len() as u64;
        }
        let verdict = digest.verdict().unwrap();
        assert_eq!(verdict.kind, ChecksumKind::Sha256);
        assert_eq!(verdict.expected, verdict.actual);

        let mut not_flowfile = StreamDigest::default();
        not_flowfile.on_contiguous_bytes(0, b"plain bytes, not a package");
        assert!(not_flowfile.verdict().is_none());
    }
}
