//! FlowFile UDP 송신기
//!
//! 파일 또는 FlowFile 패키지를 UDP 워커 풀로 분할 전송
//! - 소스/목적지 포트를 1:1로 묶어 워커 생성
//! - 지연 후 1회 재전송 (ACK 없음, 단방향 링크용)
//! - 워커별 또는 공유 대역폭 제한
//!
//! 사용법:
//!   cargo run --release --bin ff-udp-send -- [OPTIONS] <FILE>...
//!
//! 예시:
//!   # 기본 전송
//!   cargo run --release --bin ff-udp-send -- --dst 10.12.128.249:2100-2104 data.bin
//!
//!   # 40Mbps, 재전송 3초
//!   cargo run --release --bin ff-udp-send -- -d 10.0.0.2:2100 --throttle 41943040 --resend-delay 3s a.bin b.bin

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use flowfile_udp::config::parse_duration;
use flowfile_udp::liveness::spawn_liveness_poll;
use flowfile_udp::{Config, Endpoints, FlowFile, Fragmenter, LivenessTable, WorkerPool};

/// 송신기 설정
struct SendArgs {
    src: String,
    dst: String,
    files: Vec<PathBuf>,
    attributes: Option<PathBuf>,
    verbose: bool,
    config: Config,
}

impl Default for SendArgs {
    fn default() -> Self {
        Self {
            src: ":3100-3104".to_string(),
            dst: "127.0.0.1:2100-2104".to_string(),
            files: Vec::new(),
            attributes: None,
            verbose: false,
            config: Config::default(),
        }
    }
}

fn parse_args() -> SendArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut config = SendArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--src" | "-s" => {
                if i + 1 < args.len() {
                    config.src = args[i + 1].clone();
                    i += 1;
                }
            }
            "--dst" | "-d" => {
                if i + 1 < args.len() {
                    config.dst = args[i + 1].clone();
                    i += 1;
                }
            }
            "--mtu" => {
                if i + 1 < args.len() {
                    config.config.mtu = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--resend-delay" => {
                if i + 1 < args.len() {
                    config.config.resend_delay = parse_duration(&args[i + 1]).expect("유효한 시간 필요 (예: 1s)");
                    i += 1;
                }
            }
            "--no-announce" => {
                config.config.send_announce = false;
            }
            "--throttle" => {
                if i + 1 < args.len() {
                    config.config.throttle_bps = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--throttle-gap" => {
                if i + 1 < args.len() {
                    config.config.throttle_gap = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--throttle-shared" => {
                config.config.throttle_shared = true;
            }
            "--checksum" => {
                if i + 1 < args.len() {
                    config.config.checksum_type = args[i + 1].parse().expect("지원하는 체크섬 필요");
                    i += 1;
                }
            }
            "--no-checksum" => {
                config.config.add_checksum = false;
            }
            "--no-chain" => {
                config.config.update_chain = false;
            }
            "--attributes" | "-a" => {
                if i + 1 < args.len() {
                    config.attributes = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--temp-dir" => {
                if i + 1 < args.len() {
                    config.config.temp_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--max-sessions" => {
                if i + 1 < args.len() {
                    config.config.max_concurrent_sends = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"ff-udp-send - FlowFile UDP 송신기

파일/FlowFile 패키지를 UDP로 분할 전송 (단방향, ACK 없음)

사용법:
  cargo run --release --bin ff-udp-send -- [OPTIONS] <FILE>...

옵션:
  -s, --src <HOST:PORTS>    소스 포트 범위 (기본: :3100-3104)
  -d, --dst <HOST:PORTS>    목적지 포트 범위 (기본: 127.0.0.1:2100-2104)
  --mtu <N>                 MTU 바이트 (기본: 1200)
  --resend-delay <DUR>      재전송 지연, 0s면 비활성 (기본: 1s)
  --no-announce             announce 패킷 생략
  --throttle <BPS>          워커별 대역폭 bits/sec (기본: 83886080 = 80Mbps)
  --throttle-gap <BYTES>    매체 프레임 간격 보정 (기본: 0)
  --throttle-shared         모든 워커가 하나의 throttle 공유 (비권장)
  --checksum <TYPE>         없을 때 추가할 체크섬 SHA256|SHA512|SHA1|MD5|CRC32
  --no-checksum             체크섬 추가 안 함
  --no-chain                custodyChain 상세 기록 안 함
  -a, --attributes <FILE>   추가 속성 파일 (name: value)
  --temp-dir <DIR>          임시 파일 디렉토리
  --max-sessions <N>        최대 동시 전송 수 (기본: 20)
  -v, --verbose             디버그 로그
  -h, --help                이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            other => {
                config.files.push(PathBuf::from(other));
            }
        }
        i += 1;
    }

    config
}

/// 입력 파일을 레코드로 변환 (패키지면 레코드별로 분리)
fn load_records(path: &Path) -> flowfile_udp::Result<Vec<FlowFile>> {
    let data = std::fs::read(path)?;
    if data.starts_with(flowfile_udp::flowfile::MAGIC) {
        return FlowFile::decode_all(&data);
    }
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir = path
        .parent()
        .map(|p| format!("{}/", p.display()))
        .unwrap_or_else(|| "./".to_string());
    Ok(vec![FlowFile::from_file_contents(&filename, &dir, data)])
}

fn local_hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = parse_args();

    // 로깅 설정 (RUST_LOG 우선)
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.attributes {
        let loaded = args.config.load_attributes(path)?;
        info!("Loaded {} attributes from {}", loaded, path.display());
    }
    args.config.hostname = local_hostname();

    if args.files.is_empty() {
        warn!("전송할 파일 없음 (--help 참고)");
        return Ok(());
    }

    let src = Endpoints::parse(&args.src)?;
    let dst = Endpoints::parse(&args.dst)?;
    info!("Source ports: {}:{:?}", src.host, src.ports);
    info!("Destination ports: {}:{:?}", dst.host, dst.ports);
    info!("MTU: {} bytes, chunk: {} bytes", args.config.mtu, args.config.chunk_size()?);
    info!("Resend delay: {:?}", args.config.resend_delay);

    let pool = WorkerPool::bind(&args.config, &src, &dst).await?;
    let poll_interval = args.config.liveness_poll_interval;
    let sender = Fragmenter::new(args.config, pool)?;
    let liveness = Arc::new(LivenessTable::new());

    // Ctrl-C: 진행 중인 전송 모두 중단
    let shutdown = liveness.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let closed = shutdown.close_all();
            warn!("Interrupted, {} transfers cancelled", closed);
        }
    });

    let mut tasks = Vec::new();
    for path in args.files {
        let records = match load_records(&path) {
            Ok(records) => records,
            Err(e) => {
                warn!("{} 읽기 실패: {}", path.display(), e);
                continue;
            }
        };

        let key = path.display().to_string();
        let token: CancellationToken = liveness.register(&key);
        // 입력 파일이 사라지면 전송 중단
        let watched = path.clone();
        let poll = spawn_liveness_poll(token.clone(), poll_interval, move || watched.exists());

        let sender = sender.clone();
        let liveness = liveness.clone();
        tasks.push(tokio::spawn(async move {
            for record in records {
                match sender.send_record(record, token.clone()).await {
                    Ok(report) => {
                        if let Some(resend) = report.resend {
                            if let Err(e) = resend.wait().await {
                                warn!(stream = %report.stream_id, "재전송 실패: {}", e);
                            }
                        }
                    }
                    Err(e) => warn!("{} 전송 실패: {}", key, e),
                }
            }
            poll.abort();
            liveness.release(&key);
        }));
    }

    for task in tasks {
        let _ = task.await;
    }

    info!("{}", sender.stats().send_summary());
    Ok(())
}
