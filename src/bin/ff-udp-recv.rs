//! FlowFile UDP 수신기
//!
//! 포트 범위마다 수신 루프를 띄우고, 재조립된 레코드를
//! 출력 디렉토리에 `<uuid>.flowfile`로 저장
//!
//! 사용법:
//!   cargo run --release --bin ff-udp-recv -- [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin ff-udp-recv -- --listen :2100-2104 --output ./inbox

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use flowfile_udp::config::parse_duration;
use flowfile_udp::{Config, DirectorySink, Endpoints, Receiver};

/// 수신기 설정
struct RecvArgs {
    listen: String,
    output: PathBuf,
    attributes: Option<PathBuf>,
    verbose: bool,
    config: Config,
}

impl Default for RecvArgs {
    fn default() -> Self {
        Self {
            listen: ":2100-2104".to_string(),
            output: PathBuf::from("./inbox"),
            attributes: None,
            verbose: false,
            config: Config::default(),
        }
    }
}

fn parse_args() -> RecvArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RecvArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--listen" | "-l" => {
                if i + 1 < args.len() {
                    config.listen = args[i + 1].clone();
                    i += 1;
                }
            }
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    config.output = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--temp-dir" => {
                if i + 1 < args.len() {
                    config.config.temp_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--mtu" => {
                if i + 1 < args.len() {
                    config.config.mtu = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--window" => {
                if i + 1 < args.len() {
                    config.config.buffer_window = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--idle-timeout" => {
                if i + 1 < args.len() {
                    let timeout = parse_duration(&args[i + 1]).expect("유효한 시간 필요 (예: 10m)");
                    config.config.job_idle_timeout = (!timeout.is_zero()).then_some(timeout);
                    i += 1;
                }
            }
            "--max-size" => {
                if i + 1 < args.len() {
                    config.config.max_stream_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--no-verify" => {
                config.config.verify_checksums = false;
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
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"ff-udp-recv - FlowFile UDP 수신기

UDP로 분할된 FlowFile 스트림을 재조립해서 디렉토리에 저장

사용법:
  cargo run --release --bin ff-udp-recv -- [OPTIONS]

옵션:
  -l, --listen <HOST:PORTS>  수신 포트 범위 (기본: :2100-2104)
  -o, --output <DIR>         출력 디렉토리 (기본: ./inbox)
  --temp-dir <DIR>           임시 파일 디렉토리
  --mtu <N>                  MTU 바이트 (기본: 1200)
  --window <BYTES>           메모리 윈도우 크기 (기본: 1048576)
  --idle-timeout <DUR>       미완료 스트림 만료, 0이면 비활성 (기본: 10m)
  --max-size <BYTES>         최대 스트림 크기 (기본: 16GB)
  --no-verify                체크섬 검증 안 함
  --no-chain                 custodyChain 상세 기록 안 함
  -a, --attributes <FILE>    추가 속성 파일 (name: value)
  -v, --verbose              디버그 로그
  -h, --help                 이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
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

    let endpoints = Endpoints::parse(&args.listen)?;
    let sink = Arc::new(DirectorySink::new(&args.output)?);

    info!("Output directory: {}", args.output.display());
    info!("Memory window: {} bytes", args.config.buffer_window);
    info!("Idle timeout: {:?}", args.config.job_idle_timeout);

    let mut receiver = Receiver::start(args.config, &endpoints, sink).await?;
    info!("Waiting for transfers on {} ports (Ctrl-C to stop)", receiver.local_addrs().len());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    receiver.stop().await;

    info!("{}", receiver.stats().receive_summary());
    Ok(())
}
