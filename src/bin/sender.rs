//! Meshsend 송신기
//!
//! 이미지 파일 하나를 UDP로 연결된 수신 노드에 전송한다.
//!
//! 사용법:
//!   cargo run --release --bin meshsend-sender -- [OPTIONS]
//!
//! 예시:
//!   # 기본 전송
//!   cargo run --release --bin meshsend-sender -- --peer 127.0.0.1:9500 -f photo.webp
//!
//!   # 빠른 전송 (최소 간격, 자동 조정 끔)
//!   cargo run --release --bin meshsend-sender -- --peer 10.0.0.2:9500 -f photo.jpg --fast

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use meshsend::payload::{FileSource, PayloadSource, StaticSource};
use meshsend::{Config, MeshNode, SendOutcome, Transport, UdpTransport};

/// 송신기 설정
struct SenderArgs {
    bind_addr: SocketAddr,
    node_id: String,
    target: String,
    peer_addr: SocketAddr,
    file_path: Option<PathBuf>,
    log_level: Level,
    config: Config,
}

impl Default for SenderArgs {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            node_id: "!sender".to_string(),
            target: "!receiver".to_string(),
            peer_addr: SocketAddr::from(([127, 0, 0, 1], 9500)),
            file_path: None,
            log_level: Level::INFO,
            config: Config::default(),
        }
    }
}

fn value<T: FromStr>(args: &[String], i: usize, name: &str) -> T {
    match args.get(i + 1).map(|v| v.parse()) {
        Some(Ok(v)) => v,
        _ => {
            eprintln!("{}: 유효한 값이 필요합니다", name);
            std::process::exit(2);
        }
    }
}

fn parse_args() -> SenderArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = SenderArgs::default();
    let mut fast = false;
    let mut no_adaptive = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                parsed.bind_addr = value(&args, i, "--bind");
                i += 1;
            }
            "--id" => {
                parsed.node_id = value(&args, i, "--id");
                i += 1;
            }
            "--to" | "-t" => {
                parsed.target = value(&args, i, "--to");
                i += 1;
            }
            "--peer" | "-p" => {
                parsed.peer_addr = value(&args, i, "--peer");
                i += 1;
            }
            "--file" | "-f" => {
                parsed.file_path = Some(value(&args, i, "--file"));
                i += 1;
            }
            "--chunk-delay" => {
                let secs: f64 = value(&args, i, "--chunk-delay");
                parsed.config = parsed.config.with_chunk_delay_ms((secs * 1000.0) as u64);
                i += 1;
            }
            "--fast" => fast = true,
            "--no-adaptive" => no_adaptive = true,
            "--no-compress" => parsed.config.compress_payload = false,
            "--unstable" => parsed.config = Config::unstable_network(),
            "--verbose" | "-v" | "--debug" => parsed.log_level = Level::DEBUG,
            "--help" | "-h" => {
                println!(
                    r#"Meshsend Sender - 메시 이미지 송신기

사용법:
  cargo run --release --bin meshsend-sender -- [OPTIONS]

옵션:
  -b, --bind <ADDR>         바인드 주소 (기본: 0.0.0.0:0)
      --id <NODE>           이 노드 ID (기본: !sender)
  -t, --to <NODE>           수신 노드 ID (기본: !receiver)
  -p, --peer <ADDR>         수신 노드 UDP 주소 (기본: 127.0.0.1:9500)
  -f, --file <PATH>         전송할 이미지 (없으면 테스트 데이터)
      --chunk-delay <SECS>  청크 간격 초 (기본: 4.0, 범위 1.0~10.0)
      --fast                최소 간격 + 자동 조정 끔
      --no-adaptive         간격 자동 조정 끔
      --no-compress         zlib 압축 끔
      --unstable            불안정한 메시용 설정
  -v, --verbose, --debug    디버그 로그 (RUST_LOG로 재정의 가능)
  -h, --help                이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            other => eprintln!("알 수 없는 옵션 무시: {}", other),
        }
        i += 1;
    }

    // --fast는 다른 간격 옵션보다 우선
    if fast {
        parsed.config.chunk_delay_ms = parsed.config.min_chunk_delay_ms;
        parsed.config.adaptive_delay = false;
    }
    if no_adaptive {
        parsed.config.adaptive_delay = false;
    }

    parsed
}

fn init_logging(level: Level) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// 파일이 없을 때 쓰는 테스트 이미지 (2KB)
fn test_image() -> Bytes {
    let mut data = b"\xFF\xD8\xFF\xE0".to_vec();
    data.extend((0..2044u32).map(|i| (i.wrapping_mul(31) ^ (i >> 3)) as u8));
    Bytes::from(data)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();
    init_logging(args.log_level)?;

    info!("Meshsend Sender starting...");
    info!("Node: {} -> {} ({})", args.node_id, args.target, args.peer_addr);
    info!(
        "Chunk size: {} bytes, delay: {:.1}s, adaptive: {}",
        args.config.chunk_size,
        args.config.chunk_delay().as_secs_f64(),
        args.config.adaptive_delay
    );

    let payload = match &args.file_path {
        Some(path) => {
            info!("Loading file: {:?}", path);
            FileSource::new(path).load()?
        }
        None => {
            info!("Using test data");
            StaticSource(test_image()).load()?
        }
    };

    let udp = Arc::new(
        UdpTransport::bind(args.node_id.clone(), args.bind_addr)
            .await?
            .with_limits(args.config.chunk_size, args.config.max_text_len),
    );
    udp.add_peer(args.target.clone(), args.peer_addr);

    let transport: Arc<dyn Transport> = udp.clone();
    let node = Arc::new(MeshNode::new(args.config.clone(), transport));

    let (tx, rx) = mpsc::unbounded_channel();
    let _udp_task = udp.spawn_inbound(tx);
    let _inbound_task = node.spawn_inbound(rx);

    let report = node.send(&args.target, payload).await?;
    info!("Transfer {:08x}: {}", report.transfer_id, report.stats.summary());

    match report.outcome {
        SendOutcome::Completed => {
            info!("수신 완료 확인");
            Ok(())
        }
        SendOutcome::Incomplete => {
            warn!("수신 확인을 받지 못함");
            std::process::exit(1);
        }
    }
}
