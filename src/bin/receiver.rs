//! Meshsend 수신기
//!
//! UDP로 청크를 받아 이미지를 재조립하고 갤러리 디렉터리에 저장한다.
//! 누락 청크는 정체 감시가 REQ로 요청한다.
//!
//! 사용법:
//!   cargo run --release --bin meshsend-receiver -- [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin meshsend-receiver -- --bind 0.0.0.0:9500 --out gallery

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use meshsend::{Config, DirectorySink, MeshNode, Transport, UdpTransport};

/// 수신기 설정
struct ReceiverArgs {
    bind_addr: SocketAddr,
    node_id: String,
    out_dir: PathBuf,
    progress_interval: Duration,
    log_level: Level,
    config: Config,
}

impl Default for ReceiverArgs {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9500)),
            node_id: "!receiver".to_string(),
            out_dir: PathBuf::from("gallery"),
            progress_interval: Duration::from_secs(10),
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

fn parse_args() -> ReceiverArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = ReceiverArgs::default();

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
            "--out" | "-o" => {
                parsed.out_dir = value(&args, i, "--out");
                i += 1;
            }
            "--progress" => {
                let secs: u64 = value(&args, i, "--progress");
                parsed.progress_interval = Duration::from_secs(secs.max(1));
                i += 1;
            }
            "--unstable" => parsed.config = Config::unstable_network(),
            "--verbose" | "-v" | "--debug" => parsed.log_level = Level::DEBUG,
            "--help" | "-h" => {
                println!(
                    r#"Meshsend Receiver - 메시 이미지 수신기

사용법:
  cargo run --release --bin meshsend-receiver -- [OPTIONS]

옵션:
  -b, --bind <ADDR>       바인드 주소 (기본: 0.0.0.0:9500)
      --id <NODE>         이 노드 ID (기본: !receiver)
  -o, --out <DIR>         이미지 저장 디렉터리 (기본: gallery)
      --progress <SECS>   진행 상황 출력 주기 (기본: 10)
      --unstable          불안정한 메시용 타임아웃
  -v, --verbose, --debug  디버그 로그 (RUST_LOG로 재정의 가능)
  -h, --help              이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            other => eprintln!("알 수 없는 옵션 무시: {}", other),
        }
        i += 1;
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();
    init_logging(args.log_level)?;

    info!("Meshsend Receiver starting...");

    let sink = Arc::new(DirectorySink::new(&args.out_dir)?);
    info!("Gallery: {}", sink.dir().display());

    let udp = Arc::new(
        UdpTransport::bind(args.node_id.clone(), args.bind_addr)
            .await?
            .with_limits(args.config.chunk_size, args.config.max_text_len),
    );
    let transport: Arc<dyn Transport> = udp.clone();

    let (node, mut app_rx) = MeshNode::new(args.config.clone(), transport.clone())
        .with_receiver(args.config.clone(), transport, sink)
        .with_app_channel();
    let node = Arc::new(node);

    let (tx, rx) = mpsc::unbounded_channel();
    let _udp_task = udp.spawn_inbound(tx);
    let _inbound_task = node.spawn_inbound(rx);
    let monitor = node.start_monitor();

    info!("Receiver active: {} on {}", args.node_id, udp.local_addr()?);

    let mut progress = tokio::time::interval(args.progress_interval);
    loop {
        tokio::select! {
            _ = progress.tick() => {
                if let Some(receiver) = node.receiver() {
                    for p in receiver.progress() {
                        info!("[PROGRESS] {}", p.summary());
                    }
                }
            }
            Some(msg) = app_rx.recv() => {
                info!("[MSG] {}: {}", msg.from, msg.text);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("종료 요청");
                break;
            }
        }
    }

    if let Some(monitor) = monitor {
        monitor.stop().await;
    }
    Ok(())
}
