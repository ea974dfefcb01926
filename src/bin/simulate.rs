//! Meshsend 시뮬레이터
//!
//! 프로세스 내 손실 메시에서 송신 노드와 수신 노드 사이 전송 한 건을 실행한다.
//! 실제 무선 간격 대신 축소된 타이밍을 사용한다.
//!
//! 사용법:
//!   cargo run --release --bin meshsend-sim -- [OPTIONS]
//!
//! 예시:
//!   # 20% 손실, 8KB 압축 불가 데이터
//!   cargo run --release --bin meshsend-sim -- --loss 0.2 --size 8000 --random

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::RngCore;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use meshsend::{ChannelSink, Config, MemoryMesh, MeshNode, SendOutcome, Transport};

/// 시뮬레이션 설정
struct SimArgs {
    loss_rate: f64,
    size: usize,
    random: bool,
    log_level: Level,
}

impl Default for SimArgs {
    fn default() -> Self {
        Self {
            loss_rate: 0.1,
            size: 3000,
            random: false,
            log_level: Level::INFO,
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

fn parse_args() -> SimArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = SimArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--loss" | "-l" => {
                parsed.loss_rate = value(&args, i, "--loss");
                i += 1;
            }
            "--size" | "-s" => {
                parsed.size = value(&args, i, "--size");
                i += 1;
            }
            "--random" => parsed.random = true,
            "--verbose" | "-v" | "--debug" => parsed.log_level = Level::DEBUG,
            "--help" | "-h" => {
                println!(
                    r#"Meshsend Simulator - 손실 메시 전송 시뮬레이션

사용법:
  cargo run --release --bin meshsend-sim -- [OPTIONS]

옵션:
  -l, --loss <RATE>       패킷 손실률 0.0~1.0 (기본: 0.1)
  -s, --size <BYTES>      페이로드 크기 (기본: 3000)
      --random            압축되지 않는 무작위 데이터 사용
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

/// 실제 간격을 약 1/40로 줄인 설정
fn sim_config() -> Config {
    Config {
        base_retry_delay_ms: 100,
        chunk_delay_ms: 100,
        min_chunk_delay_ms: 25,
        max_chunk_delay_ms: 250,
        wait_round_interval_ms: 400,
        wait_rounds: 20,
        stall_check_interval_ms: 400,
        stall_request_timeout_ms: 500,
        transfer_timeout_ms: 1_500,
        chunk_overhead_ms: 50,
        max_transfer_timeout_ms: 10_000,
        completed_retention_ms: 10_000,
        completion_repeat_interval_ms: 20,
        ..Config::default()
    }
}

fn payload(args: &SimArgs) -> Bytes {
    let mut data = vec![0u8; args.size];
    if args.random {
        rand::thread_rng().fill_bytes(&mut data);
    } else {
        for (i, b) in data.iter_mut().enumerate() {
            *b = ((i / 64) as u8).wrapping_mul(7);
        }
    }
    Bytes::from(data)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();
    init_logging(args.log_level)?;

    let config = sim_config();
    let mesh = MemoryMesh::new();
    mesh.set_loss_rate(args.loss_rate);

    let (cam_transport, cam_rx) = mesh.join("!cam");
    let (base_transport, base_rx) = mesh.join("!base");
    let base_transport: Arc<dyn Transport> = Arc::new(base_transport);

    let (sink, mut deliveries) = ChannelSink::new(4);
    let cam = Arc::new(MeshNode::new(config.clone(), Arc::new(cam_transport)));
    let base = Arc::new(
        MeshNode::new(config.clone(), base_transport.clone()).with_receiver(
            config.clone(),
            base_transport,
            Arc::new(sink),
        ),
    );

    let _cam_task = cam.spawn_inbound(cam_rx);
    let _base_task = base.spawn_inbound(base_rx);
    let monitor = base.start_monitor();

    let data = payload(&args);
    info!(
        "Simulation: {} bytes, loss {:.0}%",
        data.len(),
        args.loss_rate * 100.0
    );

    let report = cam.send("!base", data.clone()).await?;
    info!("Sender: {:?} | {}", report.outcome, report.stats.summary());

    let delivered = tokio::time::timeout(Duration::from_secs(1), deliveries.recv()).await;
    let sent_packets = mesh.sent().len();

    if let Some(monitor) = monitor {
        monitor.stop().await;
    }

    match delivered {
        Ok(Some(delivery)) if delivery.data == data => {
            info!(
                "Receiver: {} bytes intact in {:.1}s ({} packets on air)",
                delivery.data.len(),
                delivery.elapsed.as_secs_f64(),
                sent_packets
            );
            if report.outcome == SendOutcome::Incomplete {
                warn!("수신은 완료됐지만 OK가 모두 손실됨");
            }
            Ok(())
        }
        Ok(Some(_)) => {
            error!("수신 데이터 불일치");
            std::process::exit(1);
        }
        _ => {
            error!("수신 실패 ({} packets on air)", sent_packets);
            std::process::exit(1);
        }
    }
}
