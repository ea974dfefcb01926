//! 메모리 메시 위의 송신/수신 노드 통합 테스트

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::RngCore;
use tokio::sync::mpsc;

use meshsend::payload::Delivery;
use meshsend::{
    ChannelSink, Chunk, Config, ControlMessage, InboundPacket, MemoryMesh, MeshNode, SendOutcome,
    Transport,
};

struct Base {
    node: Arc<MeshNode>,
    deliveries: mpsc::Receiver<Delivery>,
}

fn base_station(mesh: &Arc<MemoryMesh>, config: &Config) -> Base {
    let (transport, rx) = mesh.join("!base");
    let transport: Arc<dyn Transport> = Arc::new(transport);
    let (sink, deliveries) = ChannelSink::new(4);

    let node = Arc::new(
        MeshNode::new(config.clone(), transport.clone()).with_receiver(
            config.clone(),
            transport,
            Arc::new(sink),
        ),
    );
    node.spawn_inbound(rx);
    Base { node, deliveries }
}

fn camera(mesh: &Arc<MemoryMesh>, id: &str, config: &Config) -> Arc<MeshNode> {
    let (transport, rx) = mesh.join(id);
    let node = Arc::new(MeshNode::new(config.clone(), Arc::new(transport)));
    node.spawn_inbound(rx);
    node
}

fn random_bytes(len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    Bytes::from(data)
}

fn texts_to(mesh: &MemoryMesh, to: &str) -> Vec<String> {
    mesh.sent()
        .into_iter()
        .filter(|p| p.to == to)
        .filter_map(|p| match p.packet {
            InboundPacket::Text { text, .. } => Some(text),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn lost_chunk_recovered_through_request() {
    let config = Config::fast();
    let mesh = MemoryMesh::new();

    // 5번 청크를 처음 한 번만 손실
    let dropped = Arc::new(AtomicBool::new(false));
    let flag = dropped.clone();
    mesh.set_filter(move |_, _, packet| match packet {
        InboundPacket::Data { payload, .. } => {
            let is_five = matches!(
                Chunk::from_bytes(payload).map(|c| c.header.chunk_index),
                Ok(5)
            );
            !(is_five && !flag.swap(true, Ordering::SeqCst))
        }
        InboundPacket::Text { .. } => true,
    });

    let mut base = base_station(&mesh, &config);
    let monitor = base.node.start_monitor().unwrap();
    let cam = camera(&mesh, "!cam", &config);

    let payload = random_bytes(2000);
    let report = cam.send("!base", payload.clone()).await.unwrap();

    assert!(dropped.load(Ordering::SeqCst));
    assert_eq!(report.outcome, SendOutcome::Completed);
    assert_eq!(report.stats.total_chunks, 11);
    assert_eq!(report.stats.resent_chunks, 1);

    let delivery = base.deliveries.recv().await.unwrap();
    assert_eq!(delivery.from, "!cam");
    assert_eq!(delivery.transfer_id, report.transfer_id);
    assert_eq!(delivery.data, payload);

    let requests: Vec<_> = texts_to(&mesh, "!cam")
        .into_iter()
        .filter(|t| t.starts_with("REQ:"))
        .collect();
    assert_eq!(
        requests,
        vec![ControlMessage::Req {
            transfer_id: report.transfer_id,
            chunks: vec![5],
        }
        .to_string()]
    );

    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn compressed_payload_round_trip() {
    let config = Config::fast();
    let mesh = MemoryMesh::new();
    let mut base = base_station(&mesh, &config);
    let cam = camera(&mesh, "!cam", &config);

    let payload: Bytes = b"RIFF....WEBPVP8 "
        .iter()
        .cycle()
        .take(12_000)
        .copied()
        .collect::<Vec<u8>>()
        .into();
    let report = cam.send("!base", payload.clone()).await.unwrap();

    assert_eq!(report.outcome, SendOutcome::Completed);
    assert!(report.stats.compressed);
    assert!(report.stats.total_bytes < payload.len());

    let delivery = base.deliveries.recv().await.unwrap();
    assert!(delivery.compressed);
    assert_eq!(delivery.data, payload);

    let oks = texts_to(&mesh, "!cam");
    assert_eq!(oks.len(), 3);
    assert!(oks.iter().all(|t| t.starts_with("OK:")));
}

#[tokio::test(start_paused = true)]
async fn concurrent_senders_are_isolated() {
    let config = Config::fast();
    let mesh = MemoryMesh::new();
    let mut base = base_station(&mesh, &config);
    let north = camera(&mesh, "!north", &config);
    let south = camera(&mesh, "!south", &config);

    let a = random_bytes(900);
    let b = random_bytes(1300);

    let (ra, rb) = tokio::join!(
        north.send("!base", a.clone()),
        south.send("!base", b.clone())
    );
    assert_eq!(ra.unwrap().outcome, SendOutcome::Completed);
    assert_eq!(rb.unwrap().outcome, SendOutcome::Completed);

    let mut received = vec![
        base.deliveries.recv().await.unwrap(),
        base.deliveries.recv().await.unwrap(),
    ];
    received.sort_by(|x, y| x.from.cmp(&y.from));
    assert_eq!(received[0].from, "!north");
    assert_eq!(received[0].data, a);
    assert_eq!(received[1].from, "!south");
    assert_eq!(received[1].data, b);
}

#[tokio::test(start_paused = true)]
async fn silent_receiver_leaves_transfer_incomplete() {
    let config = Config {
        wait_rounds: 2,
        ..Config::fast()
    };
    let mesh = MemoryMesh::new();
    // 수신 노드는 있지만 응답 텍스트가 모두 손실
    mesh.set_filter(|_, _, packet| matches!(packet, InboundPacket::Data { .. }));

    let mut base = base_station(&mesh, &config);
    let cam = camera(&mesh, "!cam", &config);

    let payload = random_bytes(500);
    let report = cam.send("!base", payload.clone()).await.unwrap();
    assert_eq!(report.outcome, SendOutcome::Incomplete);

    // 수신측은 이미 완료
    let delivery = tokio::time::timeout(Duration::from_secs(1), base.deliveries.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.data, payload);
    assert!(base
        .node
        .receiver()
        .unwrap()
        .is_completed("!cam", report.transfer_id));
}
