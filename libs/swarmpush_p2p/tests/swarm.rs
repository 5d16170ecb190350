use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tokio_util::codec::Framed;

use swarmpush_p2p::{
    compute_all_sums, task_id_bytes, Bitset, DiskStore, DispatchTask, EngineConfig, FileSpec,
    Handshake, Message, MetaInfo, PeerCodec, ReportSink, Role, SessionMgnt, StartTask,
    StatusReport,
};

const FINISH_DEADLINE: Duration = Duration::from_secs(30);

fn free_addr() -> SocketAddr {
    let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    sock.local_addr().unwrap()
}

fn meta_for(files: &[FileSpec], piece_length: u64) -> MetaInfo {
    let store = DiskStore::open(files).unwrap();
    let total: u64 = files.iter().map(|f| f.length).sum();
    let pieces = compute_all_sums(&store, total, piece_length).unwrap();
    MetaInfo {
        piece_length,
        total_length: total,
        pieces,
        files: files.to_vec(),
    }
}

fn write_source(dir: &Path, name: &str, content: &[u8]) -> FileSpec {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    FileSpec {
        path: path.to_string_lossy().into_owned(),
        length: content.len() as u64,
    }
}

async fn node(peer_id: &str, addr: SocketAddr, downloads: Option<&Path>) -> SessionMgnt {
    let mut cfg = EngineConfig::new(peer_id);
    cfg.downloads_dir = downloads.map(|p| p.to_path_buf());
    SessionMgnt::start(cfg, addr).await.unwrap()
}

fn dispatch(task_id: &str, meta: &MetaInfo, role: Role, roster: &[&str]) -> DispatchTask {
    DispatchTask {
        task_id: task_id.into(),
        meta_info: meta.clone(),
        self_role: role,
        peers: roster.iter().map(|s| s.to_string()).collect(),
        server: "127.0.0.1:0".into(), // unused: tests report through channels
    }
}

async fn wait_finished(rx: &mut mpsc::Receiver<StatusReport>) -> StatusReport {
    timeout(FINISH_DEADLINE, async {
        loop {
            let report = rx.recv().await.expect("report channel closed early");
            assert!(!report.failed, "task failed: {:?}", report.error);
            if report.finished {
                return report;
            }
        }
    })
    .await
    .expect("transfer did not finish in time")
}

#[tokio::test(flavor = "multi_thread")]
async fn single_file_reaches_single_destination() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let spec = write_source(src.path(), "blob.bin", b"ABCDEFGHI");
    let meta = meta_for(&[spec.clone()], 4);

    let (server_addr, agent_addr) = (free_addr(), free_addr());
    let server_id = format!("s-{}", server_addr.port());
    let agent_id = format!("a-{}", agent_addr.port());
    let roster = [server_id.as_str(), agent_id.as_str()];

    let server = node(&server_id, server_addr, None).await;
    let agent = node(&agent_id, agent_addr, Some(dst.path())).await;

    let (report_tx, mut report_rx) = mpsc::channel(64);
    server
        .create_task(dispatch("t1", &meta, Role::Server, &roster))
        .await
        .unwrap();
    agent
        .create_task_with_sink(
            dispatch("t1", &meta, Role::Agent, &roster),
            Some(ReportSink::Channel(report_tx)),
        )
        .await
        .unwrap();

    let addresses: HashMap<String, String> = [
        (server_id.clone(), server_addr.to_string()),
        (agent_id.clone(), agent_addr.to_string()),
    ]
    .into();
    server
        .start_task(StartTask {
            task_id: "t1".into(),
            addresses: addresses.clone(),
        })
        .await
        .unwrap();
    agent
        .start_task(StartTask {
            task_id: "t1".into(),
            addresses,
        })
        .await
        .unwrap();

    let done = wait_finished(&mut report_rx).await;
    assert_eq!(done.percent_complete, 100.0);

    let delivered = std::fs::read(dst.path().join(spec.path.trim_start_matches('/'))).unwrap();
    assert_eq!(delivered, b"ABCDEFGHI");

    // one block per 4-byte piece, all of them served by the seeder
    let progress = server.query_task("t1").await.unwrap();
    assert_eq!(progress.served_blocks, 3);

    server.shutdown().await;
    agent.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pieces_straddle_file_boundaries() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let a = write_source(src.path(), "a.bin", b"xyz");
    let b = write_source(src.path(), "b.bin", b"12345");
    let meta = meta_for(&[a.clone(), b.clone()], 4);
    assert_eq!(meta.num_pieces(), 2);

    let (server_addr, agent_addr) = (free_addr(), free_addr());
    let server_id = format!("s-{}", server_addr.port());
    let agent_id = format!("a-{}", agent_addr.port());
    let roster = [server_id.as_str(), agent_id.as_str()];

    let server = node(&server_id, server_addr, None).await;
    let agent = node(&agent_id, agent_addr, Some(dst.path())).await;

    let (report_tx, mut report_rx) = mpsc::channel(64);
    server
        .create_task(dispatch("t2", &meta, Role::Server, &roster))
        .await
        .unwrap();
    agent
        .create_task_with_sink(
            dispatch("t2", &meta, Role::Agent, &roster),
            Some(ReportSink::Channel(report_tx)),
        )
        .await
        .unwrap();

    let addresses: HashMap<String, String> = [
        (server_id.clone(), server_addr.to_string()),
        (agent_id.clone(), agent_addr.to_string()),
    ]
    .into();
    for mgnt in [&server, &agent] {
        mgnt.start_task(StartTask {
            task_id: "t2".into(),
            addresses: addresses.clone(),
        })
        .await
        .unwrap();
    }

    wait_finished(&mut report_rx).await;

    let out_a = std::fs::read(dst.path().join(a.path.trim_start_matches('/'))).unwrap();
    let out_b = std::fs::read(dst.path().join(b.path.trim_start_matches('/'))).unwrap();
    assert_eq!(out_a, b"xyz");
    assert_eq!(out_b, b"12345");

    server.shutdown().await;
    agent.shutdown().await;
}

/// A protocol-speaking seeder for fault and throttle scenarios: optionally
/// corrupts every block of one piece and sleeps before each serve. Flags its
/// channel when the remote side hangs up.
async fn fake_seeder(
    listener: TcpListener,
    task_id: String,
    peer_id: String,
    data: Vec<u8>,
    piece_length: u64,
    corrupt_piece: Option<u32>,
    block_delay: Duration,
    hung_up: oneshot::Sender<()>,
) {
    let (mut stream, _) = listener.accept().await.unwrap();
    let theirs = Handshake::read_from(&mut stream).await.unwrap();
    assert_eq!(theirs.task_id, task_id_bytes(&task_id));
    Handshake::new(&task_id, &peer_id)
        .write_to(&mut stream)
        .await
        .unwrap();

    let num_pieces = ((data.len() as u64 + piece_length - 1) / piece_length) as u32;
    let codec = PeerCodec::new(PeerCodec::max_payload_for(16 * 1024, num_pieces));
    let mut framed = Framed::new(stream, codec);

    let mut bits = Bitset::new(num_pieces as usize);
    for i in 0..num_pieces as usize {
        bits.set(i);
    }
    framed
        .send(Message::Bitfield {
            bits: Bytes::copy_from_slice(bits.as_bytes()),
        })
        .await
        .unwrap();
    framed.send(Message::Unchoke).await.unwrap();

    while let Some(Ok(msg)) = framed.next().await {
        if let Message::Request {
            piece,
            begin,
            length,
        } = msg
        {
            if block_delay > Duration::ZERO {
                sleep(block_delay).await;
            }
            let offset = (piece as u64 * piece_length + begin as u64) as usize;
            let mut block = data[offset..offset + length as usize].to_vec();
            if corrupt_piece == Some(piece) {
                block[0] ^= 0xff;
            }
            let _ = framed
                .send(Message::Piece {
                    piece,
                    begin,
                    data: block.into(),
                })
                .await;
        }
    }
    let _ = hung_up.send(());
}

#[tokio::test(flavor = "multi_thread")]
async fn hash_mismatch_recovers_through_honest_peer() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0u8..=255).cycle().take(64).collect();
    let spec = write_source(src.path(), "blob.bin", &content);
    let meta = meta_for(&[spec.clone()], 16);
    assert_eq!(meta.num_pieces(), 4);

    let (server_addr, agent_addr) = (free_addr(), free_addr());
    let faulty_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let faulty_addr = faulty_listener.local_addr().unwrap();

    let server_id = format!("s-{}", server_addr.port());
    let agent_id = format!("a-{}", agent_addr.port());
    // sorts after the agent id and before the server id, so only the agent
    // dials the single-connection fake seeder
    let faulty_id = "m-faulty".to_string();
    let roster = [server_id.as_str(), agent_id.as_str(), faulty_id.as_str()];

    let (_hangup_tx, _hangup_rx) = oneshot::channel();
    tokio::spawn(fake_seeder(
        faulty_listener,
        "t4".into(),
        faulty_id.clone(),
        content.clone(),
        16,
        Some(1),
        Duration::ZERO,
        _hangup_tx,
    ));

    let server = node(&server_id, server_addr, None).await;
    let agent = node(&agent_id, agent_addr, Some(dst.path())).await;

    let (report_tx, mut report_rx) = mpsc::channel(64);
    server
        .create_task(dispatch("t4", &meta, Role::Server, &roster))
        .await
        .unwrap();
    agent
        .create_task_with_sink(
            dispatch("t4", &meta, Role::Agent, &roster),
            Some(ReportSink::Channel(report_tx)),
        )
        .await
        .unwrap();

    let addresses: HashMap<String, String> = [
        (server_id.clone(), server_addr.to_string()),
        (agent_id.clone(), agent_addr.to_string()),
        (faulty_id.clone(), faulty_addr.to_string()),
    ]
    .into();
    for mgnt in [&server, &agent] {
        mgnt.start_task(StartTask {
            task_id: "t4".into(),
            addresses: addresses.clone(),
        })
        .await
        .unwrap();
    }

    wait_finished(&mut report_rx).await;
    let delivered = std::fs::read(dst.path().join(spec.path.trim_start_matches('/'))).unwrap();
    assert_eq!(delivered, content);

    server.shutdown().await;
    agent.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn persistent_corruption_gets_the_peer_disconnected() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let content = vec![7u8; 16];
    let spec = write_source(src.path(), "blob.bin", &content);
    let meta = meta_for(&[spec], 16);

    let agent_addr = free_addr();
    let faulty_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let faulty_addr = faulty_listener.local_addr().unwrap();

    let agent_id = format!("a-{}", agent_addr.port());
    let faulty_id = "z-faulty".to_string();
    let roster = [agent_id.as_str(), faulty_id.as_str()];

    let (hangup_tx, hangup_rx) = oneshot::channel();
    tokio::spawn(fake_seeder(
        faulty_listener,
        "t4b".into(),
        faulty_id.clone(),
        content.clone(),
        16,
        Some(0), // the only piece, corrupted on every serve
        Duration::ZERO,
        hangup_tx,
    ));

    let agent = node(&agent_id, agent_addr, Some(dst.path())).await;
    let (report_tx, mut report_rx) = mpsc::channel(64);
    agent
        .create_task_with_sink(
            dispatch("t4b", &meta, Role::Agent, &roster),
            Some(ReportSink::Channel(report_tx)),
        )
        .await
        .unwrap();
    agent
        .start_task(StartTask {
            task_id: "t4b".into(),
            addresses: [
                (agent_id.clone(), agent_addr.to_string()),
                (faulty_id.clone(), faulty_addr.to_string()),
            ]
            .into(),
        })
        .await
        .unwrap();

    // three strikes and the connection goes away
    timeout(FINISH_DEADLINE, hangup_rx)
        .await
        .expect("faulty peer was never disconnected")
        .unwrap();

    let progress = agent.query_task("t4b").await.unwrap();
    assert_eq!(progress.have_pieces, 0);
    assert!(report_rx.try_recv().is_err(), "no terminal report expected");

    agent.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_dispatch_is_ignored_and_stop_removes_the_task() {
    let dst = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let spec = write_source(src.path(), "blob.bin", b"0123456789abcdef");
    let meta = meta_for(&[spec], 4);

    let agent_addr = free_addr();
    let agent_id = format!("a-{}", agent_addr.port());
    let agent = node(&agent_id, agent_addr, Some(dst.path())).await;

    let dt = dispatch("t5", &meta, Role::Agent, &[agent_id.as_str()]);
    agent.create_task(dt.clone()).await.unwrap();
    agent.create_task(dt).await.unwrap(); // idempotent

    assert!(agent.query_task("t5").await.is_ok());
    agent.stop_task("t5").await.unwrap();
    assert!(agent.query_task("t5").await.is_err());
    assert!(agent.stop_task("t5").await.is_err());
    assert!(agent
        .start_task(StartTask {
            task_id: "t5".into(),
            addresses: HashMap::new(),
        })
        .await
        .is_err());

    agent.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn garbage_handshake_is_dropped() {
    let dst = tempfile::tempdir().unwrap();
    let agent_addr = free_addr();
    let agent = node("a-node", agent_addr, Some(dst.path())).await;

    let mut stream = TcpStream::connect(agent_addr).await.unwrap();
    stream.write_all(&[0xC8; 64]).await.unwrap();

    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("listener kept the connection open");
    assert_eq!(read.unwrap(), 0, "expected the listener to hang up");

    agent.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn relay_swarm_spares_the_seeder() {
    let src = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0u8..=255).cycle().take(512).collect();
    let spec = write_source(src.path(), "blob.bin", &content);
    let meta = meta_for(&[spec.clone()], 16);
    assert_eq!(meta.num_pieces(), 32);

    let (seed_addr, one_addr, two_addr, three_addr) =
        (free_addr(), free_addr(), free_addr(), free_addr());
    // id order makes the chain dial downstream-to-upstream: the first agent
    // dials the seeder, the second dials the first, the third the second
    let seed_id = format!("d-{}", seed_addr.port());
    let one_id = format!("c-{}", one_addr.port());
    let two_id = format!("b-{}", two_addr.port());
    let three_id = format!("a-{}", three_addr.port());
    let roster = [
        seed_id.as_str(),
        one_id.as_str(),
        two_id.as_str(),
        three_id.as_str(),
    ];

    let dl_one = tempfile::tempdir().unwrap();
    let dl_two = tempfile::tempdir().unwrap();
    let dl_three = tempfile::tempdir().unwrap();
    let seeder = node(&seed_id, seed_addr, None).await;
    let one = node(&one_id, one_addr, Some(dl_one.path())).await;
    let two = node(&two_id, two_addr, Some(dl_two.path())).await;
    let three = node(&three_id, three_addr, Some(dl_three.path())).await;

    seeder
        .create_task(dispatch("t3", &meta, Role::Server, &roster))
        .await
        .unwrap();
    let mut report_rxs = Vec::new();
    for agent in [&one, &two, &three] {
        let (tx, rx) = mpsc::channel(64);
        agent
            .create_task_with_sink(
                dispatch("t3", &meta, Role::Agent, &roster),
                Some(ReportSink::Channel(tx)),
            )
            .await
            .unwrap();
        report_rxs.push(rx);
    }

    // the throttle: only the first agent can reach the seeder, the other two
    // relay pieces among themselves as HAVEs propagate down the chain
    let entry = |id: &String, addr: SocketAddr| (id.clone(), addr.to_string());
    let books: Vec<(&SessionMgnt, HashMap<String, String>)> = vec![
        (&seeder, [entry(&seed_id, seed_addr)].into()),
        (
            &one,
            [entry(&seed_id, seed_addr), entry(&one_id, one_addr)].into(),
        ),
        (
            &two,
            [entry(&one_id, one_addr), entry(&two_id, two_addr)].into(),
        ),
        (
            &three,
            [entry(&two_id, two_addr), entry(&three_id, three_addr)].into(),
        ),
    ];
    for (mgnt, addresses) in books {
        mgnt.start_task(StartTask {
            task_id: "t3".into(),
            addresses,
        })
        .await
        .unwrap();
    }

    for rx in &mut report_rxs {
        wait_finished(rx).await;
    }
    for dl in [dl_one.path(), dl_two.path(), dl_three.path()] {
        let delivered = std::fs::read(dl.join(spec.path.trim_start_matches('/'))).unwrap();
        assert_eq!(delivered, content);
    }

    // the seeder's PIECE-send counter: with one block per piece, 32 sends
    // means every unique piece left the seeder exactly once, well inside the
    // at-most-twice bound
    let progress = seeder.query_task("t3").await.unwrap();
    assert_eq!(progress.served_blocks, 32);
    assert!(progress.served_blocks <= 2 * 32);

    for mgnt in [seeder, one, two, three] {
        mgnt.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_mid_transfer_closes_sockets_and_forgets_the_task() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0u8..=255).cycle().take(1024).collect();
    let spec = write_source(src.path(), "blob.bin", &content);
    let meta = meta_for(&[spec], 16);
    assert_eq!(meta.num_pieces(), 64);

    let agent_addr = free_addr();
    let seed_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let seed_addr = seed_listener.local_addr().unwrap();
    let agent_id = format!("a-{}", agent_addr.port());
    let seed_id = "z-slow-seed".to_string();
    let roster = [agent_id.as_str(), seed_id.as_str()];

    // 50 ms per block keeps the transfer running for seconds, so the cancel
    // lands while blocks are still in flight
    let (hangup_tx, hangup_rx) = oneshot::channel();
    tokio::spawn(fake_seeder(
        seed_listener,
        "t6".into(),
        seed_id.clone(),
        content.clone(),
        16,
        None,
        Duration::from_millis(50),
        hangup_tx,
    ));

    let agent = node(&agent_id, agent_addr, Some(dst.path())).await;
    let (report_tx, mut report_rx) = mpsc::channel(64);
    agent
        .create_task_with_sink(
            dispatch("t6", &meta, Role::Agent, &roster),
            Some(ReportSink::Channel(report_tx)),
        )
        .await
        .unwrap();
    agent
        .start_task(StartTask {
            task_id: "t6".into(),
            addresses: [
                (agent_id.clone(), agent_addr.to_string()),
                (seed_id.clone(), seed_addr.to_string()),
            ]
            .into(),
        })
        .await
        .unwrap();

    let first = timeout(FINISH_DEADLINE, async {
        loop {
            let report = report_rx.recv().await.expect("report channel closed early");
            assert!(!report.failed, "task failed: {:?}", report.error);
            if report.percent_complete > 0.0 {
                return report;
            }
        }
    })
    .await
    .expect("no progress before the cancel");
    assert!(first.percent_complete < 100.0 && !first.finished);

    agent.stop_task("t6").await.unwrap();

    // the peer socket closes within the cancellation drain deadline
    timeout(Duration::from_secs(5), hangup_rx)
        .await
        .expect("peer socket still open after the stop deadline")
        .unwrap();
    assert!(agent.query_task("t6").await.is_err());

    // the reporter dies with the session: the channel drains and closes
    // without ever carrying a terminal report
    timeout(Duration::from_secs(5), async {
        while let Some(report) = report_rx.recv().await {
            assert!(!report.finished && !report.failed);
        }
    })
    .await
    .expect("status reports kept flowing after the cancel");

    agent.shutdown().await;
}
