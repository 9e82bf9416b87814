//! Integration tests for reliable data transfer.
//!
//! Two in-process endpoints talk over loopback.  Each side runs in its own
//! tokio task so both make progress concurrently.  Lossy scenarios attach a
//! seeded [`Simulator`] to one or both send paths.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use microtcp::packet::{flags, Packet};
use microtcp::socket::Socket;
use microtcp::timer::TimerConfig;
use microtcp::{
    Config, ConnError, Connection, ConnectionState, SharedConnection, Simulator, SimulatorConfig,
};
use rand::rngs::mock::StepRng;
use tokio::time::timeout;

const LIMIT: Duration = Duration::from_secs(20);

fn fixed_isn(isn: u32) -> Box<StepRng> {
    Box::new(StepRng::new(isn as u64, 0))
}

/// Establish a client/server pair with the given configs and ISNs.
async fn connected(
    client_config: Config,
    server_config: Config,
    client_isn: u32,
    server_isn: u32,
) -> (Connection, Connection) {
    let mut server = Connection::open_with_rng(server_config, fixed_isn(server_isn)).unwrap();
    server
        .bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())
        .await
        .expect("bind");
    let server_addr = server.local_addr().unwrap();
    let server_task = tokio::spawn(async move { server.accept().await.map(|_| server) });

    let mut client = Connection::open_with_rng(client_config, fixed_isn(client_isn)).unwrap();
    timeout(LIMIT, client.connect(server_addr))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    let server = server_task.await.unwrap().expect("accept failed");
    (client, server)
}

/// Read from `conn` until `len` bytes have arrived.
async fn read_exactly(conn: &mut Connection, len: usize) -> Result<Vec<u8>, ConnError> {
    let mut out = Vec::with_capacity(len);
    let mut buf = vec![0u8; 4096];
    while out.len() < len {
        let n = conn.recv(&mut buf).await?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    Ok(out)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Short timers so lossy runs finish quickly.
fn lossy_config() -> Config {
    Config {
        timer: TimerConfig {
            initial_rto: Duration::from_millis(30),
            min_rto: Duration::from_millis(5),
            max_rto: Duration::from_millis(200),
        },
        max_retries: 30,
        ..Config::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// 1000 bytes with MSS 512 travel as exactly two segments.
#[tokio::test]
async fn thousand_bytes_use_two_segments() {
    let config = Config::default().with_mss(512);
    let (mut client, mut server) = connected(config.clone(), config, 42, 7).await;

    let reader = tokio::spawn(async move {
        let data = read_exactly(&mut server, 1000).await.expect("server recv");
        (data, server)
    });

    let data = pattern(1000);
    let seq_before = client.seq_number();
    let stats_before = client.stats();

    let sent = timeout(LIMIT, client.send(&data)).await.unwrap().expect("send");
    assert_eq!(sent, 1000);

    let stats = client.stats();
    assert_eq!(stats.packets_sent - stats_before.packets_sent, 2);
    assert_eq!(stats.bytes_sent - stats_before.bytes_sent, 1000);
    assert_eq!(stats.packets_lost, 0);
    assert_eq!(client.seq_number().wrapping_sub(seq_before), 1000);
    assert_eq!(client.seq_number(), 1043);

    let (received, server) = reader.await.unwrap();
    assert_eq!(received, data);
    assert_eq!(server.ack_number(), 1043);
    assert_eq!(server.stats().bytes_received, 1000);
}

/// Data larger than the receive window arrives intact and in order.
#[tokio::test]
async fn bulk_transfer_respects_flow_control() {
    let server_config = Config {
        recv_buf_len: 2048,
        init_ssthresh: 2048,
        ..Config::default()
    };
    let (mut client, mut server) = connected(Config::default(), server_config, 1, 2).await;
    assert_eq!(client.peer_window(), 2048);

    let data = pattern(50_000);
    let expected = data.clone();
    let reader = tokio::spawn(async move { read_exactly(&mut server, 50_000).await });

    timeout(LIMIT, client.send(&data)).await.unwrap().expect("send");
    assert!(client.cwnd() <= 2048);

    let received = reader.await.unwrap().expect("recv");
    assert_eq!(received, expected);
}

/// Loss, corruption, duplication and reordering in both directions are all
/// recovered from by retransmission.
#[tokio::test]
async fn transfer_survives_a_lossy_network() {
    let (mut client, mut server) = connected(lossy_config(), lossy_config(), 1000, 2000).await;
    client.set_simulator(Some(Simulator::new(SimulatorConfig {
        loss_rate: 0.1,
        corrupt_rate: 0.05,
        duplicate_rate: 0.05,
        reorder_rate: 0.1,
        seed: 7,
    })));
    server.set_simulator(Some(Simulator::new(SimulatorConfig {
        loss_rate: 0.1,
        seed: 8,
        ..SimulatorConfig::default()
    })));

    let data = pattern(64 * 1024);
    let expected = data.clone();
    let server_task = tokio::spawn(async move {
        let received = read_exactly(&mut server, 64 * 1024).await.expect("recv");
        // Keep acknowledging until the client closes.
        let mut buf = [0u8; 64];
        assert_eq!(server.recv(&mut buf).await.expect("recv FIN"), 0);
        server.shutdown().await.expect("server shutdown");
        (received, server)
    });

    timeout(LIMIT, client.send(&data))
        .await
        .expect("send timed out")
        .expect("send");
    client.set_simulator(None);
    timeout(LIMIT, client.shutdown())
        .await
        .expect("shutdown timed out")
        .expect("client shutdown");

    let (received, server) = server_task.await.unwrap();
    assert_eq!(received, expected);
    assert_eq!(server.stats().bytes_received, 64 * 1024);
    assert_eq!(server.state(), ConnectionState::Closed);
    assert_eq!(client.state(), ConnectionState::Closed);
}

/// Sequence numbers that wrap past `u32::MAX` mid-transfer are handled.
#[tokio::test]
async fn transfer_across_sequence_wrap() {
    let isn = u32::MAX - 1000;
    let (mut client, mut server) = connected(Config::default(), Config::default(), isn, 5).await;

    let data = pattern(5000);
    let expected = data.clone();
    let reader = tokio::spawn(async move { read_exactly(&mut server, 5000).await });

    timeout(LIMIT, client.send(&data)).await.unwrap().expect("send");
    assert_eq!(client.seq_number(), isn.wrapping_add(1).wrapping_add(5000));
    assert_eq!(reader.await.unwrap().expect("recv"), expected);
}

/// Both directions at once: the server echoes what it receives.
#[tokio::test]
async fn echo_in_both_directions() {
    let (mut client, mut server) = connected(Config::default(), Config::default(), 10, 20).await;

    let echo = tokio::spawn(async move {
        let data = read_exactly(&mut server, 3000).await.expect("server recv");
        server.send(&data).await.expect("server send");
        server
    });

    let data = pattern(3000);
    client.send(&data).await.expect("client send");
    let back = timeout(LIMIT, read_exactly(&mut client, 3000))
        .await
        .unwrap()
        .expect("client recv");
    assert_eq!(back, data);
    echo.await.unwrap();
}

/// A reader task and a writer task share one connection.
#[tokio::test]
async fn shared_connection_reads_while_writing() {
    let (client, mut server) = connected(Config::default(), Config::default(), 3, 4).await;

    let server_task = tokio::spawn(async move {
        let ping = read_exactly(&mut server, 5).await.expect("server recv");
        assert_eq!(ping, b"ping!");
        server.send(b"pong!").await.expect("server send");
        server
    });

    let shared = SharedConnection::new(client);
    let reader = shared.clone();
    let read_task = tokio::spawn(async move {
        let mut buf = [0u8; 16];
        let n = reader.recv(&mut buf).await.expect("client recv");
        buf[..n].to_vec()
    });

    shared.send(b"ping!").await.expect("client send");
    let pong = timeout(LIMIT, read_task).await.unwrap().unwrap();
    assert_eq!(pong, b"pong!");
    server_task.await.unwrap();

    assert_eq!(shared.state().await, ConnectionState::Established);
    assert_eq!(shared.stats().await.bytes_received, 5);
    assert!(shared.into_inner().is_some());
}

/// Write `len` bytes from one task while another task on the same
/// connection reads `len` bytes.
async fn write_and_read(conn: SharedConnection, len: usize) -> Result<(usize, Vec<u8>), ConnError> {
    let reader = conn.clone();
    let read_task = tokio::spawn(async move {
        let mut out = Vec::with_capacity(len);
        let mut buf = vec![0u8; 4096];
        while out.len() < len {
            let n = reader.recv(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok::<_, ConnError>(out)
    });
    let sent = conn.send(&pattern(len)).await?;
    let received = read_task.await.expect("reader panicked")?;
    Ok((sent, received))
}

/// Both ends write and read concurrently through shared handles; neither
/// writer may block the reader that reopens its own receive window.
#[tokio::test]
async fn shared_connections_stream_both_ways_at_once() {
    let (client, server) = connected(Config::default(), Config::default(), 11, 22).await;
    let len = 64 * 1024;

    let a = tokio::spawn(write_and_read(SharedConnection::new(client), len));
    let b = tokio::spawn(write_and_read(SharedConnection::new(server), len));
    let (a, b) = timeout(LIMIT, async { (a.await, b.await) })
        .await
        .expect("bidirectional transfer stalled");

    let expected = pattern(len);
    for side in [a, b] {
        let (sent, received) = side.unwrap().expect("transfer failed");
        assert_eq!(sent, len);
        assert_eq!(received, expected);
    }
}

/// Three duplicate ACKs trigger a fast retransmit of the earliest segment
/// and collapse the congestion window, long before the RTO would fire.
#[tokio::test]
async fn triple_duplicate_ack_triggers_fast_retransmit() {
    let fake = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let fake_addr = fake.local_addr;
    let config = Config {
        timer: TimerConfig {
            initial_rto: Duration::from_secs(2),
            min_rto: Duration::from_secs(2),
            max_rto: Duration::from_secs(5),
        },
        ..Config::default().with_mss(100)
    };
    let mut client = Connection::open_with_rng(config, fixed_isn(42)).unwrap();

    let peer = tokio::spawn(async move {
        let (syn, from) = fake.recv_from().await.unwrap();
        let syn_ack = Packet::control(7, syn.header.seq.wrapping_add(1), flags::SYN | flags::ACK, 8192);
        fake.send_to(&syn_ack, from).await.unwrap();

        let mut segments = Vec::new();
        while segments.len() < 3 {
            let (pkt, _) = fake.recv_from().await.unwrap();
            if !pkt.payload.is_empty() {
                segments.push(pkt.header.seq);
            }
        }
        for _ in 0..3 {
            fake.send_to(&Packet::control(8, 43, flags::ACK, 8192), from)
                .await
                .unwrap();
        }
        let (rtx, _) = fake.recv_from().await.unwrap();
        fake.send_to(&Packet::control(8, 343, flags::ACK, 8192), from)
            .await
            .unwrap();
        (segments, rtx)
    });

    client.connect(fake_addr).await.expect("connect");
    assert_eq!(client.cwnd(), 300);
    let started = Instant::now();
    timeout(LIMIT, client.send(&pattern(300)))
        .await
        .unwrap()
        .expect("send");
    assert!(started.elapsed() < Duration::from_secs(2), "waited for the RTO");

    let (segments, rtx) = peer.await.unwrap();
    assert_eq!(segments, vec![43, 143, 243]);
    assert_eq!(rtx.header.seq, 43);
    assert_eq!(rtx.payload.len(), 100);

    assert_eq!(client.ssthresh(), 150);
    // Collapsed to one segment, then one slow-start step on the final ACK.
    assert_eq!(client.cwnd(), 200);
    let stats = client.stats();
    assert_eq!(stats.packets_lost, 1);
    assert_eq!(stats.bytes_lost, 100);
}

/// `recv` honours its timeout and leaves the connection usable.
#[tokio::test]
async fn recv_times_out_without_data() {
    let config = Config {
        recv_timeout: Some(Duration::from_millis(50)),
        ..Config::default()
    };
    let (mut client, mut server) = connected(config, Config::default(), 1, 1).await;

    let mut buf = [0u8; 8];
    let err = client.recv(&mut buf).await.unwrap_err();
    assert!(matches!(err, ConnError::Timeout));
    assert!(err.is_recoverable());
    assert_eq!(client.state(), ConnectionState::Established);

    let writer = tokio::spawn(async move {
        server.send(b"late").await.expect("send");
        server
    });
    let deadline = Instant::now() + Duration::from_secs(5);
    let n = client
        .recv_until(&mut buf, Some(deadline))
        .await
        .expect("recv after timeout");
    assert_eq!(&buf[..n], b"late");
    writer.await.unwrap();
}
