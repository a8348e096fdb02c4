//! End-to-end bridge sessions over loopback, without packet capture.
//!
//! Capture needs elevated privileges, so these tests exercise the control
//! plane and the frame receive path: handshake, FRAME accounting, PING/PONG,
//! BYE propagation, and the missed-PONG watchdog. Frames a bridge receives
//! are counted even while the capture is still pending, which is exactly the
//! deferred-discovery situation in listen mode.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use xbslink_bridge::bridge::{Bridge, BridgeConfig, BridgeState};
use xbslink_core::events::NopEmitter;
use xbslink_core::protocol::{Codec, Message};
use xbslink_core::transport::{Mode, Transport, TransportConfig};

const KEY: &[u8] = b"test-secret-key!";

fn test_frame() -> Vec<u8> {
    let mut frame = vec![0u8; 64];
    frame[0..6].copy_from_slice(&[0xFF; 6]);
    frame[6..12].copy_from_slice(&[0x00, 0x50, 0xF2, 0xAA, 0xAA, 0xAA]);
    frame[12..14].copy_from_slice(&[0x08, 0x00]);
    frame
}

async fn listen_bridge(key: &[u8]) -> Result<(Arc<Bridge>, u16)> {
    let codec = Arc::new(Codec::new(key.to_vec()));
    let transport = Arc::new(
        Transport::bind(
            TransportConfig {
                mode: Mode::Listen,
                local_port: 0,
                peer_addr: None,
            },
            Arc::clone(&codec),
        )
        .await?,
    );
    let port = transport.local_addr()?.port();

    let mut cfg = BridgeConfig::new(Mode::Listen);
    cfg.stats_interval = Duration::ZERO;
    let bridge = Arc::new(Bridge::new(transport, codec, Arc::new(NopEmitter), None, cfg));
    Ok((bridge, port))
}

async fn connect_bridge(key: &[u8], port: u16, ping_interval: Duration) -> Result<Arc<Bridge>> {
    let codec = Arc::new(Codec::new(key.to_vec()));
    let transport = Arc::new(
        Transport::bind(
            TransportConfig {
                mode: Mode::Connect,
                local_port: 0,
                peer_addr: Some(format!("127.0.0.1:{port}")),
            },
            Arc::clone(&codec),
        )
        .await?,
    );

    let mut cfg = BridgeConfig::new(Mode::Connect);
    cfg.stats_interval = Duration::ZERO;
    cfg.ping_interval = ping_interval;
    Ok(Arc::new(Bridge::new(
        transport,
        codec,
        Arc::new(NopEmitter),
        None,
        cfg,
    )))
}

async fn wait_for_state(bridge: &Bridge, state: BridgeState, deadline: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if bridge.state() == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Handshakes against a listening bridge, acting as the remote endpoint.
async fn fake_peer_connect(
    socket: &UdpSocket,
    codec: &Codec,
    listener: SocketAddr,
) -> Result<()> {
    let (hello, challenge) = codec.encode_hello();
    socket.send_to(&hello, listener).await?;

    let mut buf = vec![0u8; 65536];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf)).await??;
    let Message::HelloAck { response, .. } = codec.decode(&buf[..n])? else {
        anyhow::bail!("expected HELLO_ACK");
    };
    anyhow::ensure!(codec.verify_challenge_response(&challenge, &response));
    codec.reset_recv_nonce();
    Ok(())
}

#[tokio::test]
async fn graceful_bye_propagates() -> Result<()> {
    let (listener, port) = listen_bridge(KEY).await?;
    let connector = connect_bridge(KEY, port, Duration::from_secs(5)).await?;

    let (stop_a_tx, stop_a_rx) = watch::channel(false);
    let (_stop_b_tx, stop_b_rx) = watch::channel(false);

    let a = Arc::clone(&listener);
    let run_a = tokio::spawn(async move { a.run(stop_a_rx).await });
    let b = Arc::clone(&connector);
    let run_b = tokio::spawn(async move { b.run(stop_b_rx).await });

    assert!(wait_for_state(&listener, BridgeState::Connected, Duration::from_secs(5)).await);
    assert!(wait_for_state(&connector, BridgeState::Connected, Duration::from_secs(5)).await);

    // Cancelling A must send BYE; B's dispatcher ends its own session.
    stop_a_tx.send(true)?;
    tokio::time::timeout(Duration::from_secs(2), run_a).await???;
    tokio::time::timeout(Duration::from_secs(2), run_b).await???;

    assert_eq!(listener.state(), BridgeState::Disconnected);
    assert_eq!(connector.state(), BridgeState::Disconnected);
    Ok(())
}

#[tokio::test]
async fn received_frames_are_counted() -> Result<()> {
    let (bridge, port) = listen_bridge(KEY).await?;
    let listener_addr: SocketAddr = format!("127.0.0.1:{port}").parse()?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let b = Arc::clone(&bridge);
    let run = tokio::spawn(async move { b.run(stop_rx).await });

    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let peer_codec = Codec::new(KEY.to_vec());
    fake_peer_connect(&socket, &peer_codec, listener_addr).await?;
    assert!(wait_for_state(&bridge, BridgeState::Connected, Duration::from_secs(2)).await);

    socket
        .send_to(&peer_codec.encode_frame(&test_frame())?, listener_addr)
        .await?;

    let stats = bridge.stats();
    let start = Instant::now();
    while stats.rx_packets() < 1 && start.elapsed() < Duration::from_secs(2) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(stats.rx_packets(), 1);

    stop_tx.send(true)?;
    tokio::time::timeout(Duration::from_secs(2), run).await???;
    Ok(())
}

#[tokio::test]
async fn bridge_answers_ping_with_pong() -> Result<()> {
    let (bridge, port) = listen_bridge(KEY).await?;
    let listener_addr: SocketAddr = format!("127.0.0.1:{port}").parse()?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let b = Arc::clone(&bridge);
    let run = tokio::spawn(async move { b.run(stop_rx).await });

    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let peer_codec = Codec::new(KEY.to_vec());
    fake_peer_connect(&socket, &peer_codec, listener_addr).await?;

    let timestamp = 987_654_321i64;
    socket
        .send_to(&peer_codec.encode_ping(timestamp), listener_addr)
        .await?;

    // The bridge may also send its own PINGs; scan for our PONG.
    let mut buf = vec![0u8; 65536];
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut echoed = None;
    while Instant::now() < deadline {
        let Ok(recv) =
            tokio::time::timeout(Duration::from_millis(200), socket.recv_from(&mut buf)).await
        else {
            continue;
        };
        let (n, _) = recv?;
        if let Ok(Message::Pong { timestamp }) = peer_codec.decode(&buf[..n]) {
            echoed = Some(timestamp);
            break;
        }
    }
    assert_eq!(echoed, Some(timestamp));

    stop_tx.send(true)?;
    tokio::time::timeout(Duration::from_secs(2), run).await???;
    Ok(())
}

#[tokio::test]
async fn silent_peer_exhausts_pong_budget() -> Result<()> {
    // A fake listener that completes the handshake and then never responds.
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let port = socket.local_addr()?.port();
    let peer_codec = Codec::new(KEY.to_vec());

    let silent_peer = tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            if let Ok(Message::Hello { challenge, .. }) = peer_codec.decode(&buf[..n]) {
                let ack = peer_codec.encode_hello_ack(&challenge);
                let _ = socket.send_to(&ack, from).await;
            }
            // Everything after the handshake is ignored.
        }
    });

    let bridge = connect_bridge(KEY, port, Duration::from_millis(50)).await?;
    let (_stop_tx, stop_rx) = watch::channel(false);

    let b = Arc::clone(&bridge);
    let started = Instant::now();
    let result = tokio::time::timeout(Duration::from_secs(5), b.run(stop_rx)).await;

    // Four ticks at 50ms: one PING sent, three observed misses, then the
    // watchdog tears the session down on its own.
    result??;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(bridge.state(), BridgeState::Disconnected);

    silent_peer.abort();
    Ok(())
}
