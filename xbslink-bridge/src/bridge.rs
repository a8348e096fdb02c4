//! Bridge coordinator: ties capture, transport, and statistics together.
//!
//! One [`Bridge`] runs one connected session. After the handshake it spawns
//! a worker set: frame send, receive/dispatch, periodic PING, periodic
//! stats, a stdin monitor for on-demand stats, and a capture pump thread.
//! The pump is a dedicated OS thread because pcap reads block in the kernel
//! (for at most 10 ms); it owns the capture handle and moves frames in both
//! directions through bounded channels.
//!
//! Cancellation is two-tier: the caller's stop channel and OS signals mean
//! "the application is shutting down"; an internal session channel derived
//! from them additionally fires on a received BYE or an unresponsive peer.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use xbslink_core::capture::{ether_type_name, ethernet_summary, Capture};
use xbslink_core::events::{Emitter, Event};
use xbslink_core::protocol::{Codec, Message};
use xbslink_core::transport::{Mode, Transport, TransportError, RECV_BUF_SIZE};

use crate::stats::{Stats, RTT_ALERT_THRESHOLD};

/// How often the bridge probes the peer.
pub const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Missed PONGs tolerated before the session is declared dead.
pub const MAX_MISSED_PONGS: u32 = 3;

/// Capacity of the frame channels. Writes are non-blocking: frames are
/// best-effort and a full channel drops the frame rather than stalling the
/// capture pump.
pub const CHANNEL_CAPACITY: usize = 256;

/// Connection state of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BridgeState::Disconnected => "DISCONNECTED",
            BridgeState::Connecting => "CONNECTING",
            BridgeState::Connected => "CONNECTED",
        })
    }
}

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub mode: Mode,
    /// Interval between stats lines. Zero disables periodic stats.
    pub stats_interval: Duration,
    /// Interval between PINGs. Tests shorten this.
    pub ping_interval: Duration,
}

impl BridgeConfig {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            stats_interval: Duration::from_secs(30),
            ping_interval: PING_INTERVAL,
        }
    }
}

#[derive(Default)]
struct PingState {
    /// Timestamp of the outstanding PING, 0 when none.
    pending: i64,
    missed: u32,
}

/// Coordinates one tunnel session between the local console and the peer.
pub struct Bridge {
    transport: Arc<Transport>,
    codec: Arc<Codec>,
    emitter: Arc<dyn Emitter>,
    stats: Arc<Stats>,
    cfg: BridgeConfig,

    state: Mutex<BridgeState>,

    // Deferred capture: the slot is filled exactly once, before or during
    // run(), and the ready channel releases the pump.
    capture_slot: Arc<Mutex<Option<Capture>>>,
    capture_set: AtomicBool,
    capture_ready_tx: watch::Sender<bool>,
    capture_ready_rx: watch::Receiver<bool>,

    ping: Arc<Mutex<PingState>>,
}

impl Bridge {
    /// Creates a bridge. `capture` may be absent here and supplied later
    /// through [`Bridge::set_capture`], which allows starting the tunnel
    /// while console discovery is still running.
    pub fn new(
        transport: Arc<Transport>,
        codec: Arc<Codec>,
        emitter: Arc<dyn Emitter>,
        capture: Option<Capture>,
        cfg: BridgeConfig,
    ) -> Self {
        let has_capture = capture.is_some();
        let (capture_ready_tx, capture_ready_rx) = watch::channel(has_capture);
        Self {
            transport,
            codec,
            emitter,
            stats: Arc::new(Stats::new()),
            cfg,
            state: Mutex::new(BridgeState::Disconnected),
            capture_slot: Arc::new(Mutex::new(capture)),
            capture_set: AtomicBool::new(has_capture),
            capture_ready_tx,
            capture_ready_rx,
            ping: Arc::new(Mutex::new(PingState::default())),
        }
    }

    /// Hands the bridge its capture after construction. One-shot: a second
    /// call is an error.
    pub fn set_capture(&self, capture: Capture) -> Result<()> {
        if self.capture_set.swap(true, Ordering::SeqCst) {
            bail!("capture already set");
        }
        *self.capture_slot.lock().expect("capture lock") = Some(capture);
        let _ = self.capture_ready_tx.send(true);
        info!("Capture activated, now forwarding Xbox packets");
        Ok(())
    }

    /// True once a capture has been supplied.
    pub fn has_capture(&self) -> bool {
        self.capture_set.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> BridgeState {
        *self.state.lock().expect("state lock")
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    fn set_state(&self, state: BridgeState) {
        *self.state.lock().expect("state lock") = state;
        debug!("Bridge state: {state}");
        self.emitter.emit(Event::StateChanged {
            state: state.to_string(),
            peer_addr: self.transport.peer_addr().map(|a| a.to_string()),
        });
    }

    /// Runs the bridge until the session ends: signal, caller stop, peer
    /// BYE, or an unresponsive peer. Returns `Ok(())` for every clean
    /// shutdown; only connection setup failures are errors.
    pub async fn run(&self, outer_stop: watch::Receiver<bool>) -> Result<()> {
        let (session_tx, session_rx) = watch::channel(false);
        let session_tx = Arc::new(session_tx);

        let signals = tokio::spawn(signal_watch(outer_stop, Arc::clone(&session_tx)));

        self.set_state(BridgeState::Connecting);

        let mut handshake_stop = session_rx.clone();
        let connected = match self.cfg.mode {
            Mode::Listen => self.transport.wait_for_peer(&mut handshake_stop).await,
            Mode::Connect => self.transport.connect(&mut handshake_stop).await,
        };

        if let Err(err) = connected {
            signals.abort();
            self.set_state(BridgeState::Disconnected);
            return match err {
                TransportError::Cancelled => Ok(()),
                err => Err(err).context("connection failed"),
            };
        }

        self.set_state(BridgeState::Connected);
        info!("Bridge active! Forwarding packets...");

        let (frames_to_send_tx, frames_to_send_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
        let (frames_to_inject_tx, frames_to_inject_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
        let pump_stop = Arc::new(AtomicBool::new(false));

        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        workers.push(tokio::spawn(send_loop(
            Arc::clone(&self.transport),
            Arc::clone(&self.codec),
            Arc::clone(&self.stats),
            frames_to_send_rx,
            session_rx.clone(),
        )));

        workers.push(tokio::spawn(recv_loop(
            Arc::clone(&self.transport),
            Arc::clone(&self.codec),
            Arc::clone(&self.stats),
            Arc::clone(&self.emitter),
            Arc::clone(&self.ping),
            frames_to_inject_tx,
            Arc::clone(&session_tx),
            session_rx.clone(),
        )));

        workers.push(tokio::spawn(ping_loop(
            Arc::clone(&self.transport),
            Arc::clone(&self.codec),
            Arc::clone(&self.ping),
            Arc::clone(&session_tx),
            self.cfg.ping_interval,
            session_rx.clone(),
        )));

        if !self.cfg.stats_interval.is_zero() {
            let (trigger_tx, trigger_rx) = mpsc::channel::<()>(1);
            spawn_stdin_monitor(trigger_tx);
            workers.push(tokio::spawn(stats_loop(
                Arc::clone(&self.stats),
                Arc::clone(&self.emitter),
                self.cfg.stats_interval,
                trigger_rx,
                session_rx.clone(),
            )));
        }

        let pump_gate = tokio::spawn(capture_gate(
            Arc::clone(&self.capture_slot),
            self.capture_ready_rx.clone(),
            frames_to_send_tx,
            frames_to_inject_rx,
            Arc::clone(&pump_stop),
            session_rx.clone(),
        ));

        // Block until something ends the session.
        let mut session_watch = session_rx.clone();
        wait_stopped(&mut session_watch).await;

        debug!("Sending BYE to peer");
        self.transport.send_bye().await;

        pump_stop.store(true, Ordering::Relaxed);
        self.transport.close();

        for worker in workers {
            let _ = worker.await;
        }
        if let Ok(Some(pump)) = pump_gate.await {
            let _ = tokio::task::spawn_blocking(move || pump.join()).await;
        }
        signals.abort();

        self.set_state(BridgeState::Disconnected);
        info!("Bridge stopped");
        Ok(())
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// Waits until the watch channel reads true (or its sender is gone).
async fn wait_stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(_) => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await
}

/// Funnels the outer stop channel and OS signals into the session channel.
async fn signal_watch(mut outer: watch::Receiver<bool>, session: Arc<watch::Sender<bool>>) {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt, shutting down...");
                break;
            }
            _ = terminate_signal() => {
                info!("Received terminate signal, shutting down...");
                break;
            }
            changed = outer.changed() => {
                if changed.is_err() || *outer.borrow() {
                    break;
                }
            }
        }
    }
    let _ = session.send(true);
}

/// Waits for the capture to become available, then starts the pump thread.
/// Returns the thread handle so `run` can join it at shutdown, or `None`
/// when the session ended before a capture appeared.
async fn capture_gate(
    slot: Arc<Mutex<Option<Capture>>>,
    mut ready: watch::Receiver<bool>,
    frames_to_send: mpsc::Sender<Vec<u8>>,
    inject_rx: mpsc::Receiver<Vec<u8>>,
    pump_stop: Arc<AtomicBool>,
    mut stop: watch::Receiver<bool>,
) -> Option<std::thread::JoinHandle<()>> {
    while !*ready.borrow() {
        tokio::select! {
            changed = ready.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return None;
                }
            }
        }
    }

    let capture = slot.lock().expect("capture lock").take()?;
    debug!("Capture is ready, starting pump");
    Some(std::thread::spawn(move || {
        capture_pump(capture, frames_to_send, inject_rx, pump_stop)
    }))
}

/// Owns the pcap handle for the whole session, moving frames both ways:
/// captured frames into the send channel (non-blocking, drop on full) and
/// received frames from the inject channel onto the wire. Runs on its own
/// thread; pcap reads block in the kernel for at most 10 ms, which bounds
/// how long shutdown takes to observe.
fn capture_pump(
    mut capture: Capture,
    frames_to_send: mpsc::Sender<Vec<u8>>,
    mut inject_rx: mpsc::Receiver<Vec<u8>>,
    stop: Arc<AtomicBool>,
) {
    debug!("Capture pump started");
    let mut dropped: u64 = 0;

    while !stop.load(Ordering::Relaxed) {
        // Injections first, so inbound frames are not delayed behind an
        // idle capture read.
        loop {
            match inject_rx.try_recv() {
                Ok(frame) => {
                    if let Err(err) = capture.write_packet(&frame) {
                        warn!("Injection failed: {err}");
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    debug!("Capture pump stopped (inject channel closed)");
                    return;
                }
            }
        }

        match capture.read_packet() {
            Ok(Some(frame)) => {
                if tracing::enabled!(tracing::Level::TRACE) {
                    if let Some((dst, src, ether_type)) = ethernet_summary(&frame) {
                        trace!(
                            "Captured frame: {src} -> {dst} ({}, {} bytes)",
                            ether_type_name(ether_type),
                            frame.len()
                        );
                    }
                }
                if frames_to_send.try_send(frame).is_err() {
                    dropped += 1;
                    debug!("Frame send channel full, dropping packet (total dropped: {dropped})");
                }
            }
            Ok(None) => {} // Kernel timeout; re-check stop.
            Err(err) => {
                warn!("Capture error: {err}");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
    debug!("Capture pump stopped");
}

/// Encodes captured frames and sends them to the peer.
async fn send_loop(
    transport: Arc<Transport>,
    codec: Arc<Codec>,
    stats: Arc<Stats>,
    mut frames: mpsc::Receiver<Vec<u8>>,
    mut stop: watch::Receiver<bool>,
) {
    debug!("Send loop started");
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                let encoded = match codec.encode_frame(&frame) {
                    Ok(encoded) => encoded,
                    Err(err) => {
                        debug!("Failed to encode frame: {err}");
                        continue;
                    }
                };
                if let Err(err) = transport.send(&encoded).await {
                    warn!("Failed to send frame: {err}");
                    continue;
                }
                stats.record_tx(frame.len());
            }
        }
    }
    debug!("Send loop stopped");
}

/// Receives datagrams from the peer and dispatches them by type.
#[allow(clippy::too_many_arguments)]
async fn recv_loop(
    transport: Arc<Transport>,
    codec: Arc<Codec>,
    stats: Arc<Stats>,
    emitter: Arc<dyn Emitter>,
    ping: Arc<Mutex<PingState>>,
    inject_tx: mpsc::Sender<Vec<u8>>,
    session: Arc<watch::Sender<bool>>,
    stop: watch::Receiver<bool>,
) {
    debug!("Recv loop started");
    let peer = transport.peer_addr();
    let mut buf = vec![0u8; RECV_BUF_SIZE];

    while !*stop.borrow() {
        let (n, addr) = match transport.recv(&mut buf).await {
            Ok(Some(pair)) => pair,
            Ok(None) => continue,
            Err(TransportError::Closed) => break,
            Err(err) => {
                if *stop.borrow() {
                    break;
                }
                warn!("Recv error: {err}");
                continue;
            }
        };

        // Datagrams from anyone but the pinned peer are dropped.
        if peer.is_some_and(|peer| addr != peer) {
            debug!("Ignoring packet from unexpected source: {addr}");
            continue;
        }

        let msg = match codec.decode(&buf[..n]) {
            Ok(msg) => msg,
            Err(err) => {
                debug!("Failed to decode message: {err}");
                continue;
            }
        };

        match msg {
            Message::Frame(frame) => {
                if tracing::enabled!(tracing::Level::TRACE) {
                    if let Some((dst, src, ether_type)) = ethernet_summary(&frame) {
                        trace!(
                            "Received frame: {src} -> {dst} ({}, {} bytes)",
                            ether_type_name(ether_type),
                            frame.len()
                        );
                    }
                }
                stats.record_rx(frame.len());
                if inject_tx.try_send(frame).is_err() {
                    debug!("Frame inject channel full, dropping packet");
                }
            }
            Message::Ping { timestamp } => {
                trace!("Received PING (ts={timestamp})");
                let pong = codec.encode_pong(timestamp);
                if let Err(err) = transport.send(&pong).await {
                    debug!("Failed to send PONG: {err}");
                }
            }
            Message::Pong { timestamp } => {
                handle_pong(timestamp, &ping, &stats, emitter.as_ref());
            }
            Message::Bye => {
                info!("Peer disconnected gracefully");
                let _ = session.send(true);
                break;
            }
            other => {
                debug!("Unexpected message type: {}", other.type_name());
            }
        }
    }
    debug!("Recv loop stopped");
}

fn handle_pong(timestamp: i64, ping: &Mutex<PingState>, stats: &Stats, emitter: &dyn Emitter) {
    {
        let mut state = ping.lock().expect("ping lock");
        if state.pending == 0 {
            debug!("Received unexpected PONG");
            return;
        }
        if state.pending != timestamp {
            debug!(
                "PONG timestamp mismatch: expected {}, got {timestamp}",
                state.pending
            );
            return;
        }
        state.pending = 0;
        state.missed = 0;
    }

    let rtt = Duration::from_nanos((now_nanos() - timestamp).max(0) as u64);
    let report = stats.add_rtt_sample(rtt);

    if let Some((previous, current)) = report.spike {
        warn!("RTT spike: {previous:?} -> {current:?}");
    }
    if report.exceeds_threshold {
        warn!(
            "RTT {rtt:?} exceeds the System Link threshold ({:?})",
            RTT_ALERT_THRESHOLD
        );
    }
    if report.spike.is_some() || report.exceeds_threshold {
        emitter.emit(Event::Latency {
            rtt_ms: rtt.as_secs_f64() * 1000.0,
            is_spike: report.spike.is_some(),
            exceeds_threshold: report.exceeds_threshold,
        });
    }

    trace!("PONG received: RTT={rtt:?}");
}

/// Probes the peer every `interval`. Three consecutive unanswered PINGs end
/// the session.
async fn ping_loop(
    transport: Arc<Transport>,
    codec: Arc<Codec>,
    ping: Arc<Mutex<PingState>>,
    session: Arc<watch::Sender<bool>>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    debug!("Ping loop started");
    let mut tick = tokio::time::interval(interval);
    tick.tick().await; // The first tick completes immediately.

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = tick.tick() => {
                let timestamp = {
                    let mut state = ping.lock().expect("ping lock");
                    if state.pending != 0 {
                        state.missed += 1;
                        debug!("Missed PONG response (count: {})", state.missed);
                        if state.missed >= MAX_MISSED_PONGS {
                            let missed = state.missed;
                            drop(state);
                            warn!("Peer unresponsive (missed {missed} pongs), disconnecting...");
                            let _ = session.send(true);
                            break;
                        }
                    }
                    state.pending = now_nanos();
                    state.pending
                };

                let msg = codec.encode_ping(timestamp);
                if let Err(err) = transport.send(&msg).await {
                    debug!("Failed to send PING: {err}");
                }
            }
        }
    }
    debug!("Ping loop stopped");
}

/// Prints the stats line every `interval` and whenever the stdin monitor
/// signals an Enter press.
async fn stats_loop(
    stats: Arc<Stats>,
    emitter: Arc<dyn Emitter>,
    interval: Duration,
    mut trigger: mpsc::Receiver<()>,
    mut stop: watch::Receiver<bool>,
) {
    debug!("Stats loop started");
    let mut tick = tokio::time::interval(interval);
    tick.tick().await;

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = tick.tick() => print_stats(&stats, emitter.as_ref()),
            pressed = trigger.recv() => {
                if pressed.is_none() {
                    break;
                }
                print_stats(&stats, emitter.as_ref());
            }
        }
    }
    debug!("Stats loop stopped");
}

fn print_stats(stats: &Stats, emitter: &dyn Emitter) {
    let snap = stats.snapshot();
    info!("{}", snap.format_line());
    emitter.emit(Event::Stats {
        tx_packets: snap.tx_packets,
        tx_bytes: snap.tx_bytes,
        rx_packets: snap.rx_packets,
        rx_bytes: snap.rx_bytes,
        rtt_current_ms: snap.rtt_current.as_secs_f64() * 1000.0,
        rtt_avg_ms: snap.rtt_avg.as_secs_f64() * 1000.0,
    });
}

/// Reads stdin on a plain thread, signalling the stats loop on every line.
/// Exits on EOF, so it is simply absent in non-interactive environments.
/// The thread is detached: a read blocked on a TTY cannot be interrupted.
fn spawn_stdin_monitor(trigger: mpsc::Sender<()>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => return,
                Ok(_) => {
                    let _ = trigger.try_send(());
                }
            }
        }
    });
}
