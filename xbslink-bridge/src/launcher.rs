//! Wires the core components into a running bridge.
//!
//! The launcher resolves the Xbox MAC (flag, saved config, or passive
//! discovery), opens the capture when the MAC is known, and starts the
//! bridge. In listen mode discovery runs in the background and the capture
//! is handed to the already-running bridge; in connect mode discovery
//! blocks before the bridge starts.

use std::fs::OpenOptions;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use xbslink_core::capture::{self, Capture, MacAddr};
use xbslink_core::discovery::{self, DiscoveryError};
use xbslink_core::events::{AsyncJsonLineWriter, Emitter, Event, NopEmitter};
use xbslink_core::protocol::Codec;
use xbslink_core::transport::{Mode, Transport, TransportConfig};

use crate::bridge::{Bridge, BridgeConfig};
use crate::config::{self, SavedConfig};

/// Everything the CLI collects for a listen or connect run.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub mode: Mode,
    /// Listen: port to bind. Connect: local port, 0 for ephemeral.
    pub port: u16,
    /// Peer "host:port". Connect mode only.
    pub peer_addr: Option<String>,
    pub interface: String,
    /// Explicit Xbox MAC; when absent the saved config and then discovery
    /// are consulted.
    pub xbox_mac: Option<String>,
    /// Pre-shared key. Empty selects open mode.
    pub key: String,
    pub stats_interval: Duration,
    /// Events destination: "stdout", "stderr", or a file path.
    pub events_output: Option<String>,
}

/// Builds an emitter from the `--events-output` value. The writing happens
/// behind a bounded queue so the bridge workers never wait on event I/O.
pub fn make_emitter(output: Option<&str>) -> Result<Arc<dyn Emitter>> {
    match output {
        None | Some("") => Ok(Arc::new(NopEmitter)),
        Some("stdout") => Ok(Arc::new(AsyncJsonLineWriter::new(Box::new(std::io::stdout())))),
        Some("stderr") => Ok(Arc::new(AsyncJsonLineWriter::new(Box::new(std::io::stderr())))),
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open events output {path:?}"))?;
            Ok(Arc::new(AsyncJsonLineWriter::new(Box::new(file))))
        }
    }
}

/// Runs one bridge session to completion.
pub async fn run(opts: LaunchOptions) -> Result<()> {
    let emitter = make_emitter(opts.events_output.as_deref())?;

    if opts.key.is_empty() {
        warn!("*************************************************************");
        warn!("* WARNING: Running without --key (open mode)                *");
        warn!("* Anyone who discovers your port can inject traffic into    *");
        warn!("* your LAN. Use --key with a shared secret for security.    *");
        warn!("*************************************************************");
    } else {
        info!("Authentication enabled (HMAC-SHA256)");
    }
    let codec = Arc::new(Codec::new(opts.key.as_bytes().to_vec()));

    // Saved config is advisory: failures degrade to an empty config.
    let config_path = config::default_config_path()?;
    let mut saved = match config::load(&config_path) {
        Ok(saved) => saved,
        Err(err) => {
            warn!("Failed to load config: {err:#}");
            SavedConfig::default()
        }
    };

    let mac = resolve_mac(&opts, &saved)?;

    let iface = capture::find_interface(&opts.interface)
        .map_err(|err| anyhow::anyhow!("{err}\n\nRun 'xbslink-ng interfaces' to list available interfaces."))?;
    let addr = iface
        .addresses
        .first()
        .cloned()
        .unwrap_or_else(|| "no IP".to_string());
    info!("Interface: {} ({addr})", iface.name);

    let cap = match mac {
        Some(mac) => {
            info!("Xbox MAC: {mac}");
            Some(open_capture(&opts.interface, mac)?)
        }
        None => None,
    };

    let transport = Arc::new(
        Transport::bind(
            TransportConfig {
                mode: opts.mode,
                local_port: opts.port,
                peer_addr: opts.peer_addr.clone(),
            },
            Arc::clone(&codec),
        )
        .await
        .context("failed to create transport")?,
    );

    let mut bridge_cfg = BridgeConfig::new(opts.mode);
    bridge_cfg.stats_interval = opts.stats_interval;
    let bridge = Arc::new(Bridge::new(
        transport,
        codec,
        Arc::clone(&emitter),
        cap,
        bridge_cfg,
    ));

    // Launcher-scoped stop channel: fired after the bridge run ends so
    // background discovery does not outlive the session.
    let (stop_tx, stop_rx) = watch::channel(false);

    if mac.is_none() {
        match opts.mode {
            Mode::Listen => {
                info!("No Xbox MAC available, will auto-discover in background");
                info!("Start a System Link game on your Xbox to detect it automatically");
                let bridge = Arc::clone(&bridge);
                let emitter = Arc::clone(&emitter);
                let interface = opts.interface.clone();
                let config_path = config_path.clone();
                let saved_bg = saved.clone();
                let stop_rx = stop_rx.clone();
                tokio::spawn(async move {
                    background_discovery(interface, bridge, saved_bg, config_path, emitter, stop_rx)
                        .await;
                });
            }
            Mode::Connect => {
                info!("No --xbox-mac specified, listening for System Link traffic (UDP port {})...",
                    discovery::SYSTEM_LINK_PORT);
                info!("Start a System Link game on your Xbox to detect it automatically");

                let mac = foreground_discovery(&opts.interface, emitter.as_ref(), stop_rx.clone())
                    .await?;

                saved.set_xbox_mac(mac);
                persist_mac(&config_path, &saved, mac);

                info!("Xbox MAC: {mac}");
                let cap = open_capture(&opts.interface, mac)?;
                bridge
                    .set_capture(cap)
                    .context("failed to set capture")?;
            }
        }
    }

    let result = bridge.run(stop_rx).await;
    let _ = stop_tx.send(true);
    result
}

fn resolve_mac(opts: &LaunchOptions, saved: &SavedConfig) -> Result<Option<MacAddr>> {
    if let Some(raw) = opts.xbox_mac.as_deref() {
        let mac: MacAddr = raw
            .parse()
            .with_context(|| format!("invalid Xbox MAC address {raw:?}"))?;
        info!("Using Xbox MAC from --xbox-mac: {mac}");
        return Ok(Some(mac));
    }
    if let Some(mac) = saved.xbox_mac() {
        info!("Using saved Xbox MAC from config: {mac}");
        return Ok(Some(mac));
    }
    Ok(None)
}

fn open_capture(interface: &str, mac: MacAddr) -> Result<Capture> {
    Capture::open(interface, mac)
        .map_err(|err| anyhow::anyhow!("failed to open capture: {err}\n\n{}", capture::install_help()))
}

fn persist_mac(path: &std::path::Path, saved: &SavedConfig, mac: MacAddr) {
    match config::save(path, saved) {
        Ok(()) => info!("Saved Xbox MAC to config: {mac}"),
        Err(err) => warn!("Failed to save config: {err:#}"),
    }
}

/// Discovery for listen mode: runs next to the live bridge and hands it the
/// capture once the console shows up.
async fn background_discovery(
    interface: String,
    bridge: Arc<Bridge>,
    mut saved: SavedConfig,
    config_path: std::path::PathBuf,
    emitter: Arc<dyn Emitter>,
    stop: watch::Receiver<bool>,
) {
    let mac = match discovery::discover(interface.clone(), stop).await {
        Ok(mac) => mac,
        Err(DiscoveryError::Cancelled) => {
            debug!("Background discovery cancelled");
            return;
        }
        Err(err) => {
            warn!("Background discovery failed: {err}");
            return;
        }
    };

    info!("Found Xbox: {mac}");
    emitter.emit(Event::Discovery {
        mac: mac.to_string(),
    });

    saved.set_xbox_mac(mac);
    persist_mac(&config_path, &saved, mac);

    let cap = match Capture::open(&interface, mac) {
        Ok(cap) => cap,
        Err(err) => {
            error!("Failed to open capture after discovery: {err}\n\n{}", capture::install_help());
            return;
        }
    };

    if let Err(err) = bridge.set_capture(cap) {
        error!("Failed to set capture: {err:#}");
    }
}

/// Discovery for connect mode: blocks until a console is found or the user
/// interrupts.
async fn foreground_discovery(
    interface: &str,
    emitter: &dyn Emitter,
    stop: watch::Receiver<bool>,
) -> Result<MacAddr> {
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let mut outer = stop;
    let forward = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                changed = outer.changed() => {
                    if changed.is_err() || *outer.borrow() {
                        break;
                    }
                }
            }
        }
        let _ = cancel_tx.send(true);
    });

    let result = discovery::discover(interface.to_string(), cancel_rx).await;
    forward.abort();

    match result {
        Ok(mac) => {
            info!("Found Xbox: {mac}");
            emitter.emit(Event::Discovery {
                mac: mac.to_string(),
            });
            Ok(mac)
        }
        Err(DiscoveryError::Cancelled) => bail!("discovery cancelled"),
        Err(err) => Err(err).context("discovery failed"),
    }
}
