//! xbslink-ng: a P2P Xbox System Link bridge over UDP.

use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;

use xbslink_bridge::launcher::{self, LaunchOptions};
use xbslink_core::capture;
use xbslink_core::transport::Mode;

const DEFAULT_PORT: u16 = 31415;

/// P2P Xbox System Link bridge.
///
/// Captures Ethernet frames from a local Xbox and tunnels them to a peer
/// over an authenticated UDP association, so two consoles on separate LANs
/// behave as if they shared a network. Press Enter at any time during a
/// session to print current statistics.
#[derive(Parser, Debug)]
#[command(name = "xbslink-ng", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for an incoming peer connection (requires port forwarding)
    Listen(ListenArgs),
    /// Connect to a listening peer
    Connect(ConnectArgs),
    /// List available network interfaces
    Interfaces,
    /// Print version information
    Version,
}

#[derive(Args, Debug)]
struct ListenArgs {
    /// UDP port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// Peer address in IP:port format
    #[arg(long)]
    address: String,

    /// Local UDP port (0 = auto-assign)
    #[arg(long, default_value_t = 0)]
    port: u16,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Network interface name
    #[arg(long)]
    interface: String,

    /// Xbox MAC address (auto-detected if omitted)
    #[arg(long)]
    xbox_mac: Option<String>,

    /// Pre-shared key for authentication (strongly recommended)
    #[arg(long, default_value = "")]
    key: String,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    log: LogLevel,

    /// Seconds between stats output, 0 to disable
    #[arg(long, default_value_t = 30)]
    stats_interval: u64,

    /// Write JSON Line events to: stdout, stderr, or a file path
    #[arg(long, default_value = "")]
    events_output: String,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Listen(args) => run_listen(args).await,
        Command::Connect(args) => run_connect(args).await,
        Command::Interfaces => run_interfaces(),
        Command::Version => {
            println!(
                "xbslink-ng {} ({}/{})",
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS,
                std::env::consts::ARCH
            );
            Ok(())
        }
    };

    if let Err(err) = result {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn init_logging(level: LogLevel) {
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::from(level))
        .init();
}

async fn run_listen(args: ListenArgs) -> Result<()> {
    init_logging(args.common.log);

    if args.port == 0 {
        bail!("--port must be between 1 and 65535");
    }

    info_banner();
    launcher::run(launch_options(
        Mode::Listen,
        args.port,
        None,
        args.common,
    ))
    .await
}

async fn run_connect(args: ConnectArgs) -> Result<()> {
    init_logging(args.common.log);

    if !args.address.contains(':') {
        bail!("--address must be in IP:port format (e.g. 192.168.1.100:31415)");
    }

    info_banner();
    launcher::run(launch_options(
        Mode::Connect,
        args.port,
        Some(args.address),
        args.common,
    ))
    .await
}

fn launch_options(
    mode: Mode,
    port: u16,
    peer_addr: Option<String>,
    common: CommonArgs,
) -> LaunchOptions {
    LaunchOptions {
        mode,
        port,
        peer_addr,
        interface: common.interface,
        xbox_mac: common.xbox_mac,
        key: common.key,
        stats_interval: Duration::from_secs(common.stats_interval),
        events_output: (!common.events_output.is_empty()).then_some(common.events_output),
    }
}

fn info_banner() {
    tracing::info!("xbslink-ng {} starting", env!("CARGO_PKG_VERSION"));
}

fn run_interfaces() -> Result<()> {
    let interfaces = match capture::list_interfaces() {
        Ok(interfaces) => interfaces,
        Err(err) => bail!("failed to list interfaces: {err}\n\n{}", capture::install_help()),
    };

    if interfaces.is_empty() {
        println!("No network interfaces found.\n");
        println!("{}", capture::install_help());
        bail!("no network interfaces");
    }

    print!("{}", capture::format_interface_list(&interfaces));
    Ok(())
}
