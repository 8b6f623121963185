//! reltp Node - one host on a UDP-backed link
//!
//! `listen` accepts a single connection and copies it to stdout. `connect`
//! copies stdin to a connection. Every node of a session must share the same
//! base port; link `n` lives on `127.0.0.1:base_port+n`.

use clap::{Parser, Subcommand};
use reltp::io::{NetworkLink, UdpLink};
use reltp::{NetProcess, Transport};
use reltp_cli::{compact_stats, Config, NodeConfig, RetransmitSection};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "reltp-node")]
#[command(about = "reltp host over UDP", long_about = None)]
struct Args {
    /// TOML configuration file with a [node] section
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Link address of this host
    #[arg(short, long)]
    link: Option<u8>,

    /// UDP port of link 0
    #[arg(short, long)]
    base_port: Option<u16>,

    /// Frame delivery probability (0.0 to 1.0)
    #[arg(short, long)]
    reliability: Option<f64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Accept one connection and copy it to stdout
    Listen {
        /// Port to accept on
        #[arg(short, long)]
        port: Option<u8>,
    },
    /// Copy stdin to a connection
    Connect {
        /// Link address of the listening host
        host: u8,
        /// Port on the listening host
        #[arg(short, long)]
        port: Option<u8>,
    },
}

fn load_config(args: &Args) -> anyhow::Result<NodeConfig> {
    let mut node = match &args.config {
        Some(path) => Config::from_file(path)?
            .node
            .ok_or_else(|| anyhow::anyhow!("{} has no [node] section", path.display()))?,
        None => NodeConfig {
            link: 1,
            base_port: 47000,
            reliability: 1.0,
            port: 15,
            retransmit: RetransmitSection::default(),
        },
    };

    if let Some(link) = args.link {
        node.link = link;
    }
    if let Some(base_port) = args.base_port {
        node.base_port = base_port;
    }
    if let Some(reliability) = args.reliability {
        node.reliability = reliability;
    }
    match args.mode {
        Mode::Listen { port: Some(port) } | Mode::Connect { port: Some(port), .. } => {
            node.port = port;
        }
        _ => {}
    }
    node.validate()?;
    Ok(node)
}

fn listen(process: &NetProcess, port: u8) -> anyhow::Result<u64> {
    tracing::info!("waiting for a connection on port {}", port);
    let fd = loop {
        let fd = process.accept(i32::from(port));
        if fd >= 0 {
            break fd;
        }
        thread::sleep(Duration::from_millis(20));
    };
    tracing::info!("connection accepted");

    let mut stdout = io::stdout().lock();
    let mut buf = [0u8; 512];
    let mut total = 0u64;
    loop {
        let n = process.read(fd, &mut buf);
        if n < 0 {
            break;
        }
        if n == 0 {
            thread::sleep(Duration::from_millis(10));
            continue;
        }
        stdout.write_all(&buf[..n as usize])?;
        stdout.flush()?;
        total += n as u64;
    }
    process.close(fd);
    Ok(total)
}

fn connect(process: &NetProcess, host: u8, port: u8) -> anyhow::Result<u64> {
    tracing::info!("connecting to {}:{}", host, port);
    let fd = process.connect(i32::from(host), i32::from(port));
    if fd < 0 {
        anyhow::bail!("Could not connect to {}:{}", host, port);
    }
    tracing::info!("connected");

    let mut stdin = io::stdin().lock();
    let mut buf = [0u8; 512];
    let mut total = 0u64;
    loop {
        let n = stdin.read(&mut buf)?;
        if n == 0 {
            break;
        }
        if process.write(fd, &buf[..n]) < 0 {
            anyhow::bail!("Connection lost");
        }
        total += n as u64;
    }

    if process.close(fd) < 0 {
        tracing::warn!("close was not acknowledged by the peer");
    }
    Ok(total)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(io::stderr)
        .init();

    let node = load_config(&args)?;
    let link = UdpLink::bind(node.link, node.base_port, node.reliability)?;
    tracing::info!("link {} bound to {}", node.link, link.local_addr()?);

    let link: Arc<dyn NetworkLink> = Arc::new(link);
    let transport = Arc::new(Transport::new(link, node.retransmit.transport_config())?);
    let process = NetProcess::new(transport.clone());

    let started = Instant::now();
    let total = match args.mode {
        Mode::Listen { .. } => listen(&process, node.port)?,
        Mode::Connect { host, .. } => connect(&process, host, node.port)?,
    };

    tracing::info!(
        "{} bytes in {:?}: {}",
        total,
        started.elapsed(),
        compact_stats(&transport.stats(), &transport.link_stats())
    );
    transport.shutdown();
    Ok(())
}
