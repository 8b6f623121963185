//! reltp Simulator - many clients, one listener, one lossy medium
//!
//! Runs every host in-process on a simulated network. Each client connects
//! to the server, sends its message and closes; the server accepts, prints
//! what arrived and the statistics of every host.

use clap::Parser;
use reltp::io::{NetworkLink, SimulatedNetwork};
use reltp::{NetProcess, Transport};
use reltp_cli::{display_host_stats, format_duration, Config, RetransmitSection, SimConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const SERVER_LINK: u8 = 0;

#[derive(Parser, Debug)]
#[command(name = "reltp-sim")]
#[command(about = "Simulated reltp network", long_about = None)]
struct Args {
    /// TOML configuration file with a [sim] section
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of client hosts
    #[arg(short = 'n', long)]
    clients: Option<u8>,

    /// Frame delivery probability (0.0 to 1.0)
    #[arg(short, long)]
    reliability: Option<f64>,

    /// Seed for a reproducible loss pattern
    #[arg(long)]
    seed: Option<u64>,

    /// Per-frame wire latency in milliseconds
    #[arg(long)]
    latency_ms: Option<u64>,

    /// Server port
    #[arg(short, long)]
    port: Option<u8>,

    /// Give up on the run after this many seconds
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(args: &Args) -> anyhow::Result<SimConfig> {
    let mut sim = match &args.config {
        Some(path) => Config::from_file(path)?
            .sim
            .ok_or_else(|| anyhow::anyhow!("{} has no [sim] section", path.display()))?,
        None => SimConfig {
            clients: 3,
            reliability: 1.0,
            seed: None,
            latency_ms: 0,
            port: 15,
            message: "hello over an unreliable link".to_string(),
            retransmit: RetransmitSection::default(),
        },
    };

    if let Some(clients) = args.clients {
        sim.clients = clients;
    }
    if let Some(reliability) = args.reliability {
        sim.reliability = reliability;
    }
    if args.seed.is_some() {
        sim.seed = args.seed;
    }
    if let Some(latency_ms) = args.latency_ms {
        sim.latency_ms = latency_ms;
    }
    if let Some(port) = args.port {
        sim.port = port;
    }
    sim.validate()?;
    Ok(sim)
}

fn start_host(network: &SimulatedNetwork, link: u8, sim: &SimConfig) -> anyhow::Result<NetProcess> {
    let link: Arc<dyn NetworkLink> = Arc::new(network.attach(link)?);
    let transport = Transport::new(link, sim.retransmit.transport_config())?;
    Ok(NetProcess::new(Arc::new(transport)))
}

fn run_client(process: NetProcess, port: u8, message: String, attempts: u32) -> bool {
    let link = process.transport().link_id();
    let mut fd = -1;
    for attempt in 1..=attempts {
        fd = process.connect(i32::from(SERVER_LINK), i32::from(port));
        if fd >= 0 {
            break;
        }
        tracing::warn!("client {} connect attempt {} failed", link, attempt);
    }
    if fd < 0 {
        return false;
    }

    let payload = format!("[client {}] {}", link, message);
    if process.write(fd, payload.as_bytes()) < 0 {
        tracing::warn!("client {} write failed", link);
    }
    if process.close(fd) < 0 {
        tracing::warn!("client {} close was not acknowledged", link);
    }
    true
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let sim = load_config(&args)?;
    tracing::info!(
        "simulating {} clients, reliability {}, latency {}ms",
        sim.clients,
        sim.reliability,
        sim.latency_ms
    );

    let network = match sim.seed {
        Some(seed) => SimulatedNetwork::with_seed(sim.reliability, seed),
        None => SimulatedNetwork::new(sim.reliability),
    };
    network.set_latency(sim.latency());

    let server = start_host(&network, SERVER_LINK, &sim)?;
    let mut clients = Vec::new();
    for link in 1..=sim.clients {
        let process = start_host(&network, link, &sim)?;
        let transport = process.transport().clone();
        let port = sim.port;
        let message = sim.message.clone();
        let handle = thread::Builder::new()
            .name(format!("client-{}", link))
            .spawn(move || run_client(process, port, message, 3))?;
        clients.push((link, transport, handle));
    }

    let started = Instant::now();
    let deadline = started + Duration::from_secs(args.timeout);
    let mut open: Vec<i32> = Vec::new();
    let mut received: HashMap<i32, Vec<u8>> = HashMap::new();
    let mut finished = 0usize;
    let mut buf = [0u8; 64];

    while finished < sim.clients as usize && Instant::now() < deadline {
        let fd = server.accept(i32::from(sim.port));
        if fd >= 0 {
            tracing::info!("server accepted fd {}", fd);
            open.push(fd);
        }

        open.retain(|&fd| loop {
            let n = server.read(fd, &mut buf);
            if n > 0 {
                received
                    .entry(fd)
                    .or_default()
                    .extend_from_slice(&buf[..n as usize]);
                continue;
            }
            if n < 0 {
                server.close(fd);
                finished += 1;
                let message = received.remove(&fd).unwrap_or_default();
                println!("{}", String::from_utf8_lossy(&message));
                break false;
            }
            break true;
        });

        thread::sleep(Duration::from_millis(5));
    }

    if finished < sim.clients as usize {
        tracing::warn!(
            "{} of {} connections never finished",
            sim.clients as usize - finished,
            sim.clients
        );
    }

    for (link, transport, handle) in clients {
        let connected = handle.join().unwrap_or(false);
        display_host_stats(
            &format!("CLIENT {} ({})", link, if connected { "connected" } else { "failed" }),
            &transport.stats(),
            &transport.link_stats(),
        );
    }
    let transport = server.transport();
    display_host_stats("SERVER", &transport.stats(), &transport.link_stats());
    println!("\nElapsed: {}", format_duration(started.elapsed()));

    Ok(())
}
