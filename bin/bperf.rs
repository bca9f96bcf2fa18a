use clap::Parser;
use mpath_tcp::{ChannelManager, PathId};
use std::time::{Duration, Instant};
use tracing_subscriber::filter::EnvFilter;

const MIB: f64 = (1024 * 1024) as f64;

fn open_path(manager: &ChannelManager, args: &Args) -> mpath_tcp::Result<PathId> {
    if mpath_tcp::is_server_only(&args.host) {
        println!("Waiting for {} streams on ports {}..", args.streams, args.port);
        return manager.create_path(&args.host, args.port, args.streams);
    }
    let path = manager.create_path_without_connect(&args.host, args.port, args.streams)?;
    if let Err(e) = manager.connect_path(path, false) {
        manager.destroy_path(path)?;
        return Err(e);
    }
    Ok(path)
}

fn configure(manager: &ChannelManager, args: &Args) {
    if let Some(chunk) = args.chunk {
        manager.set_chunk_size(chunk, chunk);
    }
    if let Some(rate) = args.pacing {
        manager.set_auto_tuning(false);
        manager.set_pacing_rate((rate > 0.0).then_some(rate * MIB));
    }
}

fn exchange(
    manager: &ChannelManager,
    path: PathId,
    args: &Args,
    send: &[u8],
    recv: &mut Vec<u8>,
) -> mpath_tcp::Result<()> {
    if !args.nonblocking {
        return manager.send_recv_path(path, send, recv);
    }
    let id = manager.isend_recv(path, send.to_vec(), recv.len())?;
    let mut polls = 0u64;
    while !manager.has_finished(id)? {
        polls += 1;
        std::thread::sleep(Duration::from_micros(100));
    }
    let output = manager.wait(id)?;
    tracing::debug!("Exchange {id} finished after {polls} polls");
    *recv = output.received;
    Ok(())
}

fn run(args: Args) -> mpath_tcp::Result<()> {
    let manager = ChannelManager::default();
    configure(&manager, &args);
    let path = open_path(&manager, &args)?;
    println!("Path {path} connected over {} streams", args.streams);
    if let Some(window) = args.window {
        manager.set_path_window(path, window)?;
    }
    manager.print();

    let send = vec![42u8; args.size];
    let mut recv = vec![0u8; args.size];
    for iteration in 0..args.iterations {
        let start = Instant::now();
        exchange(&manager, path, &args, &send, &mut recv)?;
        let delta = start.elapsed();
        let throughput = ((2 * args.size * 8) as f64 / delta.as_secs_f64()) / 10f64.powi(6);
        println!("[{iteration}]: {throughput:.1} Mbps ({:.3}s)", delta.as_secs_f64());
        if recv.iter().any(|&b| b != 42) {
            println!("[{iteration}]: received payload is corrupted");
        }
    }

    manager.barrier_all()?;
    manager.destroy_path(path)?;
    manager.finalize();
    Ok(())
}

fn init_env_filter(env_filter: EnvFilter) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_level(true)
        .with_target(true);

    let subscriber = subscriber.finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() {
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("Failed to set logger: {e}");
    }

    // Initialize tracing subscriber
    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        init_env_filter(env_filter);
    }

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("bperf: {e}");
        std::process::exit(1);
    }
}

/// Path throughput benchmark: both ends exchange `size` bytes per iteration
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The peer host; "0" waits for the peer on the local ports.
    #[arg(short = 'H', long)]
    host: String,
    /// The first port of the path; stream i uses port + i.
    #[arg(short, long, default_value = "16256")]
    port: u16,
    /// The number of streams in the path
    #[arg(short = 'n', long, default_value = "4")]
    streams: usize,
    /// The message size, in bytes, exchanged each way per iteration
    #[arg(short, long, default_value = "8388608")]
    size: usize,
    /// The number of exchanges
    #[arg(short, long, default_value = "10")]
    iterations: usize,
    /// Per-stream pacing rate in MiB/s, 0 disables pacing (disables auto-tuning)
    #[arg(long)]
    pacing: Option<f64>,
    /// TCP window per stream, in bytes
    #[arg(short, long)]
    window: Option<usize>,
    /// Send/recv chunk size, in bytes
    #[arg(short, long)]
    chunk: Option<usize>,
    /// Use non-blocking exchanges and poll for their completion
    #[arg(long)]
    nonblocking: bool,
}
