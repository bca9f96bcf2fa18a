use clap::Parser;
use mpath_tcp::{ChannelManager, PathId};
use tracing_subscriber::filter::EnvFilter;

/// One forwarding link: traffic between the `src` path and the `dst` path.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Link {
    src: (String, u16),
    dst: (String, u16),
    streams: usize,
}

fn parse_endpoint(s: &str) -> Result<(String, u16), String> {
    let (host, port) =
        s.rsplit_once(':').ok_or_else(|| format!("expected <host>:<port>, found `{s}`"))?;
    let port = port.parse().map_err(|e| format!("bad port in `{s}`: {e}"))?;
    Ok((host.to_string(), port))
}

fn parse_link(s: &str) -> Result<Link, String> {
    let parts: Vec<&str> = s.split(',').collect();
    let [src, dst, streams] = parts.as_slice() else {
        return Err(format!(
            "expected <src_host>:<src_port>,<dst_host>:<dst_port>,<streams>, found `{s}`"
        ));
    };
    let streams = streams.parse().map_err(|e| format!("bad stream count in `{s}`: {e}"))?;
    if streams == 0 {
        return Err("a link needs at least one stream".into());
    }
    Ok(Link { src: parse_endpoint(src)?, dst: parse_endpoint(dst)?, streams })
}

fn open(
    manager: &ChannelManager,
    (host, port): &(String, u16),
    streams: usize,
) -> mpath_tcp::Result<PathId> {
    let path = manager.create_path(host, *port, streams)?;
    println!("Path {path} to {host}:{port} connected over {streams} streams");
    Ok(path)
}

/// Connects both paths of every link, then relays all of their stream
/// pairs in one call until every pair has been closed.
fn forward(manager: &ChannelManager, links: &[Link]) -> mpath_tcp::Result<()> {
    let mut channels = Vec::new();
    let mut channels2 = Vec::new();
    for link in links {
        let src = open(manager, &link.src, link.streams)?;
        let dst = open(manager, &link.dst, link.streams)?;
        channels.extend(manager.path_streams(src)?);
        channels2.extend(manager.path_streams(dst)?);
    }
    println!("Relaying {} stream pairs over {} links", channels.len(), links.len());
    manager.relay(&channels, &channels2)
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
    let manager = ChannelManager::default();
    if let Some(rate) = args.pacing {
        manager.set_auto_tuning(false);
        manager.set_pacing_rate((rate > 0.0).then_some(rate * 1024.0 * 1024.0));
    }

    let result = forward(&manager, &args.link);
    manager.finalize();
    if let Err(e) = result {
        eprintln!("forwarder: {e}");
        std::process::exit(1);
    }
}

/// Relay node: forwards every stream of one path to the matching stream of another
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// A link <src_host>:<src_port>,<dst_host>:<dst_port>,<streams>; host "0" waits for the peer.
    #[arg(short, long, required = true, value_parser = parse_link)]
    link: Vec<Link>,
    /// Per-stream pacing rate in MiB/s, 0 disables pacing (disables auto-tuning)
    #[arg(long)]
    pacing: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_parse() {
        let link = parse_link("0:6000,remote.example.org:7000,8").unwrap();
        assert_eq!(link.src, ("0".to_string(), 6000));
        assert_eq!(link.dst, ("remote.example.org".to_string(), 7000));
        assert_eq!(link.streams, 8);
        assert!(parse_link("0:6000,1.2.3.4:7000").is_err());
        assert!(parse_link("0:6000,1.2.3.4,2").is_err());
        assert!(parse_link("0:6000,1.2.3.4:7000,0").is_err());
    }
}
