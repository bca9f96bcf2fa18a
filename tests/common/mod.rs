#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::Duration;

use mpath_tcp::{ChannelManager, Config, Pacing, PathId};

static NEXT_BASE: AtomicU16 = AtomicU16::new(0);

/// Finds `n` consecutive ports that can currently be bound on all
/// interfaces.
pub fn free_port_range(n: u16) -> u16 {
    let offset = (std::process::id() % 97) as u16 * 256;
    loop {
        let step = NEXT_BASE.fetch_add(n + 1, Ordering::Relaxed);
        let base = 20000 + (offset + step) % 30000;
        let bound: Vec<_> = (base..base + n)
            .map_while(|port| {
                TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).ok()
            })
            .collect();
        if bound.len() == usize::from(n) {
            return base;
        }
    }
}

pub fn test_config() -> Config {
    Config {
        pacing: Pacing::Disabled,
        auto_tuning: false,
        accept_timeout: Some(Duration::from_secs(30)),
        ..Config::default()
    }
}

/// Two managers connected by one path each.
pub struct Link {
    pub server: ChannelManager,
    pub server_path: PathId,
    pub client: ChannelManager,
    pub client_path: PathId,
}

impl Link {
    pub fn server_streams(&self) -> Vec<usize> {
        self.server.path_streams(self.server_path).unwrap()
    }

    pub fn client_streams(&self) -> Vec<usize> {
        self.client.path_streams(self.client_path).unwrap()
    }
}

/// Connects a server-only manager and a client manager over `n` loopback
/// streams.
pub fn connect_link(n: usize, config: Config) -> Link {
    let base = free_port_range(n as u16);
    let server = ChannelManager::new(config.clone());
    let client = ChannelManager::new(config);
    let (server_path, client_path) = thread::scope(|s| {
        let serving = s.spawn(|| server.create_path("0", base, n));
        let client_path = client.create_path_without_connect("127.0.0.1", base, n).unwrap();
        client.connect_path(client_path, false).unwrap();
        (serving.join().unwrap().unwrap(), client_path)
    });
    Link { server, server_path, client, client_path }
}

/// Runs both closures at once and returns their results.
pub fn both<A, B, RA, RB>(a: A, b: B) -> (RA, RB)
where
    A: FnOnce() -> RA + Send,
    B: FnOnce() -> RB + Send,
    RA: Send,
    RB: Send,
{
    thread::scope(|s| {
        let a = s.spawn(a);
        let rb = b();
        (a.join().unwrap(), rb)
    })
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ seed).collect()
}
