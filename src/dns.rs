use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};

use crate::{Error, Result};

const RESOLVE_ATTEMPTS: usize = 4;

/// Whether `host` is the placeholder that puts a stream in server-only mode.
pub fn is_server_only(host: &str) -> bool {
    host == "0" || host == "0.0.0.0"
}

/// Resolves `host` to its first IPv4 address. Dotted-quad literals are taken
/// as they are; names are looked up at most four times.
pub fn resolve(host: &str) -> Result<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    for attempt in 1..=RESOLVE_ATTEMPTS {
        match (host, 0).to_socket_addrs() {
            Ok(addrs) => {
                let found = addrs.into_iter().find_map(|addr| match addr.ip() {
                    IpAddr::V4(ip) => Some(ip),
                    IpAddr::V6(_) => None,
                });
                if let Some(ip) = found {
                    log::debug!("Resolved {host} to {ip}");
                    return Ok(ip);
                }
            }
            Err(e) => log::debug!("Lookup {attempt}/{RESOLVE_ATTEMPTS} of {host} failed: {e}"),
        }
    }
    log::error!("Unable to resolve host name {host}");
    Err(Error::Resolve { host: host.to_string() })
}
