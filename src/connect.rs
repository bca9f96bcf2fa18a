use std::net::SocketAddrV4;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::manager::ChannelManager;
use crate::socket::Socket;
use crate::stream::{Role, StreamState};
use crate::{Error, Result};

/// What one establishment worker needs to know about its stream.
struct Attempt {
    stream: usize,
    socket: Arc<Socket>,
    outbound: Outbound,
    port: u16,
    bind: Option<u16>,
}

enum Outbound {
    /// Connect to this address first.
    To(SocketAddrV4),
    /// The host never resolved.
    Unresolved(String),
    /// Only ever listen.
    Never,
}

struct Settings {
    server_wait: bool,
    connect_timeout: Duration,
    connect_retries: u32,
    connect_backoff: Duration,
    accept_timeout: Option<Duration>,
}

impl Settings {
    fn new(config: &Config, server_wait: bool) -> Self {
        Settings {
            server_wait,
            connect_timeout: config.connect_timeout,
            connect_retries: config.connect_retries,
            connect_backoff: config.connect_backoff,
            accept_timeout: config.accept_timeout,
        }
    }
}

impl Attempt {
    fn run(&self, settings: &Settings) -> Result<Role> {
        let stream = self.stream;
        let addr = match &self.outbound {
            Outbound::To(addr) => Some(*addr),
            Outbound::Unresolved(host) => {
                log::warn!("[{stream}] Host {host} did not resolve, not connecting");
                return Err(Error::Resolve { host: host.clone() });
            }
            Outbound::Never => None,
        };

        let mut failure = None;
        if let Some(addr) = addr {
            let mut result = self.socket.connect(addr, self.bind, settings.connect_timeout);
            if !settings.server_wait {
                let mut retries = 0;
                while result.is_err() && retries < settings.connect_retries {
                    thread::sleep(settings.connect_backoff);
                    retries += 1;
                    result = self.socket.connect(addr, self.bind, settings.connect_timeout);
                }
            }
            log::debug!("[{stream}] Attempt to connect as client to {addr}: {}", result.is_ok());
            match result {
                Ok(()) => return Ok(Role::Client),
                Err(e) => failure = Some(e),
            }
        }

        self.socket.close();
        if !settings.server_wait {
            return Err(failure.unwrap_or(Error::NotConnected(stream)));
        }
        self.socket.serve(self.port, settings.accept_timeout).inspect_err(|e| {
            log::warn!("[{stream}] Acting as server on port {} failed: {e}", self.port);
        })?;
        log::debug!("[{stream}] Connected as server on port {}", self.port);
        Ok(Role::Server)
    }
}

impl ChannelManager {
    /// Connects every stream in `indices` in parallel, one worker per stream.
    ///
    /// Client streams connect out first. With `server_wait` they fall back
    /// to listening on their port after a single failed attempt; without it
    /// they retry with a backoff and never listen. Streams that already
    /// ended up as servers, or that were registered server-only, listen
    /// directly when `server_wait` is set.
    pub(crate) fn init_streams(&self, indices: &[usize], server_wait: bool) -> Result<()> {
        if indices.is_empty() {
            return Ok(());
        }
        // Accepting peers can block indefinitely; doing it under the accept
        // lock rather than the lifecycle lock keeps exchanges on other
        // streams running in the meantime.
        let _accept = server_wait.then(|| self.shared.accept.lock());
        let _shared = (!server_wait).then(|| self.shared.lifecycle.read());

        let settings = Settings::new(&self.shared.config.read(), server_wait);
        let attempts = {
            let mut streams = self.shared.streams.write();
            let mut attempts = Vec::with_capacity(indices.len());
            for &index in indices {
                let stream = streams.get_mut(index)?;
                stream.state = StreamState::Connecting;
                let outbound = match (stream.role, stream.target()) {
                    (Role::Server, _) => Outbound::Never,
                    (Role::Client, Some(addr)) => Outbound::To(addr),
                    (Role::Client, None) => Outbound::Unresolved(stream.host.clone()),
                };
                attempts.push(Attempt {
                    stream: index,
                    socket: stream.socket.clone(),
                    outbound,
                    port: stream.port,
                    bind: stream.client_bind.port(),
                });
            }
            attempts
        };

        let outcomes = establish(&attempts, &settings);

        let mut streams = self.shared.streams.write();
        let mut failed = Vec::new();
        for (attempt, outcome) in attempts.iter().zip(outcomes) {
            let Ok(stream) = streams.get_mut(attempt.stream) else {
                failed.push(attempt.stream);
                continue;
            };
            match outcome {
                Ok(role) => {
                    stream.role = role;
                    stream.state = StreamState::Connected;
                }
                Err(e) => {
                    log::warn!("One connection has failed: #{}: {e}", attempt.stream);
                    stream.state = StreamState::Failed;
                    failed.push(attempt.stream);
                }
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::EstablishFailed { failed, total: indices.len() })
        }
    }
}

/// Runs every attempt, the first one on the calling thread.
fn establish(attempts: &[Attempt], settings: &Settings) -> Vec<Result<Role>> {
    thread::scope(|scope| {
        let spawned: Vec<_> = attempts[1..]
            .iter()
            .map(|attempt| {
                let name = format!("mpw-conn-{}", attempt.stream);
                let handle = thread::Builder::new()
                    .name(name.clone())
                    .spawn_scoped(scope, move || attempt.run(settings));
                (name, handle)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(attempts.len());
        outcomes.push(attempts[0].run(settings));
        for (name, handle) in spawned {
            let outcome = match handle {
                Ok(handle) => handle.join().unwrap_or(Err(Error::WorkerPanicked(name))),
                Err(e) => Err(Error::Spawn(e)),
            };
            outcomes.push(outcome);
        }
        outcomes
    })
}
