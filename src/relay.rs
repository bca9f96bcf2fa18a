use std::io;
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::error::first_failure;
use crate::manager::ChannelManager;
use crate::socket::{Progress, Readiness, Selector, irecv, isend};
use crate::{Error, Result};

/// Bounce buffer carrying one direction of a relayed stream pair.
struct Direction {
    buf: Vec<u8>,
    filled: usize,
    flushed: usize,
    eof: bool,
    shut: bool,
}

impl Direction {
    fn new(capacity: usize) -> Self {
        Direction { buf: vec![0; capacity.max(1)], filled: 0, flushed: 0, eof: false, shut: false }
    }

    fn wants_read(&self) -> bool {
        !self.eof && (self.filled < self.buf.len() || self.flushed == self.filled)
    }

    fn wants_write(&self) -> bool {
        self.flushed < self.filled
    }

    fn pull(&mut self, from: &TcpStream, chunk: usize) -> io::Result<()> {
        if self.flushed == self.filled {
            self.filled = 0;
            self.flushed = 0;
        }
        let end = (self.filled + chunk).min(self.buf.len());
        match irecv(from, &mut self.buf[self.filled..end])? {
            Progress::Moved(n) => self.filled += n,
            Progress::Closed => self.eof = true,
            Progress::Idle => {}
        }
        Ok(())
    }

    fn push(&mut self, to: &TcpStream, chunk: usize) -> io::Result<()> {
        if !self.wants_write() {
            return Ok(());
        }
        let end = (self.flushed + chunk).min(self.filled);
        self.flushed += isend(to, &self.buf[self.flushed..end])?;
        Ok(())
    }

    /// Passes an end-of-stream on once everything before it was forwarded.
    fn finish(&mut self, to: &TcpStream) {
        if self.eof && !self.shut && !self.wants_write() {
            if let Err(e) = to.shutdown(Shutdown::Write) {
                log::debug!("Write shutdown after relayed close failed: {e}");
            }
            self.shut = true;
        }
    }
}

struct PumpSettings {
    send_chunk: usize,
    recv_chunk: usize,
    select_timeout: Duration,
    delay: Option<Duration>,
}

impl PumpSettings {
    fn new(config: &Config) -> Self {
        PumpSettings {
            send_chunk: config.relay_send_chunk.max(1),
            recv_chunk: config.relay_recv_chunk.max(1),
            select_timeout: config.select_timeout,
            delay: config.relay_delay(),
        }
    }
}

/// Forwards bytes both ways between `a` and `b` until both directions have
/// been closed by their senders and drained.
fn pump(
    a: &TcpStream,
    b: &TcpStream,
    channels: (usize, usize),
    settings: &PumpSettings,
) -> Result<()> {
    let (ch_a, ch_b) = channels;
    let capacity = settings.send_chunk.max(settings.recv_chunk);
    let mut forward = Direction::new(capacity);
    let mut backward = Direction::new(capacity);
    let mut selector = Selector::new(a, Some(b)).map_err(|e| Error::io(ch_a, e))?;
    log::debug!("Starting relay #{ch_a} <-> #{ch_b}");

    loop {
        forward.finish(b);
        backward.finish(a);
        if forward.shut && backward.shut {
            log::debug!("Relay #{ch_a} <-> #{ch_b} closed on both sides");
            return Ok(());
        }

        let interest = [
            Readiness::new(forward.wants_read(), backward.wants_write()),
            Readiness::new(backward.wants_read(), forward.wants_write()),
        ];
        let ready = selector
            .wait(interest, settings.select_timeout)
            .map_err(|e| Error::io(ch_a, e))?;

        if ready[0].readable {
            forward.pull(a, settings.recv_chunk).map_err(|e| Error::io(ch_a, e))?;
            log::trace!("Retrieved from #{ch_a}: {}", forward.filled);
        }
        if ready[1].writable {
            forward.push(b, settings.send_chunk).map_err(|e| Error::io(ch_b, e))?;
        }
        if ready[1].readable {
            backward.pull(b, settings.recv_chunk).map_err(|e| Error::io(ch_b, e))?;
            log::trace!("Retrieved from #{ch_b}: {}", backward.filled);
        }
        if ready[0].writable {
            backward.push(a, settings.send_chunk).map_err(|e| Error::io(ch_a, e))?;
        }

        if let Some(delay) = settings.delay {
            thread::sleep(delay);
        }
    }
}

impl ChannelManager {
    /// Forwards traffic between `channels[i]` and `channels2[i]` in both
    /// directions, one thread per pair, without interpreting it.
    ///
    /// A pair ends when both of its streams have been closed by their peers
    /// and everything received was passed on; a close on one side is
    /// passed on as a write shutdown of the other. Returns once every pair
    /// has ended.
    ///
    /// Paths can be created and destroyed while a relay runs. Closing or
    /// destroying a relayed stream shuts its connection down, which ends
    /// the pair it belongs to.
    pub fn relay(&self, channels: &[usize], channels2: &[usize]) -> Result<()> {
        if channels.len() != channels2.len() {
            return Err(Error::InvalidArgument(format!(
                "cannot pair {} channels with {} channels",
                channels.len(),
                channels2.len()
            )));
        }
        if let Some((a, _)) = channels.iter().zip(channels2).find(|(a, b)| a == b) {
            return Err(Error::InvalidArgument(format!("channel #{a} cannot be relayed to itself")));
        }

        let settings = PumpSettings::new(&self.config());
        // The pumps own clones of the connections, so the registry stays
        // free for other paths while they run.
        let pairs = {
            let _shared = self.shared.lifecycle.read();
            let streams = self.shared.streams.read();
            let mut pairs = Vec::with_capacity(channels.len());
            for (&a, &b) in channels.iter().zip(channels2) {
                pairs.push(((a, b), streams.connection(a)?, streams.connection(b)?));
            }
            pairs
        };
        let settings = &settings;

        thread::scope(|scope| {
            let spawned: Vec<_> = pairs
                .iter()
                .map(|(labels, a, b)| {
                    let name = format!("mpw-relay-{}-{}", labels.0, labels.1);
                    let handle = thread::Builder::new()
                        .name(name.clone())
                        .spawn_scoped(scope, move || pump(a, b, *labels, settings));
                    (name, handle)
                })
                .collect();
            first_failure(spawned.into_iter().map(|(name, handle)| match handle {
                Ok(handle) => handle.join().unwrap_or(Err(Error::WorkerPanicked(name))),
                Err(e) => Err(Error::Spawn(e)),
            }))
        })
    }
}
