//! Parallel exchanges over a set of streams.
//!
//! Every exchange call splits its payload over the streams it is given and
//! runs one worker per stream, the first on the calling thread and the rest
//! on scoped threads. A worker drives its socket(s) with non-blocking sends
//! and receives until both of its directions are done. The call returns
//! once every worker has been joined.
//!
//! Dynamic exchanges put the 8-byte total in front of the data on every
//! sending stream. Each receiving worker reads the prefix from its own
//! stream; the first one to decode it splits the receive buffer for all of
//! them.

use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::first_failure;
use crate::manager::ChannelManager;
use crate::path::PathId;
use crate::socket::{Progress, Readiness, Selector, Socket, irecv, isend};
use crate::split::{split_mut, split_ref};
use crate::stream::{Role, StreamState};
use crate::wire::{self, SIZE_PREFIX_LEN};
use crate::{Error, Result};

/// Token exchanged by [`ChannelManager::barrier`].
const BARRIER_TOKEN: &[u8; 8] = b"Test 1!\0";

/// Streams one exchange worker uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Only sends, on this stream.
    Send(usize),
    /// Only receives, on this stream.
    Recv(usize),
    /// Sends on one stream and receives on another (possibly the same).
    Pair {
        /// Sending stream.
        send: usize,
        /// Receiving stream.
        recv: usize,
    },
}

impl Route {
    /// Workers of a cycle: worker `i` sends on `send[i]` and receives on
    /// `recv[i]`, as far as each list reaches.
    pub fn pairing(send: &[usize], recv: &[usize]) -> Vec<Route> {
        (0..send.len().max(recv.len()))
            .filter_map(|i| match (send.get(i), recv.get(i)) {
                (Some(&send), Some(&recv)) => Some(Route::Pair { send, recv }),
                (Some(&send), None) => Some(Route::Send(send)),
                (None, Some(&recv)) => Some(Route::Recv(recv)),
                (None, None) => None,
            })
            .collect()
    }

    /// Sending stream, if any.
    pub fn send_channel(&self) -> Option<usize> {
        match *self {
            Route::Send(send) | Route::Pair { send, .. } => Some(send),
            Route::Recv(_) => None,
        }
    }

    /// Receiving stream, if any.
    pub fn recv_channel(&self) -> Option<usize> {
        match *self {
            Route::Recv(recv) | Route::Pair { recv, .. } => Some(recv),
            Route::Send(_) => None,
        }
    }

    fn label(&self) -> usize {
        match *self {
            Route::Send(channel) | Route::Recv(channel) | Route::Pair { send: channel, .. } => {
                channel
            }
        }
    }
}

/// Receive side of one worker.
enum Incoming<'a> {
    Nothing,
    Fixed(&'a mut [u8]),
    /// Waiting for the size prefix.
    Announced { header: [u8; SIZE_PREFIX_LEN], got: usize },
}

struct Announcement<'a> {
    total: Option<u64>,
    buf: Option<&'a mut [u8]>,
    parts: Vec<Option<&'a mut [u8]>>,
}

/// Receive buffer of a dynamic exchange, split once its size is known.
struct Announced<'a> {
    max: usize,
    receivers: usize,
    hang_on_oversize: bool,
    state: Mutex<Announcement<'a>>,
}

impl<'a> Announced<'a> {
    fn new(buf: &'a mut [u8], receivers: usize, hang_on_oversize: bool) -> Self {
        Announced {
            max: buf.len(),
            receivers,
            hang_on_oversize,
            state: Mutex::new(Announcement { total: None, buf: Some(buf), parts: Vec::new() }),
        }
    }

    /// Records the total found on `channel` and hands worker `id` its part
    /// of the receive buffer.
    fn publish(&self, id: usize, channel: usize, total: u64) -> Result<&'a mut [u8]> {
        let mut state = self.state.lock();
        let known = state.total;
        match known {
            Some(expected) if expected != total => {
                return Err(Error::SizeMismatch { channel, found: total, expected });
            }
            Some(_) => {}
            None => {
                let len = match usize::try_from(total) {
                    Ok(len) if len <= self.max => len,
                    _ => {
                        log::error!(
                            "[{channel}] Announced size {total} is greater than the receive \
                             bound {}",
                            self.max
                        );
                        if self.hang_on_oversize {
                            drop(state);
                            log::error!("[{channel}] Going to sleep, so a trace can be taken");
                            loop {
                                thread::sleep(Duration::from_secs(1));
                            }
                        }
                        return Err(Error::SizeExceeded { declared: total, max: self.max });
                    }
                };
                let buf = state.buf.take().unwrap_or_default();
                let buf = &mut buf[..len];
                state.parts = split_mut(buf, self.receivers).into_iter().map(Some).collect();
                state.total = Some(total);
            }
        }
        state
            .parts
            .get_mut(id)
            .and_then(Option::take)
            .ok_or_else(|| Error::InvalidArgument(format!("no receive share for worker {id}")))
    }

    fn total(&self) -> Option<u64> {
        self.state.lock().total
    }
}

/// Settings and shared state of one exchange call.
struct CallContext<'r, 'a> {
    select_timeout: Duration,
    send_chunk: usize,
    recv_chunk: usize,
    delay: Option<Duration>,
    abort: AtomicBool,
    announced: Option<&'r Announced<'a>>,
}

impl<'r, 'a> CallContext<'r, 'a> {
    fn new(config: &Config, announced: Option<&'r Announced<'a>>) -> Self {
        CallContext {
            select_timeout: config.select_timeout,
            send_chunk: config.send_chunk.max(1),
            recv_chunk: config.recv_chunk.max(1),
            delay: config.exchange_delay(),
            abort: AtomicBool::new(false),
            announced,
        }
    }
}

struct Worker<'a> {
    id: usize,
    route: Route,
    send_conn: Option<Arc<TcpStream>>,
    recv_conn: Option<Arc<TcpStream>>,
    outgoing: &'a [u8],
    prefix: Option<[u8; SIZE_PREFIX_LEN]>,
    incoming: Incoming<'a>,
}

impl<'a> Worker<'a> {
    fn run(self, ctx: &CallContext<'_, 'a>) -> Result<()> {
        let channel = self.route.label();
        let result = self.drive(ctx);
        if let Err(e) = &result {
            if !matches!(e, Error::Aborted(_)) {
                log::warn!("[{channel}] Exchange worker failed: {e}");
            }
            ctx.abort.store(true, Ordering::Release);
        }
        result
    }

    fn drive(self, ctx: &CallContext<'_, 'a>) -> Result<()> {
        let Worker { id, route, send_conn, recv_conn, outgoing, prefix, mut incoming } = self;
        let channel = route.label();
        let recv_channel = route.recv_channel().unwrap_or(channel);

        let reader = recv_conn.as_deref();
        let writer = send_conn.as_deref();
        // A pair on one stream registers it once and uses slot 0 both ways.
        let (selector, recv_slot, send_slot) = match (reader, writer) {
            (Some(r), Some(w)) if std::ptr::eq(r, w) => (Selector::new(r, None), 0, 0),
            (Some(r), Some(w)) => (Selector::new(r, Some(w)), 0, 1),
            (Some(r), None) => (Selector::new(r, None), 0, 0),
            (None, Some(w)) => (Selector::new(w, None), 0, 0),
            (None, None) => return Ok(()),
        };
        let mut selector = selector.map_err(|e| Error::io(channel, e))?;

        let prefix_len = if prefix.is_some() { SIZE_PREFIX_LEN } else { 0 };
        let mut prefix_sent = 0;
        let mut sent = 0;
        let mut received = 0;

        loop {
            let want_read = match &incoming {
                Incoming::Nothing => false,
                Incoming::Fixed(buf) => received < buf.len(),
                Incoming::Announced { .. } => true,
            } && reader.is_some();
            let want_write =
                (prefix_sent < prefix_len || sent < outgoing.len()) && writer.is_some();
            if !want_read && !want_write {
                return Ok(());
            }
            if ctx.abort.load(Ordering::Acquire) {
                return Err(Error::Aborted(channel));
            }

            let mut interest = [Readiness::default(); 2];
            interest[recv_slot].readable |= want_read;
            interest[send_slot].writable |= want_write;
            let ready = selector
                .wait(interest, ctx.select_timeout)
                .map_err(|e| Error::io(channel, e))?;

            if let Some(conn) = reader.filter(|_| want_read && ready[recv_slot].readable) {
                let mut announced_total = None;
                match &mut incoming {
                    Incoming::Announced { header, got } => match irecv(conn, &mut header[*got..]) {
                        Ok(Progress::Moved(n)) => {
                            *got += n;
                            if *got == SIZE_PREFIX_LEN {
                                announced_total = Some(wire::decode_size(header)?);
                            }
                        }
                        Ok(Progress::Idle) => {}
                        Ok(Progress::Closed) => {
                            return Err(Error::RemoteClosed {
                                channel: recv_channel,
                                transferred: *got,
                                expected: SIZE_PREFIX_LEN,
                            });
                        }
                        Err(e) => return Err(Error::io(recv_channel, e)),
                    },
                    Incoming::Fixed(buf) => {
                        let end = (received + ctx.recv_chunk).min(buf.len());
                        match irecv(conn, &mut buf[received..end]) {
                            Ok(Progress::Moved(n)) => received += n,
                            Ok(Progress::Idle) => {}
                            Ok(Progress::Closed) => {
                                return Err(Error::RemoteClosed {
                                    channel: recv_channel,
                                    transferred: received,
                                    expected: buf.len(),
                                });
                            }
                            Err(e) => return Err(Error::io(recv_channel, e)),
                        }
                    }
                    Incoming::Nothing => {}
                }
                if let Some(total) = announced_total {
                    let announced = ctx.announced.ok_or_else(|| {
                        Error::InvalidArgument("dynamic receive without a buffer".into())
                    })?;
                    incoming = Incoming::Fixed(announced.publish(id, recv_channel, total)?);
                }
            }

            if let Some(conn) = writer.filter(|_| want_write && ready[send_slot].writable) {
                let send_channel = route.send_channel().unwrap_or(channel);
                match prefix {
                    Some(prefix) if prefix_sent < prefix_len => {
                        prefix_sent += isend(conn, &prefix[prefix_sent..])
                            .map_err(|e| Error::io(send_channel, e))?;
                    }
                    _ => {
                        let end = (sent + ctx.send_chunk).min(outgoing.len());
                        sent += isend(conn, &outgoing[sent..end])
                            .map_err(|e| Error::io(send_channel, e))?;
                    }
                }
            }

            if let Some(delay) = ctx.delay {
                thread::sleep(delay);
            }
        }
    }
}

/// Runs the workers of one call and reports the first real failure.
fn run_workers<'a>(
    workers: Vec<Worker<'a>>,
    config: &Config,
    announced: Option<&Announced<'a>>,
) -> Result<()> {
    let ctx = CallContext::new(config, announced);
    let ctx = &ctx;
    thread::scope(|scope| {
        let mut workers = workers.into_iter();
        let Some(first) = workers.next() else {
            return Ok(());
        };
        let spawned: Vec<_> = workers
            .map(|worker| {
                let name = format!("mpw-xchg-{}", worker.route.label());
                let handle = thread::Builder::new()
                    .name(name.clone())
                    .spawn_scoped(scope, move || worker.run(ctx));
                if handle.is_err() {
                    ctx.abort.store(true, Ordering::Release);
                }
                (name, handle)
            })
            .collect();

        let mut results = Vec::with_capacity(spawned.len() + 1);
        results.push(first.run(ctx));
        for (name, handle) in spawned {
            results.push(match handle {
                Ok(handle) => handle.join().unwrap_or(Err(Error::WorkerPanicked(name))),
                Err(e) => Err(Error::Spawn(e)),
            });
        }
        first_failure(results)
    })
}

fn require_channels(channels: &[usize]) -> Result<()> {
    if channels.is_empty() {
        return Err(Error::InvalidArgument("an exchange needs at least one channel".into()));
    }
    Ok(())
}

impl ChannelManager {
    /// Builds the workers for `routes` and runs them while holding the
    /// lifecycle lock shared.
    fn exchange<'a>(
        &self,
        routes: &[Route],
        outgoing: Vec<&'a [u8]>,
        incoming: Vec<Incoming<'a>>,
        prefix: Option<[u8; SIZE_PREFIX_LEN]>,
        announced: Option<&Announced<'a>>,
    ) -> Result<()> {
        let _shared = self.shared.lifecycle.read();
        let config = self.config();
        let volume: usize = outgoing.iter().map(|part| part.len()).sum::<usize>()
            + incoming
                .iter()
                .map(|part| match part {
                    Incoming::Fixed(buf) => buf.len(),
                    _ => 0,
                })
                .sum::<usize>();
        let workers = {
            let streams = self.shared.streams.read();
            let mut workers = Vec::with_capacity(routes.len());
            let parts = routes.iter().zip(outgoing).zip(incoming).enumerate();
            for (id, ((&route, outgoing), incoming)) in parts {
                let send_conn = route.send_channel().map(|c| streams.connection(c)).transpose()?;
                let recv_conn = route.recv_channel().map(|c| streams.connection(c)).transpose()?;
                workers.push(Worker {
                    id,
                    route,
                    send_conn,
                    recv_conn,
                    outgoing,
                    prefix: prefix.filter(|_| route.send_channel().is_some()),
                    incoming,
                });
            }
            workers
        };
        let started = Instant::now();
        run_workers(workers, &config, announced)?;
        let elapsed = started.elapsed();
        log::debug!(
            "Exchange over {} streams: {volume} bytes in {elapsed:?} ({:.1} MB/s)",
            routes.len(),
            volume as f64 / elapsed.as_secs_f64().max(1e-9) / 1e6
        );
        Ok(())
    }

    /// Sends `send` and receives exactly `recv.len()` bytes over `channels`,
    /// both split with the remainder rule. The peer must call this with the
    /// sizes swapped.
    ///
    /// On failure the bytes already received stay in `recv`.
    pub fn send_recv(&self, send: &[u8], recv: &mut [u8], channels: &[usize]) -> Result<()> {
        require_channels(channels)?;
        let n = self.config().effective_streams(channels.len(), send.len().max(recv.len()));
        let routes: Vec<Route> =
            channels[..n].iter().map(|&c| Route::Pair { send: c, recv: c }).collect();
        let outgoing = split_ref(send, n);
        let incoming = split_mut(recv, n).into_iter().map(Incoming::Fixed).collect();
        self.exchange(&routes, outgoing, incoming, None, None)
    }

    /// Sends `send` over `channels`.
    pub fn send(&self, send: &[u8], channels: &[usize]) -> Result<()> {
        require_channels(channels)?;
        let n = self.config().effective_streams(channels.len(), send.len());
        let routes: Vec<Route> = channels[..n].iter().map(|&c| Route::Send(c)).collect();
        let incoming = (0..n).map(|_| Incoming::Nothing).collect();
        self.exchange(&routes, split_ref(send, n), incoming, None, None)
    }

    /// Receives exactly `recv.len()` bytes over `channels`.
    pub fn recv(&self, recv: &mut [u8], channels: &[usize]) -> Result<()> {
        require_channels(channels)?;
        let n = self.config().effective_streams(channels.len(), recv.len());
        let routes: Vec<Route> = channels[..n].iter().map(|&c| Route::Recv(c)).collect();
        let incoming = split_mut(recv, n).into_iter().map(Incoming::Fixed).collect();
        self.exchange(&routes, vec![&[][..]; n], incoming, None, None)
    }

    /// Exchanges caller-split buffers: channel `i` sends `sends[i]` and
    /// receives exactly `recvs[i].len()` bytes.
    pub fn psend_recv(
        &self,
        sends: &[&[u8]],
        recvs: &mut [&mut [u8]],
        channels: &[usize],
    ) -> Result<()> {
        require_channels(channels)?;
        if sends.len() != channels.len() || recvs.len() != channels.len() {
            return Err(Error::InvalidArgument(format!(
                "{} send and {} receive buffers for {} channels",
                sends.len(),
                recvs.len(),
                channels.len()
            )));
        }
        let routes: Vec<Route> = channels
            .iter()
            .zip(sends.iter().zip(recvs.iter()))
            .map(|(&c, (send, recv))| match (send.is_empty(), recv.is_empty()) {
                (false, true) => Route::Send(c),
                (true, false) => Route::Recv(c),
                _ => Route::Pair { send: c, recv: c },
            })
            .collect();
        let incoming = recvs.iter_mut().map(|recv| Incoming::Fixed(&mut **recv)).collect();
        self.exchange(&routes, sends.to_vec(), incoming, None, None)
    }

    /// Dynamic exchange: sends `send` with its size announced and receives
    /// a message of at most `recv.len()` bytes whose size the peer
    /// announces. Returns the received size.
    pub fn dsend_recv(&self, send: &[u8], recv: &mut [u8], channels: &[usize]) -> Result<usize> {
        require_channels(channels)?;
        self.dcycle(send, recv, channels, channels)
    }

    /// Sends `send` over `send_channels` while receiving exactly
    /// `recv.len()` bytes over `recv_channels`. The two sets may differ in
    /// size; a worker beyond the end of one set only works the other.
    pub fn cycle(
        &self,
        send: &[u8],
        recv: &mut [u8],
        send_channels: &[usize],
        recv_channels: &[usize],
    ) -> Result<()> {
        check_cycle(send.len(), recv.len(), send_channels, recv_channels)?;
        if send_channels.is_empty() && recv_channels.is_empty() {
            return Ok(());
        }
        let routes = Route::pairing(send_channels, recv_channels);
        let outgoing = pad(split_some(send, send_channels.len()), routes.len(), &[][..]);
        let mut incoming: Vec<Incoming<'_>> = if recv_channels.is_empty() {
            Vec::new()
        } else {
            split_mut(recv, recv_channels.len()).into_iter().map(Incoming::Fixed).collect()
        };
        incoming.resize_with(routes.len(), || Incoming::Nothing);
        self.exchange(&routes, outgoing, incoming, None, None)
    }

    /// Dynamic [`cycle`](Self::cycle): announces the size of `send` on every
    /// send channel and learns the size of the incoming message from the
    /// receive channels. Returns the received size, 0 without receive
    /// channels.
    pub fn dcycle(
        &self,
        send: &[u8],
        recv: &mut [u8],
        send_channels: &[usize],
        recv_channels: &[usize],
    ) -> Result<usize> {
        check_cycle(send.len(), 0, send_channels, recv_channels)?;
        if send_channels.is_empty() && recv_channels.is_empty() {
            return Ok(0);
        }
        let config = self.config();
        let routes = Route::pairing(send_channels, recv_channels);
        let outgoing = pad(split_some(send, send_channels.len()), routes.len(), &[][..]);
        let prefix = wire::encode_size(send.len() as u64)?;

        let receivers = recv_channels.len();
        let announced = Announced::new(recv, receivers, config.hang_on_oversize);
        let incoming = (0..routes.len())
            .map(|i| {
                if i < receivers {
                    Incoming::Announced { header: [0; SIZE_PREFIX_LEN], got: 0 }
                } else {
                    Incoming::Nothing
                }
            })
            .collect();
        self.exchange(&routes, outgoing, incoming, Some(prefix), Some(&announced))?;

        let total = announced.total().unwrap_or(0);
        usize::try_from(total)
            .map_err(|_| Error::SizeExceeded { declared: total, max: announced.max })
    }

    /// [`send_recv`](Self::send_recv) over the streams of a path.
    pub fn send_recv_path(&self, path: PathId, send: &[u8], recv: &mut [u8]) -> Result<()> {
        let channels = self.path_streams(path)?;
        self.send_recv(send, recv, &channels)
    }

    /// [`send`](Self::send) over the streams of a path.
    pub fn send_path(&self, path: PathId, send: &[u8]) -> Result<()> {
        let channels = self.path_streams(path)?;
        self.send(send, &channels)
    }

    /// [`recv`](Self::recv) over the streams of a path.
    pub fn recv_path(&self, path: PathId, recv: &mut [u8]) -> Result<()> {
        let channels = self.path_streams(path)?;
        self.recv(recv, &channels)
    }

    /// [`dsend_recv`](Self::dsend_recv) over the streams of a path.
    pub fn dsend_recv_path(&self, path: PathId, send: &[u8], recv: &mut [u8]) -> Result<usize> {
        let channels = self.path_streams(path)?;
        self.dsend_recv(send, recv, &channels)
    }

    /// Synchronizes with the peer of one stream.
    pub fn barrier(&self, channel: usize) -> Result<()> {
        let _shared = self.shared.lifecycle.read();
        let (socket, role) = {
            let streams = self.shared.streams.read();
            let stream = streams.get(channel)?;
            (stream.socket.clone(), stream.role)
        };
        barrier_on(&socket, role, &self.config())
    }

    /// Runs a barrier on every connected stream at once.
    pub fn barrier_all(&self) -> Result<()> {
        let _shared = self.shared.lifecycle.read();
        let config = self.config();
        let targets: Vec<(usize, Arc<Socket>, Role)> = self
            .shared
            .streams
            .read()
            .live()
            .filter(|(_, stream)| stream.state == StreamState::Connected)
            .map(|(index, stream)| (index, stream.socket.clone(), stream.role))
            .collect();
        let config = &config;
        thread::scope(|scope| {
            let spawned: Vec<_> = targets
                .iter()
                .map(|(index, socket, role)| {
                    let name = format!("mpw-barrier-{index}");
                    let handle = thread::Builder::new()
                        .name(name.clone())
                        .spawn_scoped(scope, move || barrier_on(socket, *role, config));
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

fn barrier_on(socket: &Socket, role: Role, config: &Config) -> Result<()> {
    let (timeout, retries) = (config.select_timeout, config.blocking_retries);
    let mut token = [0u8; 8];
    match role {
        Role::Client => {
            socket.send(BARRIER_TOKEN, timeout, retries)?;
            socket.recv(&mut token, timeout, retries)
        }
        Role::Server => {
            socket.recv(&mut token, timeout, retries)?;
            socket.send(&token, timeout, retries)
        }
    }
}

fn check_cycle(
    send_len: usize,
    recv_len: usize,
    send_channels: &[usize],
    recv_channels: &[usize],
) -> Result<()> {
    if send_len > 0 && send_channels.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "{send_len} bytes to send without send channels"
        )));
    }
    if recv_len > 0 && recv_channels.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "{recv_len} bytes to receive without receive channels"
        )));
    }
    Ok(())
}

fn split_some(buf: &[u8], n: usize) -> Vec<&[u8]> {
    if n == 0 { Vec::new() } else { split_ref(buf, n) }
}

fn pad<T: Clone>(mut items: Vec<T>, len: usize, filler: T) -> Vec<T> {
    items.resize(len, filler);
    items
}
