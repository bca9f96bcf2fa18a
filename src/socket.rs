use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddrV4, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use polling::{Event, Events, Poller};
use socket2::{Domain, Protocol, SockRef, Type};

use crate::{Error, Result};

const LISTEN_BACKLOG: i32 = 5;

/// Readiness of one socket, or the interest registered for it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Data (or an end-of-stream / error condition) can be read.
    pub readable: bool,
    /// Data can be written.
    pub writable: bool,
}

impl Readiness {
    /// Builds an interest mask.
    pub fn new(readable: bool, writable: bool) -> Self {
        Readiness { readable, writable }
    }

    fn event(self, key: usize) -> Event {
        match (self.readable, self.writable) {
            (true, true) => Event::all(key),
            (true, false) => Event::readable(key),
            (false, true) => Event::writable(key),
            (false, false) => Event::none(key),
        }
    }
}

/// Outcome of a single non-blocking receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Moved(usize),
    Idle,
    Closed,
}

fn would_block(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

/// Single non-blocking send attempt. Returns 0 when the socket is full.
pub(crate) fn isend(stream: &TcpStream, buf: &[u8]) -> io::Result<usize> {
    let mut stream = stream;
    match stream.write(buf) {
        Ok(n) => Ok(n),
        Err(e) if would_block(&e) => Ok(0),
        Err(e) => Err(e),
    }
}

/// Single non-blocking receive attempt.
pub(crate) fn irecv(stream: &TcpStream, buf: &mut [u8]) -> io::Result<Progress> {
    let mut stream = stream;
    match stream.read(buf) {
        Ok(0) => Ok(Progress::Closed),
        Ok(n) => Ok(Progress::Moved(n)),
        Err(e) if would_block(&e) => Ok(Progress::Idle),
        Err(e) => Err(e),
    }
}

/// Level-style readiness check over at most two sockets.
///
/// Slot 0 and slot 1 may refer to the same socket only if the caller passes
/// it once; the selector registers each socket a single time.
pub(crate) struct Selector<'a> {
    poller: Poller,
    events: Events,
    slots: [Option<&'a TcpStream>; 2],
}

impl<'a> Selector<'a> {
    pub(crate) fn new(first: &'a TcpStream, second: Option<&'a TcpStream>) -> io::Result<Self> {
        let poller = Poller::new()?;
        let slots = [Some(first), second];
        let mut selector = Selector { poller, events: Events::new(), slots: [None, None] };
        for (key, slot) in slots.into_iter().enumerate() {
            if let Some(stream) = slot {
                // SAFETY: `stream` is borrowed for 'a and removed from the
                // poller in `Drop`, before the borrow ends.
                unsafe { selector.poller.add(stream, Event::none(key))? };
                selector.slots[key] = Some(stream);
            }
        }
        Ok(selector)
    }

    /// Waits up to `timeout` for any of the requested conditions. An
    /// interrupted wait or a timeout reports nothing ready.
    pub(crate) fn wait(
        &mut self,
        interest: [Readiness; 2],
        timeout: Duration,
    ) -> io::Result<[Readiness; 2]> {
        for (key, slot) in self.slots.iter().enumerate() {
            if let Some(stream) = slot {
                self.poller.modify(*stream, interest[key].event(key))?;
            }
        }
        self.events.clear();
        match self.poller.wait(&mut self.events, Some(timeout)) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Default::default()),
            Err(e) => return Err(e),
        }
        let mut ready = [Readiness::default(); 2];
        for ev in self.events.iter() {
            if ev.key < 2 {
                ready[ev.key].readable |= ev.readable && interest[ev.key].readable;
                ready[ev.key].writable |= ev.writable && interest[ev.key].writable;
            }
        }
        Ok(ready)
    }
}

impl Drop for Selector<'_> {
    fn drop(&mut self) {
        for stream in self.slots.iter().flatten() {
            let _ = self.poller.delete(*stream);
        }
    }
}

fn apply_window(sock: SockRef<'_>, bytes: usize) {
    if bytes == 0 {
        return;
    }
    if let Err(e) = sock.set_send_buffer_size(bytes) {
        log::debug!("Unable to set send window to {bytes}: {e}");
    }
    if let Err(e) = sock.set_recv_buffer_size(bytes) {
        log::debug!("Unable to set receive window to {bytes}: {e}");
    }
}

fn new_tcp_socket(window: usize) -> io::Result<socket2::Socket> {
    let sock = socket2::Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    sock.set_reuse_address(true)?;
    apply_window(SockRef::from(&sock), window);
    Ok(sock)
}

/// One TCP endpoint of a stream.
///
/// The socket is replaced wholesale on every (re)connection; exchanges hold
/// their own handle to the connection they started with, so closing the
/// socket makes their pending operations fail instead of dangling.
#[derive(Debug)]
pub struct Socket {
    stream: usize,
    conn: Mutex<Option<Arc<TcpStream>>>,
    window: AtomicUsize,
}

impl Socket {
    /// Creates an unconnected socket for stream `stream`, using `window`
    /// bytes of send and receive buffer once connected (0 keeps the OS
    /// default).
    pub fn new(stream: usize, window: usize) -> Self {
        Socket { stream, conn: Mutex::new(None), window: AtomicUsize::new(window) }
    }

    /// The connected TCP stream, if any.
    pub fn connection(&self) -> Option<Arc<TcpStream>> {
        self.conn.lock().clone()
    }

    /// Whether a connection is installed.
    pub fn is_connected(&self) -> bool {
        self.conn.lock().is_some()
    }

    /// Sets the send and receive buffer sizes, now and for later connections.
    pub fn set_window(&self, bytes: usize) {
        self.window.store(bytes, Ordering::Relaxed);
        if let Some(conn) = self.conn.lock().as_ref() {
            apply_window(SockRef::from(conn.as_ref()), bytes);
        }
    }

    /// Current `(send, receive)` buffer sizes reported by the OS.
    pub fn window(&self) -> Option<(usize, usize)> {
        let conn = self.connection()?;
        let sock = SockRef::from(conn.as_ref());
        Some((sock.send_buffer_size().ok()?, sock.recv_buffer_size().ok()?))
    }

    /// Connects to `addr`, optionally binding the local end to `bind_port`
    /// first. A failed bind is logged and the connect proceeds unbound.
    pub fn connect(
        &self,
        addr: SocketAddrV4,
        bind_port: Option<u16>,
        timeout: Duration,
    ) -> Result<()> {
        let stream = self.stream;
        let sock = new_tcp_socket(self.window.load(Ordering::Relaxed))
            .map_err(|source| Error::Connect { stream, addr, source })?;
        if let Some(port) = bind_port {
            log::debug!("[{stream}] Trying to bind as client at {port}");
            if let Err(e) = sock.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into()) {
                log::warn!("[{stream}] Client bind on port {port} failed, connecting unbound: {e}");
            }
        }
        sock.connect_timeout(&addr.into(), timeout)
            .map_err(|source| Error::Connect { stream, addr, source })?;
        let conn: TcpStream = sock.into();
        conn.set_nonblocking(true).map_err(|source| Error::Connect { stream, addr, source })?;
        log::debug!("[{stream}] Connected as client to {addr}");
        self.install(conn);
        Ok(())
    }

    /// Binds `port` on all interfaces, listens and accepts exactly one peer.
    /// The listening socket is closed once the peer is accepted.
    pub fn serve(&self, port: u16, accept_timeout: Option<Duration>) -> Result<()> {
        let stream = self.stream;
        let sock = new_tcp_socket(self.window.load(Ordering::Relaxed))
            .map_err(|source| Error::Bind { stream, port, source })?;
        sock.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())
            .map_err(|source| Error::Bind { stream, port, source })?;
        sock.listen(LISTEN_BACKLOG)
            .map_err(|source| Error::Listen { stream, port, source })?;
        let listener: TcpListener = sock.into();
        log::debug!("[{stream}] Listening on port {port}");

        let (conn, peer) = accept_one(&listener, accept_timeout)
            .map_err(|source| Error::Accept { stream, port, source })?;
        conn.set_nonblocking(true).map_err(|source| Error::Accept { stream, port, source })?;
        apply_window(SockRef::from(&conn), self.window.load(Ordering::Relaxed));
        log::debug!("[{stream}] Accepted {peer} on port {port}");
        self.install(conn);
        Ok(())
    }

    fn install(&self, conn: TcpStream) {
        if let Some(old) = self.conn.lock().replace(Arc::new(conn)) {
            let _ = old.shutdown(Shutdown::Both);
        }
    }

    /// Shuts the connection down in both directions and drops it.
    pub fn close(&self) {
        if let Some(conn) = self.conn.lock().take() {
            log::debug!("[{}] Closing connection", self.stream);
            let _ = conn.shutdown(Shutdown::Both);
        }
    }

    fn require(&self) -> Result<Arc<TcpStream>> {
        self.connection().ok_or(Error::NotConnected(self.stream))
    }

    /// Sends the whole buffer, checking readiness with `timeout` and giving up
    /// after `retries` consecutive idle checks.
    pub fn send(&self, buf: &[u8], timeout: Duration, retries: u32) -> Result<()> {
        let conn = self.require()?;
        let mut selector = Selector::new(&conn, None).map_err(|e| Error::io(self.stream, e))?;
        let mut sent = 0;
        let mut idle = 0;
        while sent < buf.len() {
            let [ready, _] = selector
                .wait([Readiness::new(false, true), Readiness::default()], timeout)
                .map_err(|e| Error::io(self.stream, e))?;
            let n = if ready.writable {
                isend(&conn, &buf[sent..]).map_err(|e| Error::io(self.stream, e))?
            } else {
                0
            };
            if n == 0 {
                idle += 1;
                if idle > retries {
                    log::error!(
                        "[{}] Send timeout after {sent} of {} bytes",
                        self.stream,
                        buf.len()
                    );
                    return Err(Error::io(self.stream, io::ErrorKind::TimedOut.into()));
                }
            } else {
                idle = 0;
                sent += n;
            }
        }
        Ok(())
    }

    /// Receives exactly `buf.len()` bytes, with the same timeout policy as
    /// [`Socket::send`].
    pub fn recv(&self, buf: &mut [u8], timeout: Duration, retries: u32) -> Result<()> {
        let conn = self.require()?;
        let mut selector = Selector::new(&conn, None).map_err(|e| Error::io(self.stream, e))?;
        let expected = buf.len();
        let mut received = 0;
        let mut idle = 0;
        while received < expected {
            let [ready, _] = selector
                .wait([Readiness::new(true, false), Readiness::default()], timeout)
                .map_err(|e| Error::io(self.stream, e))?;
            let progress = if ready.readable {
                irecv(&conn, &mut buf[received..]).map_err(|e| Error::io(self.stream, e))?
            } else {
                Progress::Idle
            };
            match progress {
                Progress::Moved(n) => {
                    idle = 0;
                    received += n;
                }
                Progress::Closed => {
                    return Err(Error::RemoteClosed {
                        channel: self.stream,
                        transferred: received,
                        expected,
                    });
                }
                Progress::Idle => {
                    idle += 1;
                    if idle == 1 {
                        log::warn!(
                            "[{}] Receive timeout, will keep trying for a while",
                            self.stream
                        );
                    }
                    if idle > retries {
                        return Err(Error::io(self.stream, io::ErrorKind::TimedOut.into()));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_one(
    listener: &TcpListener,
    timeout: Option<Duration>,
) -> io::Result<(TcpStream, std::net::SocketAddr)> {
    let Some(timeout) = timeout else {
        return listener.accept();
    };
    listener.set_nonblocking(true)?;
    let poller = Poller::new()?;
    // SAFETY: the listener outlives the poller registration, which is
    // deleted before returning.
    unsafe { poller.add(listener, Event::readable(0))? };
    let deadline = Instant::now() + timeout;
    let mut events = Events::new();
    let result = loop {
        match listener.accept() {
            Ok(accepted) => break Ok(accepted),
            Err(e) if would_block(&e) => {}
            Err(e) => break Err(e),
        }
        let now = Instant::now();
        if now >= deadline {
            break Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "no peer connected before the accept deadline",
            ));
        }
        events.clear();
        if let Err(e) = poller.modify(listener, Event::readable(0)) {
            break Err(e);
        }
        match poller.wait(&mut events, Some(deadline - now)) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => break Err(e),
        }
    };
    let _ = poller.delete(listener);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        server.set_nonblocking(true).unwrap();
        (client, server)
    }

    #[test]
    fn selector_reports_writable_then_readable() {
        let (client, server) = pair();
        let timeout = Duration::from_secs(5);
        let mut selector = Selector::new(&client, Some(&server)).unwrap();

        let ready = selector
            .wait([Readiness::new(false, true), Readiness::new(true, false)], timeout)
            .unwrap();
        assert!(ready[0].writable);
        assert!(!ready[1].readable);

        assert_eq!(isend(&client, b"ping").unwrap(), 4);
        let ready = selector
            .wait([Readiness::default(), Readiness::new(true, false)], timeout)
            .unwrap();
        assert!(ready[1].readable);

        let mut buf = [0u8; 8];
        assert_eq!(irecv(&server, &mut buf).unwrap(), Progress::Moved(4));
        assert_eq!(&buf[..4], b"ping");
        assert_eq!(irecv(&server, &mut buf).unwrap(), Progress::Idle);
    }

    #[test]
    fn irecv_reports_orderly_close() {
        let (client, server) = pair();
        client.shutdown(Shutdown::Write).unwrap();
        let mut selector = Selector::new(&server, None).unwrap();
        let ready = selector
            .wait([Readiness::new(true, false), Readiness::default()], Duration::from_secs(5))
            .unwrap();
        assert!(ready[0].readable);
        let mut buf = [0u8; 4];
        assert_eq!(irecv(&server, &mut buf).unwrap(), Progress::Closed);
    }

    #[test]
    fn serve_times_out_without_peer() {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let socket = Socket::new(7, 0);
        match socket.serve(port, Some(Duration::from_millis(100))) {
            Err(Error::Accept { stream, source, .. }) => {
                assert_eq!(stream, 7);
                assert_eq!(source.kind(), io::ErrorKind::TimedOut);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!socket.is_connected());
    }

    #[test]
    fn connect_and_serve_pair_up() {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let server = Arc::new(Socket::new(0, 256 * 1024));
        let serving = {
            let server = server.clone();
            std::thread::spawn(move || server.serve(port, Some(Duration::from_secs(10))))
        };
        let client = Socket::new(1, 256 * 1024);
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        let mut connected = false;
        for _ in 0..100 {
            if client.connect(addr, None, Duration::from_secs(1)).is_ok() {
                connected = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(connected);
        serving.join().unwrap().unwrap();

        let timeout = Duration::from_secs(5);
        client.send(b"Test 1!\0", timeout, 10).unwrap();
        let mut token = [0u8; 8];
        server.recv(&mut token, timeout, 10).unwrap();
        assert_eq!(&token, b"Test 1!\0");
        assert!(client.window().is_some());

        client.close();
        assert!(!client.is_connected());
        assert!(matches!(client.send(b"x", timeout, 1), Err(Error::NotConnected(1))));
    }
}
