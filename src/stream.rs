//! Registry of the TCP streams owned by a manager.
//!
//! Streams are addressed by a small index. Indices stay densely packed below
//! a high-water mark: releasing the highest live stream lowers the mark, and
//! new ranges first reuse the lowest gap that is large enough.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
use std::ops::Range;
use std::sync::Arc;

use crate::dns;
use crate::socket::Socket;
use crate::{Error, Result};

/// Role a stream plays in connection establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connects out to the remote endpoint (and may fall back to listening).
    Client,
    /// Listens for the remote endpoint.
    Server,
}

/// Local port policy of the outbound side of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientBind {
    /// Let the OS choose the local port.
    Unset,
    /// The stream never connects out.
    ServerOnly,
    /// Bind this local port before connecting, for firewalls that filter on
    /// source ports. Binding is best-effort.
    Port(u16),
}

impl ClientBind {
    /// Port to bind before connecting, if any.
    pub fn port(&self) -> Option<u16> {
        match self {
            ClientBind::Port(port) if *port > 0 => Some(*port),
            _ => None,
        }
    }
}

/// Connection state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Registered, never connected.
    Unconnected,
    /// Establishment in progress.
    Connecting,
    /// Carrying traffic.
    Connected,
    /// The last establishment attempt failed.
    Failed,
    /// Closed on request; may be reopened.
    Closed,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Unconnected => "unconnected",
            StreamState::Connecting => "connecting",
            StreamState::Connected => "connected",
            StreamState::Failed => "failed",
            StreamState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Where a new stream should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    /// Remote host name or address; `"0"` or `"0.0.0.0"` for server-only.
    pub host: String,
    /// Remote port when connecting, local port when listening.
    pub port: u16,
    /// Local port policy when connecting.
    pub client_bind: ClientBind,
}

impl StreamSpec {
    /// Spec without a client-side port binding.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        StreamSpec { host: host.into(), port, client_bind: ClientBind::Unset }
    }

    /// Same spec, binding `port` locally before connecting.
    pub fn with_client_port(mut self, port: u16) -> Self {
        self.client_bind = ClientBind::Port(port);
        self
    }
}

/// Snapshot of one stream, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Stream index.
    pub index: usize,
    /// Current role.
    pub role: Role,
    /// Configured port.
    pub port: u16,
    /// Outbound port policy.
    pub client_bind: ClientBind,
    /// Host as given at registration.
    pub host: String,
    /// Resolved remote address, if any.
    pub remote: Option<Ipv4Addr>,
    /// Connection state.
    pub state: StreamState,
}

impl fmt::Display for StreamInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream #{} {:?} port {} host {}", self.index, self.role, self.port, self.host)?;
        if let Some(remote) = self.remote {
            write!(f, " ({remote})")?;
        }
        write!(f, " [{}]", self.state)
    }
}

#[derive(Debug)]
pub(crate) struct Stream {
    pub(crate) socket: Arc<Socket>,
    pub(crate) role: Role,
    pub(crate) port: u16,
    pub(crate) client_bind: ClientBind,
    pub(crate) host: String,
    pub(crate) remote: Option<Ipv4Addr>,
    pub(crate) state: StreamState,
}

impl Stream {
    fn reserved(index: usize, window: usize) -> Self {
        Stream {
            socket: Arc::new(Socket::new(index, window)),
            role: Role::Server,
            port: 0,
            client_bind: ClientBind::ServerOnly,
            host: String::new(),
            remote: None,
            state: StreamState::Unconnected,
        }
    }

    fn register(index: usize, spec: &StreamSpec, window: usize) -> Self {
        let mut stream = Stream::reserved(index, window);
        stream.port = spec.port;
        stream.host = spec.host.clone();
        if dns::is_server_only(&spec.host) {
            log::info!("Stream #{index}: empty IP address given, switching to server-only mode");
            stream.client_bind = ClientBind::ServerOnly;
        } else {
            stream.role = Role::Client;
            stream.client_bind = spec.client_bind;
            stream.remote = dns::resolve(&spec.host).ok();
        }
        stream
    }

    /// Remote endpoint of an outbound connection.
    pub(crate) fn target(&self) -> Option<SocketAddrV4> {
        self.remote.map(|ip| SocketAddrV4::new(ip, self.port))
    }

    fn info(&self, index: usize) -> StreamInfo {
        StreamInfo {
            index,
            role: self.role,
            port: self.port,
            client_bind: self.client_bind,
            host: self.host.clone(),
            remote: self.remote,
            state: self.state,
        }
    }
}

#[derive(Debug)]
pub(crate) struct StreamTable {
    slots: Vec<Option<Stream>>,
    max: usize,
}

impl StreamTable {
    pub(crate) fn new(max: usize) -> Self {
        StreamTable { slots: Vec::new(), max }
    }

    pub(crate) fn set_max(&mut self, max: usize) {
        self.max = max;
    }

    /// Current high-water mark.
    pub(crate) fn high_water(&self) -> usize {
        self.slots.len()
    }

    /// Reserves `n` contiguous indices, preferring the first free gap.
    pub(crate) fn reserve(&mut self, n: usize, window: usize) -> Result<Range<usize>> {
        let mut streak = 0;
        let mut found = None;
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.is_some() {
                streak = 0;
                continue;
            }
            streak += 1;
            if streak == n {
                found = Some(i + 1 - n);
                break;
            }
        }
        let start = match found {
            Some(start) => start,
            None if self.slots.len() + n <= self.max => {
                let start = self.slots.len();
                self.slots.resize_with(start + n, || None);
                start
            }
            None => {
                log::error!("Trying to create more than {} streams", self.max);
                return Err(Error::StreamSpaceExhausted { requested: n, max: self.max });
            }
        };
        for index in start..start + n {
            self.slots[index] = Some(Stream::reserved(index, window));
        }
        Ok(start..start + n)
    }

    /// Registers one stream per spec at the given indices, replacing any
    /// reservation there.
    pub(crate) fn add(
        &mut self,
        specs: &[StreamSpec],
        indices: &[usize],
        window: usize,
    ) -> Result<()> {
        if specs.len() != indices.len() {
            return Err(Error::InvalidArgument(format!(
                "{} stream specs for {} indices",
                specs.len(),
                indices.len()
            )));
        }
        if let Some(&index) = indices.iter().find(|&&index| index >= self.max) {
            return Err(Error::StreamSpaceExhausted { requested: index + 1, max: self.max });
        }
        for (spec, &index) in specs.iter().zip(indices) {
            if index >= self.slots.len() {
                self.slots.resize_with(index + 1, || None);
            }
            if let Some(old) = self.slots[index].take() {
                old.socket.close();
            }
            log::info!("Stream number {index}: {}:{}", spec.host, spec.port);
            self.slots[index] = Some(Stream::register(index, spec, window));
        }
        Ok(())
    }

    /// Releases a stream and closes its socket.
    pub(crate) fn erase(&mut self, index: usize) -> Result<()> {
        let stream = self
            .slots
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(Error::UnknownStream(index))?;
        stream.socket.close();
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
        Ok(())
    }

    pub(crate) fn get(&self, index: usize) -> Result<&Stream> {
        self.slots.get(index).and_then(Option::as_ref).ok_or(Error::UnknownStream(index))
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Result<&mut Stream> {
        self.slots.get_mut(index).and_then(Option::as_mut).ok_or(Error::UnknownStream(index))
    }

    /// Connected TCP stream behind `index`.
    pub(crate) fn connection(&self, index: usize) -> Result<Arc<TcpStream>> {
        self.get(index)?.socket.connection().ok_or(Error::NotConnected(index))
    }

    pub(crate) fn live(&self) -> impl Iterator<Item = (usize, &Stream)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|stream| (index, stream)))
    }

    pub(crate) fn infos(&self) -> Vec<StreamInfo> {
        self.live().map(|(index, stream)| stream.info(index)).collect()
    }

    pub(crate) fn clear(&mut self) {
        for (_, stream) in self.live() {
            stream.socket.close();
        }
        self.slots.clear();
    }
}
