use std::io;
use std::net::SocketAddrV4;

use thiserror::Error;

use crate::nonblocking::ExchangeId;
use crate::path::PathId;

/// Errors reported by the channel manager and its exchange engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The stream index space cannot hold the requested range.
    #[error("cannot reserve {requested} streams: at most {max} streams are supported")]
    StreamSpaceExhausted {
        /// Number of streams asked for.
        requested: usize,
        /// Configured stream ceiling.
        max: usize,
    },

    /// The path id space is full.
    #[error("cannot create more than {max} paths")]
    PathSpaceExhausted {
        /// Configured path ceiling.
        max: usize,
    },

    /// A host name did not resolve to an IPv4 address.
    #[error("unable to resolve host name `{host}`")]
    Resolve {
        /// The name that was looked up.
        host: String,
    },

    /// Binding the local server port of a stream failed.
    #[error("stream #{stream}: bind on port {port} failed: {source}")]
    Bind {
        /// Stream index.
        stream: usize,
        /// Local port.
        port: u16,
        /// Underlying socket error.
        source: io::Error,
    },

    /// Listening on the local server port of a stream failed.
    #[error("stream #{stream}: listen on port {port} failed: {source}")]
    Listen {
        /// Stream index.
        stream: usize,
        /// Local port.
        port: u16,
        /// Underlying socket error.
        source: io::Error,
    },

    /// No peer connected to a listening stream.
    #[error("stream #{stream}: accept on port {port} failed: {source}")]
    Accept {
        /// Stream index.
        stream: usize,
        /// Local port.
        port: u16,
        /// Underlying socket error.
        source: io::Error,
    },

    /// An outbound connection attempt failed.
    #[error("stream #{stream}: connect to {addr} failed: {source}")]
    Connect {
        /// Stream index.
        stream: usize,
        /// Remote address.
        addr: SocketAddrV4,
        /// Underlying socket error.
        source: io::Error,
    },

    /// Some streams of a batch did not connect. The streams that did
    /// connect are left open and must be closed by the caller.
    #[error("{} of {total} streams failed to connect: {failed:?}", failed.len())]
    EstablishFailed {
        /// Indices of the streams that failed.
        failed: Vec<usize>,
        /// Size of the batch.
        total: usize,
    },

    /// A socket operation failed in the middle of a transfer.
    #[error("channel #{channel}: {source}")]
    Io {
        /// Stream index.
        channel: usize,
        /// Underlying socket error.
        source: io::Error,
    },

    /// The peer closed a stream before the expected byte count arrived.
    #[error("channel #{channel}: remote closed after {transferred} of {expected} bytes")]
    RemoteClosed {
        /// Stream index.
        channel: usize,
        /// Bytes received before the close.
        transferred: usize,
        /// Bytes this worker had to receive.
        expected: usize,
    },

    /// A dynamic exchange announced more data than the receive bound.
    #[error("announced message size {declared} exceeds receive bound {max}")]
    SizeExceeded {
        /// Size found in the length prefix.
        declared: u64,
        /// Capacity supplied by the caller.
        max: usize,
    },

    /// Two workers of one dynamic exchange decoded different totals.
    #[error("channel #{channel}: announced size {found} disagrees with {expected}")]
    SizeMismatch {
        /// Stream index.
        channel: usize,
        /// Total decoded on this channel.
        found: u64,
        /// Total decoded first.
        expected: u64,
    },

    /// The non-blocking exchange id is not (or no longer) registered.
    #[error("unknown non-blocking exchange {0}")]
    UnknownExchange(ExchangeId),

    /// The path id does not name a live path.
    #[error("unknown path {0}")]
    UnknownPath(PathId),

    /// The stream index does not name a live stream.
    #[error("unknown stream #{0}")]
    UnknownStream(usize),

    /// The stream exists but has no connected socket.
    #[error("stream #{0} is not connected")]
    NotConnected(usize),

    /// A call was made with arguments that cannot be honoured.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Encoding or decoding the length prefix failed.
    #[error("length prefix codec: {0}")]
    Codec(String),

    /// A worker thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    /// A worker thread panicked.
    #[error("worker thread `{0}` panicked")]
    WorkerPanicked(String),

    /// The worker stopped because a sibling of the same call failed.
    #[error("channel #{0}: aborted after a sibling worker failed")]
    Aborted(usize),
}

impl Error {
    pub(crate) fn io(channel: usize, source: io::Error) -> Self {
        Error::Io { channel, source }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Picks the error to surface from a joined set of workers: the first one
/// in worker order that is not a mere consequence of another failure.
pub(crate) fn first_failure<I>(results: I) -> Result<()>
where
    I: IntoIterator<Item = Result<()>>,
{
    let mut aborted = None;
    for result in results {
        match result {
            Ok(()) => {}
            Err(Error::Aborted(channel)) => {
                aborted.get_or_insert(Error::Aborted(channel));
            }
            Err(e) => return Err(e),
        }
    }
    match aborted {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
