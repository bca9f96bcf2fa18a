//! # mpath-tcp - Multi-Stream TCP Paths
//!
//! mpath-tcp is a Rust library that carries messages between two processes
//! over many parallel TCP streams at once. On long, fat network links a
//! single TCP connection rarely fills the available bandwidth; spreading
//! every message over a group of streams (a *path*) lets the aggregate
//! throughput grow with the number of streams.
//!
//! ## Key Features
//!
//! - **Paths**: Groups of streams to one remote endpoint, created, connected
//!   and destroyed as a unit
//! - **Role Negotiation**: Each stream first tries to connect out and falls
//!   back to listening, so both ends can run the same code
//! - **Fixed and Dynamic Exchanges**: Exchange buffers whose sizes both
//!   sides know, or let the sender announce the size in-band
//! - **Cycles and Relays**: Receive on one set of streams while sending on
//!   another, or forward traffic between two sets without consuming it
//! - **Non-blocking Exchanges**: Start an exchange, poll it and wait for it
//!   later
//! - **Auto-tuning**: Pacing rate and TCP windows derived from path widths
//!
//! ## How It Works
//!
//! A [`ChannelManager`] owns a table of streams, addressed by index, and a
//! table of paths grouping them. Every exchange splits its payload over the
//! streams it is given with the remainder rule (see [`split_buf`]): with
//! `n` streams each gets `total / n` bytes and the first `total % n` get one
//! more. One worker per stream then drives its socket with non-blocking
//! sends and receives until its share is through, and the call returns once
//! every worker is done.
//!
//! Dynamic exchanges put an 8-byte big-endian total in front of the data on
//! every stream, so the receiver can split its buffer the same way.
//!
//! ## Basic Usage
//!
//! ### Server Side
//!
//! ```rust,no_run
//! use mpath_tcp::ChannelManager;
//!
//! let manager = ChannelManager::default();
//! // Host "0" listens on ports 16256..16260.
//! let path = manager.create_path("0", 16256, 4)?;
//!
//! let mut request = vec![0u8; 1 << 20];
//! let size = manager.dsend_recv_path(path, &[], &mut request)?;
//! manager.dsend_recv_path(path, &request[..size], &mut [])?;
//! manager.destroy_path(path)?;
//! # Ok::<(), mpath_tcp::Error>(())
//! ```
//!
//! ### Client Side
//!
//! ```rust,no_run
//! use mpath_tcp::ChannelManager;
//!
//! let manager = ChannelManager::default();
//! let path = manager.create_path("server.example.org", 16256, 4)?;
//!
//! let mut echo = vec![0u8; 1 << 20];
//! manager.dsend_recv_path(path, b"hello over four streams", &mut [])?;
//! let size = manager.dsend_recv_path(path, &[], &mut echo)?;
//! println!("echoed {size} bytes");
//! # Ok::<(), mpath_tcp::Error>(())
//! ```
//!
//! ## Configuration
//!
//! Chunk sizes, pacing, windows, timeouts and table sizes live in
//! [`Config`]. A manager copies its configuration at the start of every
//! call, so changes only affect later calls.
//!
//! ## Logging
//!
//! The library logs through the [`log`] facade: connection events at
//! `info`/`debug`, per-chunk progress at `trace`. Worker threads are named
//! after what they serve (`mpw-conn-3`, `mpw-xchg-3`, `mpw-relay-0-4`,
//! `mpw-nbe-7`), which shows up in subscribers that print thread names.
//!
//! ## Performance Considerations
//!
//! - Pacing inserts a sleep after every chunk; disable it with
//!   [`ChannelManager::set_pacing_rate`]`(None)` on fast local links
//! - Very small messages pay the per-stream overhead on every stream; set
//!   [`Config::min_bytes_per_stream`] to use fewer streams for them

#![warn(missing_docs)]

mod config;
mod connect;
mod dns;
mod error;
mod exchange;
mod manager;
mod nonblocking;
mod path;
mod relay;
mod socket;
mod split;
mod stream;
mod wire;

pub use config::{
    AUTOTUNE_PACING_BUDGET, AUTOTUNE_WINDOW_BUDGET, Config, DEFAULT_CHUNK_SIZE, DEFAULT_PACING_RATE,
    DEFAULT_WINDOW_SIZE, Pacing, autotuned_pacing, autotuned_window,
};
pub use dns::{is_server_only, resolve};
pub use error::{Error, Result};
pub use exchange::Route;
pub use manager::ChannelManager;
pub use nonblocking::{ExchangeId, ExchangeOutput};
pub use path::{Path, PathId};
pub use socket::{Readiness, Socket};
pub use split::{share, share_offset, split_buf};
pub use stream::{ClientBind, Role, StreamInfo, StreamSpec, StreamState};
pub use wire::{SIZE_PREFIX_LEN, decode_size, encode_size};
