use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::manager::ChannelManager;
use crate::path::PathId;
use crate::{Error, Result};

/// Handle of a non-blocking exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId(pub u64);

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Buffers handed back by [`ChannelManager::wait`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeOutput {
    /// The buffer that was sent.
    pub sent: Vec<u8>,
    /// The bytes received.
    pub received: Vec<u8>,
}

pub(crate) struct Pending {
    handle: JoinHandle<Result<ExchangeOutput>>,
    finished: Arc<AtomicBool>,
}

impl ChannelManager {
    /// Starts a [`send_recv_path`](Self::send_recv_path) in the background
    /// and returns at once. The exchange owns `send` and a receive buffer of
    /// `recv_len` bytes until [`wait`](Self::wait) hands them back.
    pub fn isend_recv(&self, path: PathId, send: Vec<u8>, recv_len: usize) -> Result<ExchangeId> {
        self.path_streams(path)?;
        let id = ExchangeId(self.shared.next_exchange.fetch_add(1, Ordering::Relaxed));
        let finished = Arc::new(AtomicBool::new(false));

        let manager = self.clone();
        let done = finished.clone();
        let handle = thread::Builder::new()
            .name(format!("mpw-nbe-{}", id.0))
            .spawn(move || {
                let mut received = vec![0u8; recv_len];
                let result = manager.send_recv_path(path, &send, &mut received);
                done.store(true, Ordering::Release);
                result.map(|()| ExchangeOutput { sent: send, received })
            })
            .map_err(Error::Spawn)?;

        log::debug!("Started non-blocking exchange {id} on path {path}");
        self.shared.exchanges.lock().insert(id, Pending { handle, finished });
        Ok(id)
    }

    /// Whether the exchange has completed. May report `false` for a short
    /// while after the exchange actually ended.
    pub fn has_finished(&self, id: ExchangeId) -> Result<bool> {
        self.shared
            .exchanges
            .lock()
            .get(&id)
            .map(|pending| pending.finished.load(Ordering::Acquire))
            .ok_or(Error::UnknownExchange(id))
    }

    /// Blocks until the exchange completes, forgets it and returns its
    /// buffers.
    pub fn wait(&self, id: ExchangeId) -> Result<ExchangeOutput> {
        let pending = self.shared.exchanges.lock().remove(&id);
        let Some(pending) = pending else {
            log::warn!("Wait called for unknown non-blocking exchange {id}");
            return Err(Error::UnknownExchange(id));
        };
        pending
            .handle
            .join()
            .unwrap_or_else(|_| Err(Error::WorkerPanicked(format!("mpw-nbe-{}", id.0))))
    }

    /// Ids of the exchanges not yet waited for.
    pub fn pending_exchanges(&self) -> Vec<ExchangeId> {
        let mut ids: Vec<ExchangeId> = self.shared.exchanges.lock().keys().copied().collect();
        ids.sort();
        ids
    }
}
