use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use parking_lot::{Mutex, RwLock};

use crate::config::{self, Config, Pacing};
use crate::nonblocking::{ExchangeId, Pending};
use crate::path::{Path, PathId, PathTable};
use crate::stream::{ClientBind, StreamInfo, StreamSpec, StreamState, StreamTable};
use crate::{Error, Result};

pub(crate) struct Shared {
    pub(crate) config: RwLock<Config>,
    pub(crate) streams: RwLock<StreamTable>,
    pub(crate) paths: RwLock<PathTable>,
    /// Held shared by anything that uses streams, exclusively by anything
    /// that adds or removes them.
    pub(crate) lifecycle: RwLock<()>,
    /// Serializes accepting peers against path destruction.
    pub(crate) accept: Mutex<()>,
    pub(crate) exchanges: Mutex<HashMap<ExchangeId, Pending>>,
    pub(crate) next_exchange: AtomicU64,
}

/// Owner of a set of streams and the paths grouping them.
///
/// `ChannelManager` is a cheap handle: clones share the same registries, so
/// a clone can be moved into another thread to run exchanges on streams the
/// first handle created. Independent managers do not share anything, which lets
/// both ends of a connection live in one process.
///
/// Exchanges on already-connected streams run concurrently. Creating,
/// destroying, closing or reopening streams waits for running exchanges to
/// finish, and destroying a path also waits for any peer accept in progress.
#[derive(Clone)]
pub struct ChannelManager {
    pub(crate) shared: Arc<Shared>,
}

impl Default for ChannelManager {
    fn default() -> Self {
        ChannelManager::new(Config::default())
    }
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("streams", &self.num_channels())
            .field("paths", &self.shared.paths.read().ids())
            .finish()
    }
}

impl ChannelManager {
    /// Creates a manager with no streams.
    pub fn new(config: Config) -> Self {
        let shared = Shared {
            streams: RwLock::new(StreamTable::new(config.max_streams)),
            paths: RwLock::new(PathTable::new(config.max_paths)),
            config: RwLock::new(config),
            lifecycle: RwLock::new(()),
            accept: Mutex::new(()),
            exchanges: Mutex::new(HashMap::new()),
            next_exchange: AtomicU64::new(0),
        };
        ChannelManager { shared: Arc::new(shared) }
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> Config {
        self.shared.config.read().clone()
    }

    /// Replaces the configuration. Running exchanges keep the settings they
    /// started with.
    pub fn set_config(&self, config: Config) {
        self.shared.streams.write().set_max(config.max_streams);
        self.shared.paths.write().set_max(config.max_paths);
        *self.shared.config.write() = config;
    }

    /// Sets the bulk transfer chunk sizes.
    pub fn set_chunk_size(&self, send: usize, recv: usize) {
        let mut config = self.shared.config.write();
        config.send_chunk = send.max(1);
        config.recv_chunk = recv.max(1);
        log::debug!("Chunk size modified to: {send}/{recv}");
    }

    /// Sets the per-stream pacing rate in bytes per second; `None` disables
    /// pacing.
    pub fn set_pacing_rate(&self, rate: Option<f64>) {
        let pacing = Pacing::from(rate);
        let mut config = self.shared.config.write();
        config.pacing = pacing;
        if let Some(delay) = config.exchange_delay() {
            log::info!("Pacing enabled, rate = {:?} => delay = {delay:?}", pacing.rate());
        }
    }

    /// Current pacing rate, `None` when pacing is off.
    pub fn pacing_rate(&self) -> Option<f64> {
        self.shared.config.read().pacing.rate()
    }

    /// Enables or disables automatic pacing and window selection.
    pub fn set_auto_tuning(&self, enabled: bool) {
        self.shared.config.write().auto_tuning = enabled;
    }

    /// Whether auto-tuning is enabled.
    pub fn auto_tuning(&self) -> bool {
        self.shared.config.read().auto_tuning
    }

    /// High-water mark of the stream index space.
    pub fn num_channels(&self) -> usize {
        self.shared.streams.read().high_water()
    }

    /// Snapshot of every live stream.
    pub fn streams(&self) -> Vec<StreamInfo> {
        self.shared.streams.read().infos()
    }

    /// Logs every live stream.
    pub fn print(&self) {
        for info in self.streams() {
            log::info!("{info}");
        }
    }

    /// Reserves `n` contiguous stream indices.
    pub fn reserve_stream_range(&self, n: usize) -> Result<Range<usize>> {
        let _exclusive = self.shared.lifecycle.write();
        let window = self.shared.config.read().default_window;
        self.shared.streams.write().reserve(n, window)
    }

    /// Registers streams at `indices`, resolving each host once.
    pub fn add_streams(&self, specs: &[StreamSpec], indices: &[usize]) -> Result<()> {
        let _exclusive = self.shared.lifecycle.write();
        let window = self.shared.config.read().default_window;
        self.shared.streams.write().add(specs, indices, window)
    }

    /// Releases one stream, closing its socket.
    pub fn erase_stream(&self, index: usize) -> Result<()> {
        let _accept = self.shared.accept.lock();
        let _exclusive = self.shared.lifecycle.write();
        self.shared.streams.write().erase(index)
    }

    /// Registers and connects a set of streams in one go, listening where a
    /// connection cannot be made. Returns the indices used.
    pub fn init(&self, specs: &[StreamSpec]) -> Result<Range<usize>> {
        log::info!("Initialising {} streams", specs.len());
        let range = {
            let _exclusive = self.shared.lifecycle.write();
            let window = self.shared.config.read().default_window;
            let mut streams = self.shared.streams.write();
            let range = streams.reserve(specs.len(), window)?;
            let indices: Vec<usize> = range.clone().collect();
            streams.add(specs, &indices, window)?;
            range
        };
        let indices: Vec<usize> = range.clone().collect();
        self.init_streams(&indices, true)?;
        self.log_settings();
        Ok(range)
    }

    /// Shuts down the sockets of `indices` without releasing the indices.
    pub fn close_channels(&self, indices: &[usize]) -> Result<()> {
        let _exclusive = self.shared.lifecycle.write();
        let mut streams = self.shared.streams.write();
        for &index in indices {
            let stream = streams.get_mut(index)?;
            log::info!(
                "Closing channel #{index} with port = {} and client bind = {:?}",
                stream.port,
                stream.client_bind
            );
            stream.socket.close();
            stream.state = StreamState::Closed;
        }
        Ok(())
    }

    /// Re-establishes the sockets of `indices` after [`close_channels`](Self::close_channels).
    pub fn reopen_channels(&self, indices: &[usize], server_wait: bool) -> Result<()> {
        self.init_streams(indices, server_wait)
    }

    /// Reserves streams for a path to `host` on ports `base_port..base_port+n`
    /// without connecting them.
    pub fn create_path_without_connect(
        &self,
        host: &str,
        base_port: u16,
        n: usize,
    ) -> Result<PathId> {
        if n == 0 {
            return Err(Error::InvalidArgument("a path needs at least one stream".into()));
        }
        if usize::from(base_port) + n - 1 > usize::from(u16::MAX) {
            return Err(Error::InvalidArgument(format!(
                "ports {base_port}+{n} exceed the port range"
            )));
        }
        let _exclusive = self.shared.lifecycle.write();
        let mut config = self.shared.config.write();
        let mut streams = self.shared.streams.write();
        let mut paths = self.shared.paths.write();
        if !paths.has_room() {
            log::error!("Trying to create more than {} paths", config.max_paths);
            return Err(Error::PathSpaceExhausted { max: config.max_paths });
        }

        let range = streams.reserve(n, config.default_window)?;
        let indices: Vec<usize> = range.collect();
        let specs: Vec<StreamSpec> = (0..n)
            .map(|i| StreamSpec {
                host: host.to_string(),
                port: base_port + i as u16,
                client_bind: ClientBind::Unset,
            })
            .collect();
        if let Err(e) = streams.add(&specs, &indices, config.default_window) {
            for &index in &indices {
                let _ = streams.erase(index);
            }
            return Err(e);
        }
        let id = paths.insert(Path { remote: host.to_string(), streams: indices.clone() })?;

        if config.auto_tuning {
            config.pacing = config::autotuned_pacing(paths.widest());
        }
        log::info!("Creating new path {id}: {host} {base_port} {n} streams");
        for (i, index) in indices.iter().enumerate() {
            log::debug!("Stream[{i}]: {index}");
        }
        Ok(id)
    }

    /// Connects the streams of a path. On failure the path is left in place
    /// with some streams possibly connected; destroy it to release them.
    pub fn connect_path(&self, id: PathId, server_wait: bool) -> Result<()> {
        let indices = self.path_streams(id)?;
        self.init_streams(&indices, server_wait)?;

        let config = self.config();
        if config.auto_tuning {
            let window = config::autotuned_window(indices.len());
            let streams = self.shared.streams.read();
            for &index in &indices {
                streams.get(index)?.socket.set_window(window);
            }
        }
        self.log_settings();
        Ok(())
    }

    /// Creates and connects a path, destroying it again if any stream fails.
    pub fn create_path(&self, host: &str, base_port: u16, n: usize) -> Result<PathId> {
        let id = self.create_path_without_connect(host, base_port, n)?;
        if let Err(e) = self.connect_path(id, true) {
            log::warn!("Path {id} failed to connect, destroying it: {e}");
            if let Err(cleanup) = self.destroy_path(id) {
                log::error!("Path {id} could not be fully destroyed: {cleanup}");
            }
            return Err(e);
        }
        Ok(id)
    }

    /// Closes and releases every stream of a path, then forgets the path.
    pub fn destroy_path(&self, id: PathId) -> Result<()> {
        let _accept = self.shared.accept.lock();
        let _exclusive = self.shared.lifecycle.write();
        let path = self.shared.paths.write().remove(id)?;
        let mut streams = self.shared.streams.write();
        let mut first_error = None;
        for index in path.streams {
            if let Err(e) = streams.erase(index) {
                log::warn!("Path {id}: releasing stream #{index} failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        log::info!("Destroyed path {id}");
        first_error.map_or(Ok(()), Err)
    }

    /// Stream indices of a path, in worker order.
    pub fn path_streams(&self, id: PathId) -> Result<Vec<usize>> {
        Ok(self.shared.paths.read().get(id)?.streams.clone())
    }

    /// Record of a live path.
    pub fn path(&self, id: PathId) -> Result<Path> {
        self.shared.paths.read().get(id).cloned()
    }

    /// Sets the TCP window of one stream.
    pub fn set_window(&self, index: usize, bytes: usize) -> Result<()> {
        self.shared.streams.read().get(index)?.socket.set_window(bytes);
        Ok(())
    }

    /// Sets the TCP window of every stream of a path.
    pub fn set_path_window(&self, id: PathId, bytes: usize) -> Result<()> {
        let indices = self.path_streams(id)?;
        let streams = self.shared.streams.read();
        for index in indices {
            streams.get(index)?.socket.set_window(bytes);
        }
        Ok(())
    }

    /// Current `(send, receive)` buffer sizes of a connected stream.
    pub fn window(&self, index: usize) -> Result<(usize, usize)> {
        self.shared.streams.read().get(index)?.socket.window().ok_or(Error::NotConnected(index))
    }

    /// Destroys every path and releases every stream.
    pub fn finalize(&self) {
        let _accept = self.shared.accept.lock();
        let _exclusive = self.shared.lifecycle.write();
        let mut paths = self.shared.paths.write();
        log::debug!("Finalizing {} path slots", paths.len());
        for id in paths.ids() {
            let _ = paths.remove(id);
        }
        self.shared.streams.write().clear();
        log::info!("Sockets are closed");
    }

    fn log_settings(&self) {
        let config = self.config();
        log::info!("-----------------------------------------------------------");
        log::info!("Chunk size   (send/recv): {}/{}", config.send_chunk, config.recv_chunk);
        log::info!(
            "Relay pace   (send/recv): {}/{}",
            config.relay_send_chunk,
            config.relay_recv_chunk
        );
        log::info!("Number of streams       : {}", self.num_channels());
        log::info!("TCP window              : {}", config.default_window);
        log::info!("Pacing rate             : {:?} bytes/s", config.pacing.rate());
        log::info!("-----------------------------------------------------------");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_ids_and_streams_are_recycled() {
        let manager = ChannelManager::default();
        let a = manager.create_path_without_connect("127.0.0.1", 16256, 4).unwrap();
        let b = manager.create_path_without_connect("127.0.0.1", 16300, 2).unwrap();
        assert_eq!(manager.path_streams(a).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(manager.path_streams(b).unwrap(), vec![4, 5]);

        manager.destroy_path(a).unwrap();
        assert_eq!(manager.num_channels(), 6);
        let c = manager.create_path_without_connect("127.0.0.1", 16256, 4).unwrap();
        assert_eq!(c, a);
        assert_eq!(manager.path_streams(c).unwrap(), vec![0, 1, 2, 3]);

        manager.destroy_path(b).unwrap();
        manager.destroy_path(c).unwrap();
        assert_eq!(manager.num_channels(), 0);
        assert!(matches!(manager.destroy_path(c), Err(Error::UnknownPath(_))));
    }

    #[test]
    fn destroy_releases_remaining_streams_after_a_failure() {
        let manager = ChannelManager::default();
        let id = manager.create_path_without_connect("127.0.0.1", 16256, 3).unwrap();
        manager.erase_stream(0).unwrap();
        assert_eq!(manager.num_channels(), 3);

        assert!(matches!(manager.destroy_path(id), Err(Error::UnknownStream(0))));
        assert_eq!(manager.num_channels(), 0);
        assert!(manager.streams().is_empty());
        assert!(matches!(manager.path(id), Err(Error::UnknownPath(_))));
    }

    #[test]
    fn path_ports_follow_base_port() {
        let manager = ChannelManager::default();
        let id = manager.create_path_without_connect("localhost", 16256, 3).unwrap();
        let ports: Vec<u16> = manager.streams().iter().map(|s| s.port).collect();
        assert_eq!(ports, vec![16256, 16257, 16258]);
        assert!(manager.streams().iter().all(|s| s.state == StreamState::Unconnected));
        assert_eq!(manager.path(id).unwrap().remote, "localhost");
        manager.set_window(0, 262144).unwrap();
        manager.set_path_window(id, 262144).unwrap();
        assert!(matches!(manager.window(0), Err(Error::NotConnected(0))));
    }

    #[test]
    fn auto_tuning_follows_widest_path() {
        let manager = ChannelManager::default();
        manager.create_path_without_connect("127.0.0.1", 16256, 2).unwrap();
        assert_eq!(manager.pacing_rate(), Some(config::AUTOTUNE_PACING_BUDGET));
        manager.create_path_without_connect("127.0.0.1", 16356, 8).unwrap();
        assert_eq!(manager.pacing_rate(), Some(config::AUTOTUNE_PACING_BUDGET / 8.0));

        manager.set_auto_tuning(false);
        assert!(!manager.auto_tuning());
        manager.set_pacing_rate(Some(10.0 * 1024.0 * 1024.0));
        manager.create_path_without_connect("127.0.0.1", 16456, 16).unwrap();
        assert_eq!(manager.pacing_rate(), Some(10.0 * 1024.0 * 1024.0));
        manager.set_pacing_rate(None);
        assert_eq!(manager.pacing_rate(), None);
    }

    #[test]
    fn exhaustion_is_reported_not_fatal() {
        let config = Config { max_streams: 4, max_paths: 1, ..Config::default() };
        let manager = ChannelManager::new(config);
        assert!(matches!(
            manager.create_path_without_connect("127.0.0.1", 16256, 5),
            Err(Error::StreamSpaceExhausted { .. })
        ));
        let id = manager.create_path_without_connect("127.0.0.1", 16256, 2).unwrap();
        assert!(matches!(
            manager.create_path_without_connect("127.0.0.1", 16260, 1),
            Err(Error::PathSpaceExhausted { max: 1 })
        ));
        assert_eq!(manager.num_channels(), 2);
        manager.destroy_path(id).unwrap();
    }

    #[test]
    fn chunk_size_and_finalize() {
        let manager = ChannelManager::default();
        manager.set_chunk_size(65536, 65536);
        assert_eq!(manager.config().send_chunk, 65536);
        manager.create_path_without_connect("127.0.0.1", 16256, 3).unwrap();
        manager.finalize();
        assert_eq!(manager.num_channels(), 0);
        assert!(manager.streams().is_empty());
    }
}
