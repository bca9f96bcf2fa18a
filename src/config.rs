//! Process-independent tuning knobs for a [`ChannelManager`](crate::ChannelManager).
//!
//! A manager owns one [`Config`]. Exchanges copy it when they start, so a
//! change made while a transfer is running only affects calls issued
//! afterwards.

use std::time::Duration;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Default bulk transfer chunk, for both directions.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * KIB;

/// Per-stream pacing rate used until auto-tuning or the caller picks one.
pub const DEFAULT_PACING_RATE: f64 = (100 * MIB) as f64;

/// Aggregate pacing budget divided among the streams of the widest path.
pub const AUTOTUNE_PACING_BUDGET: f64 = (1200 * MIB) as f64;

/// Aggregate TCP window divided among the streams of a connected path.
pub const AUTOTUNE_WINDOW_BUDGET: usize = 32 * MIB;

/// Socket buffer size applied to every newly created socket.
pub const DEFAULT_WINDOW_SIZE: usize = MIB;

/// Inter-chunk pacing applied by exchange and relay loops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pacing {
    /// No delay between chunks.
    Disabled,
    /// Target throughput per stream, in bytes per second.
    Rate(f64),
}

impl Pacing {
    /// Per-stream rate, or `None` when pacing is off.
    pub fn rate(&self) -> Option<f64> {
        match self {
            Pacing::Disabled => None,
            Pacing::Rate(rate) => Some(*rate),
        }
    }

    /// Delay inserted after every loop iteration that moves at most `chunk`
    /// bytes.
    pub fn delay(&self, chunk: usize) -> Option<Duration> {
        match self {
            Pacing::Rate(rate) if *rate > 0.0 && rate.is_finite() => {
                Some(Duration::from_secs_f64(chunk as f64 / rate))
            }
            _ => None,
        }
    }
}

impl From<Option<f64>> for Pacing {
    fn from(rate: Option<f64>) -> Self {
        match rate {
            Some(rate) if rate > 0.0 => Pacing::Rate(rate),
            _ => Pacing::Disabled,
        }
    }
}

/// Pacing rate chosen by auto-tuning for the widest path of a manager.
pub fn autotuned_pacing(max_path_streams: usize) -> Pacing {
    if max_path_streams < 3 {
        Pacing::Rate(AUTOTUNE_PACING_BUDGET)
    } else {
        Pacing::Rate(AUTOTUNE_PACING_BUDGET / max_path_streams as f64)
    }
}

/// Per-stream window chosen by auto-tuning for a path of `streams` streams.
pub fn autotuned_window(streams: usize) -> usize {
    AUTOTUNE_WINDOW_BUDGET / streams.max(1)
}

/// Settings shared by all streams and paths of a manager.
#[derive(Debug, Clone)]
pub struct Config {
    /// Largest slice handed to a single non-blocking send.
    pub send_chunk: usize,
    /// Largest slice handed to a single non-blocking receive.
    pub recv_chunk: usize,
    /// Send chunk used by relay loops.
    pub relay_send_chunk: usize,
    /// Receive chunk used by relay loops.
    pub relay_recv_chunk: usize,
    /// Delay policy between chunks.
    pub pacing: Pacing,
    /// Derive pacing and window sizes from path widths.
    pub auto_tuning: bool,
    /// Send and receive buffer size given to new sockets; 0 keeps the OS
    /// default.
    pub default_window: usize,
    /// Upper bound of a single readiness check.
    pub select_timeout: Duration,
    /// Upper bound of a single outbound connect attempt.
    pub connect_timeout: Duration,
    /// Extra connect attempts made when a batch runs without server fallback.
    pub connect_retries: u32,
    /// Pause between those attempts.
    pub connect_backoff: Duration,
    /// How long a listening stream waits for its peer; `None` waits forever.
    pub accept_timeout: Option<Duration>,
    /// Idle readiness checks tolerated by blocking send/recv before giving up.
    pub blocking_retries: u32,
    /// When set, fixed-size exchanges use fewer streams for small payloads
    /// so that each stream carries at least this many bytes.
    pub min_bytes_per_stream: Option<usize>,
    /// Ceiling of the stream index space.
    pub max_streams: usize,
    /// Ceiling of the path id space.
    pub max_paths: usize,
    /// Park the receiving worker forever when a dynamic exchange announces
    /// an oversized message, so the process can be inspected. Off by
    /// default: the exchange fails with [`Error::SizeExceeded`](crate::Error::SizeExceeded).
    pub hang_on_oversize: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            send_chunk: DEFAULT_CHUNK_SIZE,
            recv_chunk: DEFAULT_CHUNK_SIZE,
            relay_send_chunk: DEFAULT_CHUNK_SIZE,
            relay_recv_chunk: DEFAULT_CHUNK_SIZE,
            pacing: Pacing::Rate(DEFAULT_PACING_RATE),
            auto_tuning: true,
            default_window: DEFAULT_WINDOW_SIZE,
            select_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            connect_retries: 1200,
            connect_backoff: Duration::from_millis(50),
            accept_timeout: None,
            blocking_retries: 100,
            min_bytes_per_stream: None,
            max_streams: 1024,
            max_paths: 256,
            hang_on_oversize: false,
        }
    }
}

impl Config {
    /// Number of streams a fixed-size exchange of `largest` bytes should use
    /// out of `available`.
    pub fn effective_streams(&self, available: usize, largest: usize) -> usize {
        match self.min_bytes_per_stream {
            Some(per_stream) if per_stream > 0 => available.min(largest / per_stream).max(1),
            _ => available,
        }
    }

    /// Delay applied by exchange loops after each iteration.
    pub(crate) fn exchange_delay(&self) -> Option<Duration> {
        self.pacing.delay(self.send_chunk)
    }

    /// Delay applied by relay loops after each iteration.
    pub(crate) fn relay_delay(&self) -> Option<Duration> {
        self.pacing.delay(self.relay_send_chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autotuned_pacing_is_flat_below_three_streams() {
        assert_eq!(autotuned_pacing(1), Pacing::Rate(AUTOTUNE_PACING_BUDGET));
        assert_eq!(autotuned_pacing(2), Pacing::Rate(AUTOTUNE_PACING_BUDGET));
        assert_eq!(autotuned_pacing(4), Pacing::Rate(AUTOTUNE_PACING_BUDGET / 4.0));
    }

    #[test]
    fn autotuned_window_divides_budget() {
        assert_eq!(autotuned_window(1), 32 * MIB);
        assert_eq!(autotuned_window(3), (32 * MIB) / 3);
        assert_eq!(autotuned_window(0), 32 * MIB);
    }

    #[test]
    fn pacing_delay_matches_chunk_over_rate() {
        let pacing = Pacing::Rate((32 * KIB) as f64);
        assert_eq!(pacing.delay(8 * KIB), Some(Duration::from_millis(250)));
        assert_eq!(Pacing::Disabled.delay(8 * KIB), None);
        assert_eq!(Pacing::from(Some(-1.0)), Pacing::Disabled);
        assert_eq!(Pacing::from(Some(10.0 * MIB as f64)).rate(), Some(10.0 * MIB as f64));
    }

    #[test]
    fn adaptive_stream_count() {
        let mut config = Config::default();
        assert_eq!(config.effective_streams(8, 10), 8);
        config.min_bytes_per_stream = Some(1024);
        assert_eq!(config.effective_streams(8, 10), 1);
        assert_eq!(config.effective_streams(8, 4096), 4);
        assert_eq!(config.effective_streams(8, 1 << 20), 8);
    }
}
