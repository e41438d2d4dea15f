use std::time::Duration;

use lifeline_pipe::DEFAULT_REPLAY_WINDOW_BYTES;

const DEFAULT_MAX_STREAMS: usize = 32;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RECONNECT_RESPONSE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_DIAL_TIMEOUT_MS: u64 = 10_000;

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Tunables for the stream manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Upper bound on live streams.
    pub max_streams: usize,
    /// How long an inbound handshake waits for its stream to ask for it.
    pub handshake_timeout: Duration,
    /// How long a stream's pipe waits for a handshake to answer its request.
    pub reconnect_response_timeout: Duration,
    /// Bytes of written data each pipe keeps for replay.
    pub replay_window_bytes: usize,
    pub dial_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_streams: DEFAULT_MAX_STREAMS,
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            reconnect_response_timeout: Duration::from_millis(
                DEFAULT_RECONNECT_RESPONSE_TIMEOUT_MS,
            ),
            replay_window_bytes: DEFAULT_REPLAY_WINDOW_BYTES,
            dial_timeout: Duration::from_millis(DEFAULT_DIAL_TIMEOUT_MS),
        }
    }
}

impl Config {
    /// Reads `LIFELINE_*` overrides. Unparseable values fall back to the
    /// default; out-of-range values are clamped.
    pub fn from_env() -> Self {
        let max_streams = env_usize("LIFELINE_MAX_STREAMS")
            .map(|v| v.clamp(1, 1024))
            .unwrap_or(DEFAULT_MAX_STREAMS);
        let handshake_timeout = env_u64("LIFELINE_HANDSHAKE_TIMEOUT_MS")
            .map(|v| v.clamp(100, 10 * 60 * 1000))
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS);
        let reconnect_response_timeout = env_u64("LIFELINE_RECONNECT_RESPONSE_TIMEOUT_MS")
            .map(|v| v.clamp(100, 10 * 60 * 1000))
            .unwrap_or(DEFAULT_RECONNECT_RESPONSE_TIMEOUT_MS);
        let replay_window_bytes = env_usize("LIFELINE_REPLAY_WINDOW_BYTES")
            .map(|v| v.clamp(64 * 1024, 256 * 1024 * 1024))
            .unwrap_or(DEFAULT_REPLAY_WINDOW_BYTES);
        let dial_timeout = env_u64("LIFELINE_DIAL_TIMEOUT_MS")
            .map(|v| v.clamp(100, 120_000))
            .unwrap_or(DEFAULT_DIAL_TIMEOUT_MS);

        Self {
            max_streams,
            handshake_timeout: Duration::from_millis(handshake_timeout),
            reconnect_response_timeout: Duration::from_millis(reconnect_response_timeout),
            replay_window_bytes,
            dial_timeout: Duration::from_millis(dial_timeout),
        }
    }
}
