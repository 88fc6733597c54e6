//! Centralized configuration for the msgpack-rpc transport.

use std::time::Duration;

/// Transport-level configuration.
pub struct RpcConfig;

impl RpcConfig {
    /// Largest sequence id before wrapping back to 0.
    pub const MAX_SEQID: u32 = u32::MAX;

    /// Upper bound on a single buffered inbound frame (64 MB).
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

    /// Bytes reserved per socket read.
    pub const READ_BUFFER_SIZE: usize = 8192;

    /// Capacity of the broadcast channel behind `RpcStream::subscribe`.
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;

    /// How long a dropped connection keeps flushing queued frames before
    /// the writer is abandoned.
    pub const WRITE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

    /// Timeout for dialing a TCP address or Unix socket.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Error payload sent back for inbound requests nobody handles.
    pub const UNKNOWN_METHOD_ERROR: &'static str = "unknown method";

    /// Environment variable holding the editor's listen address.
    pub const LISTEN_ADDRESS_ENV: &'static str = "NVIM_LISTEN_ADDRESS";
}
