//! Shared protocol constants for the cloudsync framed transport

// Frame header: unsigned big-endian payload length
pub const FRAME_HEADER_LEN: usize = 8;

// Maximum frame payload size (200MB) - prevents memory exhaustion from a bad header
// while leaving room for a full file chunk plus its envelope
pub const MAX_FRAME_SIZE: usize = 200 * 1024 * 1024;

// Default chunk size for FileWriting payloads (5MB)
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

// Room reserved inside a frame for the envelope around a chunk payload
pub const ENVELOPE_HEADROOM: usize = 64 * 1024;

// Default server port
pub const DEFAULT_PORT: u16 = 11111;

// Rejection reason for a second login with the same username
pub const ALREADY_LOGGED_IN: &str = "Already logged in";

// Name of the per-server recycle directory that holds soft-deleted files
pub const RECYCLE_DIR: &str = "$recycled";

// Centralized timing constants
pub mod timeouts {
    // Watcher debounce window (ms)
    pub const DEBOUNCE_MS: u64 = 100;

    // Delay between connection attempts (s)
    pub const RECONNECT_DELAY_SECS: u64 = 2;

    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 3_000;

    // Time the client waits for an auth reply (ms)
    pub const AUTH_REPLY_MS: u64 = 30_000;

    // Longest a frame read or write may go without moving a byte (ms).
    // Slow links are fine as long as data keeps flowing.
    pub const IO_IDLE_MS: u64 = 30_000;

    // TCP keepalive: idle time before the first check, interval, count
    pub const KEEPALIVE_IDLE_SECS: u32 = 30;
    pub const KEEPALIVE_INTERVAL_SECS: u32 = 10;
    pub const KEEPALIVE_COUNT: u32 = 3;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_fits_inside_frame() {
        assert!(DEFAULT_CHUNK_SIZE + ENVELOPE_HEADROOM < MAX_FRAME_SIZE);
    }
}
