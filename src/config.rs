use anyhow::bail;
use std::time::Duration;

/// Configuration shared by the framing channels of one process.
pub struct FramingConfig {
    /// The capacities of the three buffer pool size classes. Reads go through the medium
    ///  (TCP) or large (UDP) class; writes pick the smallest class that holds the encoded
    ///  frame. Frames bigger than the large class fall back to direct allocation, so these
    ///  sizes are a throughput knob, not a limit.
    pub small_buffer_size: usize,
    pub medium_buffer_size: usize,
    pub large_buffer_size: usize,

    /// This is the number of buffers that will be pooled per size class at a given time -
    ///  buffers in excess of this number are discarded when they are returned.
    pub buffer_pool_capacity: usize,

    /// Upper bound for a decoded frame length. A peer announcing a longer frame fails the
    ///  decode, which closes the connection. `None` accepts any announced length, leaving
    ///  the connection parked until the peer delivers the bytes or disconnects.
    pub max_frame_len: Option<u64>,

    /// UDP servers derive one session per remote address, and nothing in the datagram flow
    ///  marks a session's end. Sessions that received no datagram for this long are torn
    ///  down by the receive loop. `None` keeps sessions until they are closed explicitly.
    pub session_idle_timeout: Option<Duration>,
}

impl Default for FramingConfig {
    fn default() -> Self {
        FramingConfig {
            small_buffer_size: 512,
            medium_buffer_size: 4 * 1024,
            large_buffer_size: 64 * 1024,
            buffer_pool_capacity: 1024,
            max_frame_len: None,
            session_idle_timeout: None,
        }
    }
}

impl FramingConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.small_buffer_size == 0 {
            bail!("buffer size classes must be nonzero");
        }
        if self.small_buffer_size >= self.medium_buffer_size || self.medium_buffer_size >= self.large_buffer_size {
            bail!("buffer size classes must be strictly increasing: {} / {} / {}",
                self.small_buffer_size, self.medium_buffer_size, self.large_buffer_size);
        }
        if self.max_frame_len == Some(0) {
            bail!("max frame length of 0 would reject every frame");
        }
        Ok(())
    }
}
