//! Config surface recognized by the HTTP/3 driver.

use std::time::Duration;

/// Recognized HTTP/3 driver options and their documented defaults.
#[derive(Debug, Clone)]
pub struct H3DriverConfig {
    /// `SO_RCVBUF` for the bound UDP socket. Default 8 MiB.
    pub recvbufsize: usize,
    /// Poll timeout used while no connection has pending write work under
    /// a blocking-poll driver model. Default 3s. Unused by this
    /// `tokio`-reactor-driven implementation, which reacts to readiness
    /// directly instead of polling on a timer, but kept for
    /// config-surface compatibility.
    pub idletimeout: Duration,
    /// Poll timeout used while any connection has pending writes or
    /// pending resumes under a blocking-poll driver model. Default
    /// 10ms. Unused here for the same reason as `idletimeout`.
    pub draintimeout: Duration,
    /// `max_field_section_size` advertised in the initial SETTINGS frame.
    /// Default 16 KiB.
    pub max_field_section_size: u64,
    /// Bodies at or above this size are spooled to a temp file rather than
    /// reassembled in memory. Default 1 MiB.
    pub maxupload: u64,
    /// Receive staging buffer capacity per stream. Default 16 KiB.
    pub recv_stage_capacity: usize,
}

impl Default for H3DriverConfig {
    fn default() -> Self {
        Self {
            recvbufsize: 8 * 1024 * 1024,
            idletimeout: Duration::from_secs(3),
            draintimeout: Duration::from_millis(10),
            max_field_section_size: 16 * 1024,
            maxupload: 1024 * 1024,
            recv_stage_capacity: 16 * 1024,
        }
    }
}
