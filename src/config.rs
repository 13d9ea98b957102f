use std::time::Duration;

/// Knobs of the RPC core. Protocol/channel configuration builders (encryption
///  choice, socket-cache policy, platform security) are a hosting-layer
///  concern and live outside this crate.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// hard upper limit for one envelope's header block or body; a peer
    ///  announcing more is treated as a framing fault
    pub max_envelope_size: usize,
    /// upper limit for the length-prefixed handshake descriptor
    pub max_handshake_size: usize,
    /// how often the client pipeline's heartbeat task renews the session
    pub heartbeat_interval: Duration,
    /// re-authenticate with cached credentials and retry once when a call
    ///  faults with an invalid session
    pub auto_relogin: bool,
    /// request error details in fault responses
    pub diagnostics: bool,
}

impl CoreConfig {
    pub fn new() -> CoreConfig {
        CoreConfig {
            max_envelope_size: 16 * 1024 * 1024,
            max_handshake_size: 64 * 1024,
            heartbeat_interval: Duration::from_secs(10),
            auto_relogin: true,
            diagnostics: true,
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::new()
    }
}
