//! Runtime configuration bundle (spec.md §5 timeouts table).
//!
//! Passed into the session constructor as an explicit capability, per the
//! "global mutable state" design note in spec.md §9 — no subsystem reads
//! ambient/global config.

use std::time::Duration;

/// All tunable timeouts and bounds for one session attempt.
///
/// Every field mirrors a default named in spec.md §5. Callers override
/// individual fields for testing (short timeouts) or for consoles with
/// different empirical wake budgets.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// HTTP session-init request timeout. Default 10s.
    pub session_init_timeout: Duration,
    /// Control-plane TCP connect timeout. Default 10s.
    pub connect_timeout: Duration,
    /// BANG keep-alive cadence. Default 1s.
    pub bang_interval: Duration,
    /// Silence duration after which the control plane reports connection loss. Default 10s.
    pub connection_lost_threshold: Duration,
    /// Delay after sending the wake datagram before probing begins. Default 12s.
    pub wake_settle_delay: Duration,
    /// Spacing between post-settle READY probes. Default 1.5s.
    pub wake_probe_interval: Duration,
    /// Number of post-settle probes attempted (budget ~= settle + count * interval). Default 15.
    pub wake_probe_count: u32,
    /// Registration cache TTL. Default 5 minutes.
    pub cache_ttl: Duration,
    /// Maximum registration attempts owned by the registration engine. Default 3.
    pub registration_attempt_cap: u32,
    /// Bound on `stop`'s join of the control-plane and feeder tasks. Default 3s.
    pub stop_join_timeout: Duration,
    /// Tick bound for the control-plane update loop. Default 100ms.
    pub control_tick_interval: Duration,
    /// Maximum queued, not-yet-forwarded stream payloads before oldest-drop kicks in. Default 8.
    pub feeder_queue_depth: usize,
    /// Default host-request-port used when discovery has not advertised one. Default 9295.
    pub default_host_request_port: u16,
    /// Maximum bytes a control/stream payload may declare. Default 1024.
    pub max_control_payload: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            session_init_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            bang_interval: Duration::from_secs(1),
            connection_lost_threshold: Duration::from_secs(10),
            wake_settle_delay: Duration::from_secs(12),
            wake_probe_interval: Duration::from_millis(1_500),
            wake_probe_count: 15,
            cache_ttl: Duration::from_secs(300),
            registration_attempt_cap: 3,
            stop_join_timeout: Duration::from_secs(3),
            control_tick_interval: Duration::from_millis(100),
            feeder_queue_depth: 8,
            default_host_request_port: 9295,
            max_control_payload: 1024,
        }
    }
}
