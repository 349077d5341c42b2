use serde::{Deserialize, Serialize};

/// Outcome of one two-stage probe. Produced fresh on every verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub reachable: bool,
    pub tcp_latency_ms: u64,
    pub tunnel_working: bool,
    pub throughput_kbps: f64,
}

impl VerificationOutcome {
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            tcp_latency_ms: 0,
            tunnel_working: false,
            throughput_kbps: 0.0,
        }
    }

    /// Connected, but outside the accepted latency window.
    pub fn rejected(tcp_latency_ms: u64) -> Self {
        Self {
            reachable: false,
            tcp_latency_ms,
            tunnel_working: false,
            throughput_kbps: 0.0,
        }
    }

    /// Stage A passed, the tunnel probe did not.
    pub fn tunnel_failed(tcp_latency_ms: u64) -> Self {
        Self {
            reachable: true,
            tcp_latency_ms,
            tunnel_working: false,
            throughput_kbps: 0.0,
        }
    }

    pub fn working(tcp_latency_ms: u64, throughput_kbps: f64) -> Self {
        Self {
            reachable: true,
            tcp_latency_ms,
            tunnel_working: true,
            throughput_kbps,
        }
    }

    pub fn is_success(&self) -> bool {
        self.reachable && self.tunnel_working
    }
}
