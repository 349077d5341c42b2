// Records shared between the inventory, the reconciler and the reports

use dove_scanner::{CanonicalKey, ParsedEndpoint, VerificationOutcome};
use serde::{Deserialize, Serialize};

/// One persisted node. The canonical key is unique across the inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub key: CanonicalKey,
    pub raw_link: String,
    pub remark: Option<String>,
    pub source: Option<String>,
    pub last_ping_ms: Option<u64>,
    pub last_speed_kbps: Option<f64>,
    /// Unix seconds of the last verification.
    pub last_checked: Option<i64>,
    pub is_working: bool,
}

impl NodeRecord {
    /// Record for an endpoint that just passed verification.
    pub fn verified(
        endpoint: &ParsedEndpoint,
        raw_link: String,
        remark: Option<String>,
        source: Option<String>,
        outcome: &VerificationOutcome,
        checked_at: i64,
    ) -> Self {
        NodeRecord {
            key: endpoint.key(),
            raw_link,
            remark,
            source,
            last_ping_ms: Some(outcome.tcp_latency_ms),
            last_speed_kbps: Some(outcome.throughput_kbps),
            last_checked: Some(checked_at),
            is_working: outcome.is_success(),
        }
    }

    /// Refresh the verification metadata in place.
    pub fn apply_outcome(&mut self, outcome: &VerificationOutcome, checked_at: i64) {
        self.last_ping_ms = Some(outcome.tcp_latency_ms);
        self.last_speed_kbps = Some(outcome.throughput_kbps);
        self.last_checked = Some(checked_at);
        self.is_working = outcome.is_success();
    }
}

/// A raw link together with the name of the source that reported it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourcedLink {
    pub raw: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mirror {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub active: bool,
    pub last_checked: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub username: String,
    pub active: bool,
    pub last_checked: Option<i64>,
    pub created_at: i64,
}

/// Which upstream sources a scan pulls from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanScope {
    All,
    Channels,
    Mirrors,
}

impl ScanScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanScope::All => "all",
            ScanScope::Channels => "channels",
            ScanScope::Mirrors => "mirrors",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "all" => Some(ScanScope::All),
            "channels" => Some(ScanScope::Channels),
            "mirrors" => Some(ScanScope::Mirrors),
            _ => None,
        }
    }

    pub fn includes_channels(&self) -> bool {
        matches!(self, ScanScope::All | ScanScope::Channels)
    }

    pub fn includes_mirrors(&self) -> bool {
        matches!(self, ScanScope::All | ScanScope::Mirrors)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// Counts recorded against a finished scan run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCounts {
    pub links_collected: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRun {
    pub id: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub status: String,
    pub scope: String,
    pub counts: ScanCounts,
}
