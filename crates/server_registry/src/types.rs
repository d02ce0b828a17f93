//! Core data types for the server registry.
//!
//! [`ServerEntry`] is the authoritative record for one game-server process.
//! It is owned exclusively by the [`RegistryStore`](crate::store::RegistryStore);
//! everything handed out of the store is a clone. The remaining types here are
//! the inputs that mutate an entry ([`Registration`], [`HeartbeatPatch`]) and
//! the views handed to clients ([`ServerSummary`], [`JoinGrant`],
//! [`AggregateStats`]).
//!
//! All types serialize with camelCase field names to match the JSON contract.

use crate::clock::{Freshness, StalenessPolicy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Timestamp in milliseconds since the Unix epoch.
pub type Timestamp = u64;

// ============================================================================
// Status and address
// ============================================================================

/// Reported health of a game server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Online,
    Degraded,
    Offline,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerStatus::Online => "online",
            ServerStatus::Degraded => "degraded",
            ServerStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

impl FromStr for ServerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(ServerStatus::Online),
            "degraded" => Ok(ServerStatus::Degraded),
            "offline" => Ok(ServerStatus::Offline),
            other => Err(format!("unknown server status '{other}'")),
        }
    }
}

/// Network location of a game server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerAddress {
    type Err = String;

    /// Parses `host:port`, `[v6-host]:port`, or an `http://`-prefixed form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s
            .trim()
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .trim_end_matches('/');
        let (host, port) = trimmed
            .rsplit_once(':')
            .ok_or_else(|| format!("address '{s}' must be in host:port form"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(format!("address '{s}' has an empty host"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("address '{s}' has an invalid port"))?;
        Ok(ServerAddress::new(host, port))
    }
}

// ============================================================================
// Entry
// ============================================================================

/// Player capacity of a server.
///
/// `current > max` is allowed here; admission refuses joins in that case.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub current: u32,
    pub max: u32,
}

impl Capacity {
    pub fn new(current: u32, max: u32) -> Self {
        Self { current, max }
    }

    pub fn is_full(&self) -> bool {
        self.current >= self.max
    }

    /// Load ratio in `[0, ∞)`; a zero-capacity server counts as fully loaded.
    pub fn load_ratio(&self) -> f64 {
        if self.max == 0 {
            1.0
        } else {
            self.current as f64 / self.max as f64
        }
    }
}

/// Descriptive metadata supplied at registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub game_mode: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub version: String,
}

/// Metadata fields a heartbeat may refresh.
///
/// Only fields that are present and non-blank replace the stored value, so a
/// server can bump its `version` without resending its name or region.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub game_mode: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl ServerMetadata {
    /// Applies the non-blank fields of `patch`.
    pub fn merge(&mut self, patch: MetadataPatch) {
        let fields = [
            (&mut self.name, patch.name),
            (&mut self.game_mode, patch.game_mode),
            (&mut self.region, patch.region),
            (&mut self.version, patch.version),
        ];
        for (current, update) in fields {
            if let Some(value) = update.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
                *current = value;
            }
        }
    }
}

/// Optional performance counters reported with heartbeats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    #[serde(default)]
    pub avg_tick_ms: f64,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_bytes: u64,
}

/// Registration record for one game-server process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntry {
    pub id: String,
    pub address: ServerAddress,
    pub capacity: Capacity,
    pub status: ServerStatus,
    pub metadata: ServerMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceStats>,
    pub last_heartbeat_at: Timestamp,
    pub registered_at: Timestamp,
}

impl ServerEntry {
    /// Status as seen by readers at `now`.
    ///
    /// An entry past the soft timeout reads as offline even before the
    /// sweeper has persisted that transition.
    pub fn effective_status(&self, policy: &StalenessPolicy, now: Timestamp) -> ServerStatus {
        match policy.classify(self.last_heartbeat_at, now) {
            Freshness::Fresh => self.status,
            Freshness::Stale | Freshness::Expired => ServerStatus::Offline,
        }
    }

    /// Whether the entry is past the hard timeout at `now`.
    pub fn is_expired(&self, policy: &StalenessPolicy, now: Timestamp) -> bool {
        policy.classify(self.last_heartbeat_at, now) == Freshness::Expired
    }

    /// Public view of this entry with the given effective status.
    pub fn summary(&self, status: ServerStatus) -> ServerSummary {
        ServerSummary {
            id: self.id.clone(),
            name: self.metadata.name.clone(),
            host: self.address.host.clone(),
            port: self.address.port,
            game_mode: self.metadata.game_mode.clone(),
            region: self.metadata.region.clone(),
            version: self.metadata.version.clone(),
            current_players: self.capacity.current,
            max_players: self.capacity.max,
            load: self.capacity.load_ratio(),
            status,
        }
    }
}

// ============================================================================
// Mutations
// ============================================================================

/// Input to [`RegistryStore::upsert`](crate::store::RegistryStore::upsert).
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub id: String,
    pub address: ServerAddress,
    pub max_capacity: u32,
    pub metadata: ServerMetadata,
    /// Heartbeat timestamp to record; `None` means "now".
    pub last_heartbeat_at: Option<Timestamp>,
}

/// Fields merged into an entry by a heartbeat.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeartbeatPatch {
    pub current_players: u32,
    /// Reported status; `None` means the server considers itself online.
    pub status: Option<ServerStatus>,
    pub performance: Option<PerformanceStats>,
    pub max_capacity: Option<u32>,
    pub metadata: Option<MetadataPatch>,
}

impl HeartbeatPatch {
    pub fn players(current_players: u32) -> Self {
        Self {
            current_players,
            ..Default::default()
        }
    }
}

// ============================================================================
// Views
// ============================================================================

/// Client-facing view of a server, as returned by discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub game_mode: String,
    pub region: String,
    pub version: String,
    pub current_players: u32,
    pub max_players: u32,
    pub load: f64,
    pub status: ServerStatus,
}

/// How a client should connect after a successful join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinInstructions {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub token_expires_at: Timestamp,
}

/// Successful admission decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinGrant {
    pub server: ServerSummary,
    pub session_token: String,
    pub join_instructions: JoinInstructions,
}

/// Fleet-wide counters reported by the status call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStats {
    pub total_servers: usize,
    pub online_servers: usize,
    pub degraded_servers: usize,
    pub offline_servers: usize,
    pub total_players: u64,
    pub total_capacity: u64,
    pub utilization: f64,
}
