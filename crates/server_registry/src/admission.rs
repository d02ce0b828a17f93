//! Discovery and join admission.
//!
//! The controller answers two questions from read-only store snapshots:
//! which servers a client may see, and whether a client may be routed to a
//! given server right now. Admission is advisory: the game server enforces
//! its own slot limit, so the registry only refuses servers that are
//! obviously unavailable or full according to their latest heartbeat.

use crate::error::{RegistryError, RegistryResult};
use crate::store::RegistryStore;
use crate::types::{JoinGrant, JoinInstructions, ServerEntry, ServerStatus, Timestamp};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Prefix marking a registry-issued session token.
pub const SESSION_TOKEN_PREFIX: &str = "hzs_";

/// Connection policy handed to clients with every join grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPolicy {
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub token_ttl: Duration,
}

impl Default for JoinPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            token_ttl: Duration::from_secs(300),
        }
    }
}

/// Optional narrowing of discovery results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFilter {
    pub region: Option<String>,
    pub game_mode: Option<String>,
    /// Include servers whose reported player count has reached capacity.
    pub include_full: bool,
}

impl Default for DiscoveryFilter {
    fn default() -> Self {
        Self {
            region: None,
            game_mode: None,
            include_full: true,
        }
    }
}

impl DiscoveryFilter {
    fn matches(&self, entry: &ServerEntry) -> bool {
        let field_matches = |wanted: &Option<String>, actual: &str| {
            wanted
                .as_deref()
                .map_or(true, |w| w.eq_ignore_ascii_case(actual))
        };
        field_matches(&self.region, &entry.metadata.region)
            && field_matches(&self.game_mode, &entry.metadata.game_mode)
            && (self.include_full || !entry.capacity.is_full())
    }
}

/// Read-only decisions over the store: which servers to advertise and
/// whether a client may join one of them.
///
/// Admission never writes. A granted join does not reserve a slot; the
/// server's own heartbeats remain the only source of its player count.
#[derive(Debug)]
pub struct AdmissionController {
    store: Arc<RegistryStore>,
    policy: JoinPolicy,
}

impl AdmissionController {
    /// Creates a controller over `store` that hands out `policy` with every grant.
    pub fn new(store: Arc<RegistryStore>, policy: JoinPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &JoinPolicy {
        &self.policy
    }

    /// Returns every server that is effectively online, least loaded first.
    ///
    /// Ties are broken by id so the order is stable between calls.
    pub fn discover(&self, filter: &DiscoveryFilter) -> Vec<ServerEntry> {
        let now = self.store.now();
        let staleness = self.store.policy();

        let mut visible: Vec<ServerEntry> = self
            .store
            .list()
            .into_iter()
            .filter(|entry| entry.effective_status(staleness, now) == ServerStatus::Online)
            .filter(|entry| filter.matches(entry))
            .collect();

        visible.sort_by(|a, b| {
            a.capacity
                .load_ratio()
                .total_cmp(&b.capacity.load_ratio())
                .then_with(|| a.id.cmp(&b.id))
        });
        visible
    }

    /// Decides whether `client_id` may be routed to `server_id` now.
    ///
    /// The decision is computed from one snapshot of the entry, so a
    /// concurrent heartbeat is either fully reflected or not at all.
    pub fn evaluate_join(&self, client_id: &str, server_id: &str) -> RegistryResult<JoinGrant> {
        let now = self.store.now();
        let staleness = self.store.policy();

        let entry = self
            .store
            .get(server_id)
            .filter(|entry| !entry.is_expired(staleness, now))
            .ok_or_else(|| RegistryError::UnknownServer(server_id.to_string()))?;

        let status = entry.effective_status(staleness, now);
        if status != ServerStatus::Online {
            return Err(RegistryError::ServerUnavailable {
                id: entry.id,
                status: status.to_string(),
            });
        }

        if entry.capacity.is_full() {
            return Err(RegistryError::ServerFull {
                id: entry.id,
                current: entry.capacity.current,
                max: entry.capacity.max,
            });
        }

        let session_token = issue_session_token(client_id, server_id, now);
        debug!(client_id, server_id, "Join granted");

        Ok(JoinGrant {
            join_instructions: JoinInstructions {
                host: entry.address.host.clone(),
                port: entry.address.port,
                connect_timeout_ms: self.policy.connect_timeout.as_millis() as u64,
                max_retries: self.policy.max_retries,
                retry_backoff_ms: self.policy.retry_backoff.as_millis() as u64,
                token_expires_at: now + self.policy.token_ttl.as_millis() as u64,
            },
            server: entry.summary(status),
            session_token,
        })
    }
}

/// Issues an opaque token correlating a client, a server and an issue time.
///
/// The token carries no authority and the registry never reads it back.
/// A random nonce keeps tokens unique for identical inputs.
pub fn issue_session_token(client_id: &str, server_id: &str, issued_at: Timestamp) -> String {
    let nonce = Uuid::new_v4().simple();
    let raw = format!("{client_id}|{server_id}|{issued_at}|{nonce}");
    format!("{SESSION_TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(raw))
}
