//! Request-facing façade over the registry.
//!
//! [`RegistryApi`] turns loosely typed requests into store and admission
//! calls. It only validates input: required fields must be present and
//! non-empty, numeric fields accept numbers or numeric strings. Everything
//! else is delegated. The façade is transport-agnostic; the HTTP binding
//! lives in [`crate::http`].

use crate::admission::{AdmissionController, DiscoveryFilter};
use crate::error::{RegistryError, RegistryResult};
use crate::persistence::WriteThrough;
use crate::store::RegistryStore;
use crate::types::{
    AggregateStats, HeartbeatPatch, JoinGrant, MetadataPatch, PerformanceStats, Registration,
    ServerAddress, ServerEntry, ServerMetadata, ServerStatus, ServerSummary, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info};

// ============================================================================
// Requests
// ============================================================================

/// Address as either `"host:port"` or `{host, port}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum AddressInput {
    Text(String),
    Parts {
        host: Option<String>,
        port: Option<Value>,
    },
}

/// Body of a registration. `capacity` and `maxPlayers` are accepted as
/// aliases of `maxCapacity`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub id: Option<String>,
    pub address: Option<AddressInput>,
    #[serde(alias = "capacity", alias = "maxPlayers")]
    pub max_capacity: Option<Value>,
    pub metadata: Option<ServerMetadata>,
}

/// Body of a heartbeat. Only `id` and `currentCapacity` are required;
/// `metadata` refreshes just the fields it carries.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub id: Option<String>,
    #[serde(alias = "currentPlayers", alias = "currentConnections")]
    pub current_capacity: Option<Value>,
    pub status: Option<String>,
    pub performance: Option<PerformanceStats>,
    pub max_capacity: Option<Value>,
    pub metadata: Option<MetadataPatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub client_id: Option<String>,
    pub server_id: Option<String>,
}

/// Discovery filters; `includeFull` defaults to true.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverQuery {
    pub region: Option<String>,
    pub game_mode: Option<String>,
    pub include_full: Option<bool>,
}

// ============================================================================
// Responses
// ============================================================================

/// Acknowledgement for register, heartbeat and unregister.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckResponse {
    pub ok: bool,
    pub id: String,
}

impl AckResponse {
    fn ok(id: impl Into<String>) -> Self {
        Self {
            ok: true,
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverResponse {
    pub servers: Vec<ServerSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub servers: Vec<ServerEntry>,
    pub aggregate_stats: AggregateStats,
    pub generated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub servers: usize,
}

// ============================================================================
// Façade
// ============================================================================

/// Values filled in when a registration omits them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationDefaults {
    pub capacity: u32,
    pub region: String,
}

/// Validating entry point for every registry operation.
///
/// Mutations are applied to the store first; with write-through enabled the
/// persisted copy is then brought in line. Persistence failures are logged
/// and never fail the request.
#[derive(Debug)]
pub struct RegistryApi {
    store: Arc<RegistryStore>,
    admission: Arc<AdmissionController>,
    defaults: RegistrationDefaults,
    write_through: Option<Arc<WriteThrough>>,
}

impl RegistryApi {
    pub fn new(
        store: Arc<RegistryStore>,
        admission: Arc<AdmissionController>,
        defaults: RegistrationDefaults,
    ) -> Self {
        Self {
            store,
            admission,
            defaults,
            write_through: None,
        }
    }

    /// Writes entries through to persistence after every mutation.
    pub fn with_write_through(mut self, write_through: Arc<WriteThrough>) -> Self {
        self.write_through = Some(write_through);
        self
    }

    pub fn store(&self) -> &Arc<RegistryStore> {
        &self.store
    }

    /// Registers a server, or re-registers it if the id is already known.
    pub async fn register(&self, request: RegisterRequest) -> RegistryResult<AckResponse> {
        let id = required_text("id", request.id.as_deref())?;
        let address = parse_address(request.address)?;
        let max_capacity =
            optional_u32("maxCapacity", request.max_capacity.as_ref())?.unwrap_or(self.defaults.capacity);

        let mut metadata = request.metadata.unwrap_or_default();
        if metadata.region.trim().is_empty() {
            metadata.region = self.defaults.region.clone();
        }
        if metadata.name.trim().is_empty() {
            metadata.name = id.clone();
        }

        let entry = self.store.upsert(Registration {
            id: id.clone(),
            address,
            max_capacity,
            metadata,
            last_heartbeat_at: None,
        });
        info!(
            "📡 Registered server {} at {} (capacity {}, region {})",
            entry.id, entry.address, entry.capacity.max, entry.metadata.region
        );

        self.persist(&entry.id).await;
        Ok(AckResponse::ok(id))
    }

    /// Applies a heartbeat from a registered server.
    pub async fn heartbeat(&self, request: HeartbeatRequest) -> RegistryResult<AckResponse> {
        let id = required_text("id", request.id.as_deref())?;
        let current_players = optional_u32("currentCapacity", request.current_capacity.as_ref())?
            .ok_or(RegistryError::MissingField("currentCapacity"))?;
        let status = request
            .status
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.parse::<ServerStatus>())
            .transpose()
            .map_err(|reason| RegistryError::invalid("status", reason))?;
        let max_capacity = optional_u32("maxCapacity", request.max_capacity.as_ref())?;

        let entry = self.store.apply_heartbeat(
            &id,
            HeartbeatPatch {
                current_players,
                status,
                performance: request.performance,
                max_capacity,
                metadata: request.metadata,
            },
        )?;
        debug!(
            server_id = %entry.id,
            players = entry.capacity.current,
            max = entry.capacity.max,
            status = %entry.status,
            "Heartbeat applied"
        );

        self.persist(&entry.id).await;
        Ok(AckResponse::ok(id))
    }

    /// Removes a server. A second call for the same id fails with `NotFound`.
    pub async fn unregister(&self, id: Option<&str>) -> RegistryResult<AckResponse> {
        let id = required_text("id", id)?;
        if !self.store.remove(&id) {
            return Err(RegistryError::NotFound(id));
        }
        info!("👋 Unregistered server {}", id);

        self.persist(&id).await;
        Ok(AckResponse::ok(id))
    }

    /// Diagnostic lookup of a single entry, including offline ones.
    pub fn get(&self, id: Option<&str>) -> RegistryResult<ServerEntry> {
        let id = required_text("id", id)?;
        let now = self.store.now();
        let policy = self.store.policy();

        self.store
            .get(&id)
            .filter(|entry| !entry.is_expired(policy, now))
            .map(|mut entry| {
                entry.status = entry.effective_status(policy, now);
                entry
            })
            .ok_or(RegistryError::NotFound(id))
    }

    /// Lists servers a client may join. Never fails.
    pub fn discover(&self, query: DiscoverQuery) -> DiscoverResponse {
        let filter = DiscoveryFilter {
            region: non_empty(query.region),
            game_mode: non_empty(query.game_mode),
            include_full: query.include_full.unwrap_or(true),
        };

        let servers = self
            .admission
            .discover(&filter)
            .iter()
            .map(|entry| entry.summary(ServerStatus::Online))
            .collect();
        DiscoverResponse { servers }
    }

    /// Evaluates a join request and issues a session token on success.
    pub fn join(&self, request: JoinRequest) -> RegistryResult<JoinGrant> {
        let client_id = required_text("clientId", request.client_id.as_deref())?;
        let server_id = required_text("serverId", request.server_id.as_deref())?;
        self.admission.evaluate_join(&client_id, &server_id)
    }

    /// Every live entry with its effective status plus fleet totals. Never fails.
    pub fn status(&self) -> StatusResponse {
        let now = self.store.now();
        let policy = self.store.policy();

        let mut servers: Vec<ServerEntry> = self
            .store
            .list()
            .into_iter()
            .filter(|entry| !entry.is_expired(policy, now))
            .map(|mut entry| {
                entry.status = entry.effective_status(policy, now);
                entry
            })
            .collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));

        StatusResponse {
            aggregate_stats: aggregate_stats(&servers),
            servers,
            generated_at: now,
        }
    }

    /// Health check. Counts entries that are not past the hard timeout.
    pub fn health(&self) -> HealthResponse {
        let now = self.store.now();
        let policy = self.store.policy();
        let servers = self
            .store
            .list()
            .iter()
            .filter(|entry| !entry.is_expired(policy, now))
            .count();

        HealthResponse {
            status: "ok".to_string(),
            servers,
        }
    }

    async fn persist(&self, id: &str) {
        if let Some(write_through) = &self.write_through {
            if let Err(e) = write_through.sync(&self.store, id).await {
                error!(server_id = %id, "Failed to persist server entry: {}", e);
            }
        }
    }
}

/// Fleet totals over entries whose status is already effective.
///
/// Utilization only counts servers that are online or degraded.
pub fn aggregate_stats(servers: &[ServerEntry]) -> AggregateStats {
    let mut stats = AggregateStats {
        total_servers: servers.len(),
        ..Default::default()
    };

    for entry in servers {
        match entry.status {
            ServerStatus::Online => stats.online_servers += 1,
            ServerStatus::Degraded => stats.degraded_servers += 1,
            ServerStatus::Offline => {
                stats.offline_servers += 1;
                continue;
            }
        }
        stats.total_players += entry.capacity.current as u64;
        stats.total_capacity += entry.capacity.max as u64;
    }

    if stats.total_capacity > 0 {
        stats.utilization = stats.total_players as f64 / stats.total_capacity as f64;
    }
    stats
}

// ============================================================================
// Input helpers
// ============================================================================

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required_text(field: &'static str, value: Option<&str>) -> RegistryResult<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(RegistryError::MissingField(field))
}

/// Coerces a JSON number or numeric string into a `u32`. `null` counts as absent.
fn optional_u32(field: &'static str, value: Option<&Value>) -> RegistryResult<Option<u32>> {
    let raw = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                    .map(|f| f as u64)
            })
            .ok_or_else(|| RegistryError::invalid(field, "expected a non-negative integer"))?,
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| RegistryError::invalid(field, format!("'{s}' is not a non-negative integer")))?,
        Some(_) => return Err(RegistryError::invalid(field, "expected a number")),
    };

    u32::try_from(raw)
        .map(Some)
        .map_err(|_| RegistryError::invalid(field, "value is too large"))
}

fn parse_address(input: Option<AddressInput>) -> RegistryResult<ServerAddress> {
    match input.ok_or(RegistryError::MissingField("address"))? {
        AddressInput::Text(text) => {
            if text.trim().is_empty() {
                return Err(RegistryError::MissingField("address"));
            }
            text.parse::<ServerAddress>()
                .map_err(|reason| RegistryError::invalid("address", reason))
        }
        AddressInput::Parts { host, port } => {
            let host = required_text("address.host", host.as_deref())?;
            let port = optional_u32("address.port", port.as_ref())?
                .ok_or(RegistryError::MissingField("address.port"))?;
            let port = u16::try_from(port)
                .map_err(|_| RegistryError::invalid("address.port", "port out of range"))?;
            Ok(ServerAddress::new(host, port))
        }
    }
}
