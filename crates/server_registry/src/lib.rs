//! # Server Registry
//!
//! Liveness, capacity and admission registry for a fleet of Horizon game
//! servers. Game servers register themselves, report load through periodic
//! heartbeats and unregister on shutdown. Clients ask the registry which
//! servers they can join and receive connection instructions for one of them.
//!
//! ## Components
//!
//! * [`HeartbeatClock`](clock::HeartbeatClock) - the single time source every
//!   liveness decision is derived from
//! * [`RegistryStore`] - concurrent map of server entries, one lock per entry
//! * [`AdmissionController`] - discovery ordering and join decisions
//! * [`EvictionSweeper`] - background task that marks silent servers offline
//!   and removes servers that stayed silent past the hard timeout
//! * [`RegistryApi`] - request validation façade, bound to HTTP by [`http`]
//!
//! ## Liveness Model
//!
//! A server that has been silent longer than the soft timeout reads as
//! `offline`: it disappears from discovery but remains visible in status
//! reports. Past the hard timeout it is treated as absent and its id may be
//! registered again from scratch. Both rules are evaluated at read time, so
//! the sweeper interval only bounds how long stale entries occupy memory.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use server_registry::{RegistryConfig, ServerRegistry};
//!
//! # async fn run() -> Result<(), server_registry::ServiceError> {
//! let registry = ServerRegistry::open(RegistryConfig::from_env()).await?;
//! registry.start().await?;
//! # Ok(())
//! # }
//! ```

pub use admission::{AdmissionController, DiscoveryFilter, JoinPolicy};
pub use api::RegistryApi;
pub use clock::{HeartbeatClock, ManualClock, StalenessPolicy, SystemClock};
pub use config::RegistryConfig;
pub use error::{RegistryError, ServiceError, StorageError};
pub use persistence::{EntryPersistence, JsonFilePersistence, MemoryPersistence, WriteThrough};
pub use store::RegistryStore;
pub use sweeper::{EvictionSweeper, SweepReport};
pub use types::*;

pub mod admission;
pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod persistence;
pub mod store;
pub mod sweeper;
pub mod types;

use api::RegistrationDefaults;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// A fully wired registry: store, admission, API façade and sweeper.
#[derive(Debug)]
pub struct ServerRegistry {
    config: RegistryConfig,
    store: Arc<RegistryStore>,
    admission: Arc<AdmissionController>,
    api: Arc<RegistryApi>,
    sweeper: Arc<EvictionSweeper>,
    persistence: Option<Arc<dyn EntryPersistence>>,
    shutdown_sender: broadcast::Sender<()>,
}

impl ServerRegistry {
    /// Validates `config` and builds a volatile registry on the system clock.
    pub fn new(config: RegistryConfig) -> Result<Self, ServiceError> {
        config.validate().map_err(ServiceError::Config)?;
        Ok(Self::with_parts(config, Arc::new(SystemClock), None))
    }

    /// Validates `config` and opens the persistence directory if one is set.
    pub async fn open(config: RegistryConfig) -> Result<Self, ServiceError> {
        config.validate().map_err(ServiceError::Config)?;

        let persistence: Option<Arc<dyn EntryPersistence>> = match &config.persistence_dir {
            Some(dir) => {
                info!("💾 Persisting server entries to {}", dir.display());
                Some(Arc::new(JsonFilePersistence::open(dir.clone()).await?))
            }
            None => None,
        };

        Ok(Self::with_parts(config, Arc::new(SystemClock), persistence))
    }

    /// Wires every component from explicit parts.
    ///
    /// `config` is taken as is; use [`new`](Self::new) or [`open`](Self::open)
    /// to have it validated first.
    pub fn with_parts(
        config: RegistryConfig,
        clock: Arc<dyn HeartbeatClock>,
        persistence: Option<Arc<dyn EntryPersistence>>,
    ) -> Self {
        let store = Arc::new(RegistryStore::new(clock, config.staleness()));
        let admission = Arc::new(AdmissionController::new(store.clone(), config.join.clone()));

        let mut api = RegistryApi::new(
            store.clone(),
            admission.clone(),
            RegistrationDefaults {
                capacity: config.default_capacity,
                region: config.default_region.clone(),
            },
        );
        let mut sweeper = EvictionSweeper::new(store.clone(), config.sweep_interval);
        if let Some(persistence) = &persistence {
            let write_through = Arc::new(WriteThrough::new(persistence.clone()));
            api = api.with_write_through(write_through.clone());
            sweeper = sweeper.with_write_through(write_through);
        }

        let (shutdown_sender, _) = broadcast::channel(1);

        Self {
            config,
            store,
            admission,
            api: Arc::new(api),
            sweeper: Arc::new(sweeper),
            persistence,
            shutdown_sender,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RegistryStore> {
        &self.store
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn api(&self) -> &Arc<RegistryApi> {
        &self.api
    }

    pub fn sweeper(&self) -> &Arc<EvictionSweeper> {
        &self.sweeper
    }

    /// Loads persisted entries into the store.
    ///
    /// Entries already past the hard timeout are dropped from persistence
    /// instead of being restored. Returns the number of restored entries.
    pub async fn restore(&self) -> usize {
        let Some(persistence) = &self.persistence else {
            return 0;
        };

        let entries = match persistence.load_all().await {
            Ok(entries) => entries,
            Err(e) => {
                error!("Failed to load persisted server entries: {}", e);
                return 0;
            }
        };

        let now = self.store.now();
        let policy = *self.store.policy();
        let mut restored = 0;

        for entry in entries {
            if entry.is_expired(&policy, now) {
                if let Err(e) = persistence.delete(&entry.id).await {
                    warn!(server_id = %entry.id, "Failed to drop expired persisted entry: {}", e);
                }
                continue;
            }
            if self.store.restore(entry) {
                restored += 1;
            }
        }

        info!("♻️ Restored {} server entries", restored);
        restored
    }

    /// Binds the configured address and serves until [`shutdown`](Self::shutdown).
    pub async fn start(&self) -> Result<(), ServiceError> {
        let addr = self.config.bind_address;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServiceError::Bind(addr, e))?;
        self.serve(listener).await
    }

    /// Serves the HTTP API on an already bound listener.
    ///
    /// Restores persisted state, starts the sweeper, and returns once a
    /// shutdown has been requested and in-flight requests have drained.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServiceError> {
        let mut shutdown_receiver = self.shutdown_sender.subscribe();
        let local_addr: Option<SocketAddr> = listener.local_addr().ok();
        info!(
            "🚀 Starting server registry on {}",
            local_addr.map_or_else(|| self.config.bind_address.to_string(), |a| a.to_string())
        );
        info!(
            "⏱️ Soft timeout {:?}, hard timeout {:?}, sweep every {:?}",
            self.config.soft_timeout, self.config.hard_timeout, self.config.sweep_interval
        );

        self.restore().await;
        let sweeper = self.sweeper.clone().start();

        let app = http::create_router(http::AppState::new(self.api.clone()));
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_receiver.recv().await;
                info!("Shutdown signal received");
            })
            .await;

        info!("🧹 Stopping eviction sweeper...");
        sweeper.stop().await;
        info!("Server registry stopped");

        result.map_err(ServiceError::Serve)
    }

    /// Requests a graceful stop of a running [`start`](Self::start) or [`serve`](Self::serve).
    pub fn shutdown(&self) {
        info!("🛑 Shutting down server registry...");
        let _ = self.shutdown_sender.send(());
    }
}

/// Creates a volatile registry with default configuration.
pub fn create_registry() -> ServerRegistry {
    ServerRegistry::with_parts(RegistryConfig::default(), Arc::new(SystemClock), None)
}

/// Creates a volatile registry with the given configuration.
///
/// # Errors
///
/// Returns [`ServiceError::Config`] if the configuration does not validate.
pub fn create_registry_with_config(config: RegistryConfig) -> Result<ServerRegistry, ServiceError> {
    ServerRegistry::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_wiring_shares_one_store() {
        let registry = create_registry();
        registry.store().upsert(Registration {
            id: "srv-1".to_string(),
            address: ServerAddress::new("127.0.0.1", 7777),
            max_capacity: 4,
            metadata: ServerMetadata::default(),
            last_heartbeat_at: None,
        });

        assert_eq!(registry.api().health().servers, 1);
        assert_eq!(
            registry.admission().discover(&DiscoveryFilter::default()).len(),
            1
        );
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let config = RegistryConfig {
            hard_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let result = ServerRegistry::open(config).await;
        assert!(matches!(result, Err(ServiceError::Config(_))));
    }

    #[test]
    fn test_new_rejects_zero_sweep_interval() {
        let config = RegistryConfig {
            sweep_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            create_registry_with_config(config),
            Err(ServiceError::Config(_))
        ));
        assert!(ServerRegistry::new(RegistryConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn test_serve_and_shutdown() {
        let registry = Arc::new(create_registry());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let running = registry.clone();
        let task = tokio::spawn(async move { running.serve(listener).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
