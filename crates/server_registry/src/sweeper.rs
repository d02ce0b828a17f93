//! Background eviction of servers that stopped heartbeating.
//!
//! Each pass inspects every entry once:
//!
//! * past the soft timeout and not yet offline: marked `offline` (hidden from
//!   discovery, still visible to diagnostics, revived by the next heartbeat)
//! * past the hard timeout: removed, freeing the id for a fresh registration
//!
//! The only input is each entry's `last_heartbeat_at`, so a restarted sweeper
//! reaches the same decisions with no state of its own. Transitions are
//! conditional on the heartbeat timestamp the pass observed; a heartbeat that
//! lands mid-pass wins over the eviction.

use crate::clock::{Freshness, StalenessPolicy};
use crate::error::{RegistryError, RegistryResult};
use crate::persistence::WriteThrough;
use crate::store::RegistryStore;
use crate::types::{ServerEntry, ServerStatus, Timestamp};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Lower bound for the sweep interval.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Outcome of a single sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub inspected: usize,
    pub marked_offline: Vec<String>,
    pub removed: Vec<String>,
    /// Entries whose inspection failed and were left untouched.
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepAction {
    Keep,
    MarkOffline,
    Remove,
}

/// Periodic two-stage eviction over a [`RegistryStore`].
#[derive(Debug)]
pub struct EvictionSweeper {
    store: Arc<RegistryStore>,
    interval: Duration,
    write_through: Option<Arc<WriteThrough>>,
}

impl EvictionSweeper {
    /// Creates a sweeper that runs every `interval`.
    ///
    /// A zero interval is raised to [`MIN_SWEEP_INTERVAL`]; the timer can't
    /// tick at zero.
    pub fn new(store: Arc<RegistryStore>, interval: Duration) -> Self {
        if interval.is_zero() {
            warn!("Sweep interval of zero raised to {:?}", MIN_SWEEP_INTERVAL);
        }
        Self {
            store,
            interval: interval.max(MIN_SWEEP_INTERVAL),
            write_through: None,
        }
    }

    /// Deletes evicted entries from persistence as well.
    pub fn with_write_through(mut self, write_through: Arc<WriteThrough>) -> Self {
        self.write_through = Some(write_through);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn inspect(
        policy: &StalenessPolicy,
        entry: &ServerEntry,
        now: Timestamp,
    ) -> RegistryResult<SweepAction> {
        // A heartbeat further in the future than the hard timeout can't come
        // from clock jitter; leave it alone rather than guess.
        let horizon = now.saturating_add(policy.hard_timeout.as_millis() as u64);
        if entry.last_heartbeat_at > horizon {
            return Err(RegistryError::InternalFault(format!(
                "entry {} has heartbeat timestamp {} ahead of now ({})",
                entry.id, entry.last_heartbeat_at, now
            )));
        }

        Ok(match policy.classify(entry.last_heartbeat_at, now) {
            Freshness::Fresh => SweepAction::Keep,
            Freshness::Stale if entry.status == ServerStatus::Offline => SweepAction::Keep,
            Freshness::Stale => SweepAction::MarkOffline,
            Freshness::Expired => SweepAction::Remove,
        })
    }

    /// Runs one pass over the store.
    ///
    /// A failure to inspect one entry is logged and does not stop the pass.
    pub fn sweep_once(&self) -> SweepReport {
        let now = self.store.now();
        let policy = *self.store.policy();
        let mut report = SweepReport::default();

        for entry in self.store.list() {
            report.inspected += 1;

            match Self::inspect(&policy, &entry, now) {
                Ok(SweepAction::Keep) => {}
                Ok(SweepAction::MarkOffline) => {
                    if self.store.mark_status_if_unchanged(
                        &entry.id,
                        ServerStatus::Offline,
                        entry.last_heartbeat_at,
                    ) {
                        debug!(server_id = %entry.id, "Marked stale server offline");
                        report.marked_offline.push(entry.id);
                    }
                }
                Ok(SweepAction::Remove) => {
                    if self
                        .store
                        .remove_if_unchanged(&entry.id, entry.last_heartbeat_at)
                    {
                        debug!(server_id = %entry.id, "Evicted expired server");
                        report.removed.push(entry.id);
                    }
                }
                Err(e) => {
                    warn!(server_id = %entry.id, "Sweep skipped entry: {}", e);
                    report.skipped += 1;
                }
            }
        }

        if !report.marked_offline.is_empty() || !report.removed.is_empty() {
            info!(
                "🧹 Sweep: {} inspected, {} marked offline, {} evicted, {} skipped",
                report.inspected,
                report.marked_offline.len(),
                report.removed.len(),
                report.skipped
            );
        }

        report
    }

    /// Runs one pass and removes evicted entries from persistence.
    pub async fn sweep(&self) -> SweepReport {
        let report = self.sweep_once();

        if let Some(write_through) = &self.write_through {
            for id in &report.removed {
                if let Err(e) = write_through.sync(&self.store, id).await {
                    error!(server_id = %id, "Failed to delete evicted server from persistence: {}", e);
                }
            }
        }

        report
    }

    /// Spawns the periodic sweep task.
    ///
    /// The task runs until [`SweeperHandle::stop`] is called or the handle
    /// is dropped.
    pub fn start(self: Arc<Self>) -> SweeperHandle {
        let (shutdown_sender, mut shutdown_receiver) = broadcast::channel::<()>(1);
        let sweeper = Arc::clone(&self);

        info!("🕒 Eviction sweeper started (interval: {:?})", self.interval);

        let task = tokio::spawn(async move {
            let mut ticker = interval(sweeper.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sweeper.sweep().await;
                    }
                    _ = shutdown_receiver.recv() => {
                        info!("Eviction sweeper stopped");
                        break;
                    }
                }
            }
        });

        SweeperHandle {
            shutdown_sender,
            task,
        }
    }
}

/// Owner of a running sweep task.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown_sender: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signals the task to stop and waits for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_sender.send(());
        if let Err(e) = self.task.await {
            error!("Eviction sweeper task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::{EntryPersistence, MemoryPersistence};
    use crate::types::{HeartbeatPatch, Registration, ServerAddress, ServerMetadata};

    fn setup() -> (Arc<ManualClock>, Arc<RegistryStore>, EvictionSweeper) {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(RegistryStore::new(clock.clone(), StalenessPolicy::default()));
        let sweeper = EvictionSweeper::new(store.clone(), Duration::from_secs(300));
        (clock, store, sweeper)
    }

    fn register(store: &RegistryStore, id: &str) {
        store.upsert(Registration {
            id: id.to_string(),
            address: ServerAddress::new("127.0.0.1", 7000),
            max_capacity: 10,
            metadata: ServerMetadata::default(),
            last_heartbeat_at: None,
        });
    }

    #[test]
    fn test_fresh_entries_are_kept() {
        let (clock, store, sweeper) = setup();
        register(&store, "srv-1");
        clock.advance(Duration::from_secs(60));

        let report = sweeper.sweep_once();
        assert_eq!(report.inspected, 1);
        assert!(report.marked_offline.is_empty());
        assert!(report.removed.is_empty());
        assert_eq!(store.get("srv-1").unwrap().status, ServerStatus::Online);
    }

    #[test]
    fn test_soft_timeout_marks_offline_once() {
        let (clock, store, sweeper) = setup();
        register(&store, "srv-1");
        clock.advance(Duration::from_secs(61));

        let report = sweeper.sweep_once();
        assert_eq!(report.marked_offline, vec!["srv-1".to_string()]);
        let entry = store.get("srv-1").unwrap();
        assert_eq!(entry.status, ServerStatus::Offline);
        assert_eq!(entry.last_heartbeat_at, 0);

        // Idempotent: a second pass changes nothing.
        let report = sweeper.sweep_once();
        assert!(report.marked_offline.is_empty());
        assert!(report.removed.is_empty());
    }

    #[test]
    fn test_offline_server_revives_on_heartbeat() {
        let (clock, store, sweeper) = setup();
        register(&store, "srv-1");
        clock.advance(Duration::from_secs(120));
        sweeper.sweep_once();

        store.apply_heartbeat("srv-1", HeartbeatPatch::players(1)).unwrap();
        assert_eq!(store.get("srv-1").unwrap().status, ServerStatus::Online);

        let report = sweeper.sweep_once();
        assert!(report.marked_offline.is_empty());
    }

    #[test]
    fn test_hard_timeout_removes_entry() {
        let (clock, store, sweeper) = setup();
        register(&store, "srv-1");
        register(&store, "srv-2");
        clock.advance(Duration::from_secs(200));
        store.apply_heartbeat("srv-2", HeartbeatPatch::players(0)).unwrap();
        clock.advance(Duration::from_secs(101));

        let report = sweeper.sweep_once();
        assert_eq!(report.inspected, 2);
        assert_eq!(report.removed, vec!["srv-1".to_string()]);
        assert!(store.get("srv-1").is_none());
        assert_eq!(store.get("srv-2").unwrap().status, ServerStatus::Offline);
    }

    #[test]
    fn test_restarted_sweeper_reaches_same_decisions() {
        let (clock, store, sweeper) = setup();
        register(&store, "srv-1");
        clock.advance(Duration::from_secs(90));

        let fresh_sweeper = EvictionSweeper::new(store.clone(), Duration::from_secs(1));
        let first = fresh_sweeper.sweep_once();
        drop(fresh_sweeper);
        let second = sweeper.sweep_once();

        assert_eq!(first.marked_offline, vec!["srv-1".to_string()]);
        assert!(second.marked_offline.is_empty());
        assert_eq!(store.get("srv-1").unwrap().status, ServerStatus::Offline);
    }

    #[test]
    fn test_malformed_entry_does_not_halt_sweep() {
        let (clock, store, sweeper) = setup();
        clock.set(1_000_000);
        register(&store, "good");
        store.restore(ServerEntry {
            id: "future".to_string(),
            address: ServerAddress::new("127.0.0.1", 1),
            capacity: Default::default(),
            status: ServerStatus::Online,
            metadata: ServerMetadata::default(),
            performance: None,
            last_heartbeat_at: u64::MAX,
            registered_at: 0,
        });
        clock.advance(Duration::from_secs(400));

        let report = sweeper.sweep_once();
        assert_eq!(report.inspected, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.removed, vec!["good".to_string()]);
        assert!(store.get("future").is_some());
    }

    #[tokio::test]
    async fn test_sweep_deletes_from_persistence() {
        let (clock, store, _) = setup();
        let persistence = Arc::new(MemoryPersistence::new());
        let sweeper = EvictionSweeper::new(store.clone(), Duration::from_secs(300))
            .with_write_through(Arc::new(WriteThrough::new(persistence.clone())));

        register(&store, "srv-1");
        let entry = store.get("srv-1").unwrap();
        persistence.save("srv-1", &entry).await.unwrap();
        clock.advance(Duration::from_secs(301));

        let report = sweeper.sweep().await;
        assert_eq!(report.removed.len(), 1);
        assert!(persistence.is_empty());
    }

    #[tokio::test]
    async fn test_zero_interval_is_raised() {
        let (clock, store, _) = setup();
        register(&store, "srv-1");
        clock.advance(Duration::from_secs(61));

        let sweeper = Arc::new(EvictionSweeper::new(store.clone(), Duration::ZERO));
        assert_eq!(sweeper.interval(), MIN_SWEEP_INTERVAL);

        let handle = sweeper.start();
        let marked = tokio::time::timeout(Duration::from_secs(2), async {
            while store.get("srv-1").map(|e| e.status) != Some(ServerStatus::Offline) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(marked.is_ok(), "sweeper with a zero interval never ran");
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_background_task_sweeps_and_stops() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(RegistryStore::new(clock.clone(), StalenessPolicy::default()));
        register(&store, "srv-1");
        clock.advance(Duration::from_secs(61));

        let sweeper = Arc::new(EvictionSweeper::new(store.clone(), Duration::from_millis(10)));
        let handle = sweeper.start();

        let marked = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if store.get("srv-1").map(|e| e.status) == Some(ServerStatus::Offline) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(marked.is_ok(), "sweeper never marked the stale server offline");

        handle.stop().await;
    }
}
