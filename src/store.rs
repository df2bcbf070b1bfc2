//! Position store with optimistic concurrency.
//!
//! The monitor task, decision loop and reconciler all write positions; every
//! write goes through `update_position`, which checks the caller's version
//! against the stored one and bumps it on success. Losers of a race get
//! `StoreError::VersionConflict` and must re-read.
//!
//! Two implementations share the trait: `MemoryStore` for tests and paper
//! experiments, `FileStore` for anything that must survive a restart. The
//! file store snapshots the full state as JSON after every mutation and
//! swaps it in with a rename.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{MacroEvent, Position, SeenSignal};

/// Storage capability shared by both loops. Implementations must make
/// `insert_position` (cap check + insert) and `update_position` atomic.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Insert a new position, enforcing the concurrent-position cap in the
    /// same atomic step. Fails with `CapExceeded` when `max_active`
    /// non-terminal positions already exist.
    async fn insert_position(&self, position: Position, max_active: usize)
        -> Result<Position, StoreError>;

    async fn position(&self, id: Uuid) -> Result<Position, StoreError>;

    /// All non-terminal positions.
    async fn active_positions(&self) -> Result<Vec<Position>, StoreError>;

    async fn active_count(&self) -> Result<usize, StoreError>;

    /// Compare-and-swap write. The stored version must equal
    /// `position.version`; on success the stored copy gets `version + 1`
    /// and is returned. Terminal rows are immutable.
    async fn update_position(&self, position: &Position) -> Result<Position, StoreError>;

    /// Record a processed signal. Returns `false` without modifying anything
    /// if the id was already recorded.
    async fn record_signal(&self, signal: SeenSignal) -> Result<bool, StoreError>;

    async fn signal_seen(&self, id: &str) -> Result<bool, StoreError>;

    async fn record_macro_event(&self, event: MacroEvent) -> Result<(), StoreError>;

    /// Free-form system state (heartbeat, defensive window expiry, ...).
    async fn set_state(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn state(&self, key: &str) -> Result<Option<String>, StoreError>;
}

pub const STATE_DEFENSIVE_UNTIL: &str = "defensive_until";
pub const STATE_LAST_HEARTBEAT: &str = "last_heartbeat";
pub const STATE_LAST_RECONCILE: &str = "last_reconcile_at";

/// Parse an RFC 3339 timestamp stored under a state key.
pub fn parse_state_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[derive(Default, Serialize, Deserialize)]
struct Inner {
    positions: HashMap<Uuid, Position>,
    signals: HashMap<String, SeenSignal>,
    macro_events: Vec<MacroEvent>,
    state: HashMap<String, String>,
}

impl Inner {
    fn insert_position(
        &mut self,
        position: Position,
        max_active: usize,
    ) -> Result<Position, StoreError> {
        let current = self
            .positions
            .values()
            .filter(|p| !p.status.is_terminal())
            .count();
        if current >= max_active {
            return Err(StoreError::CapExceeded {
                current,
                max: max_active,
            });
        }
        self.positions.insert(position.id, position.clone());
        Ok(position)
    }

    fn position(&self, id: Uuid) -> Result<Position, StoreError> {
        self.positions
            .get(&id)
            .cloned()
            .ok_or(StoreError::PositionNotFound(id))
    }

    fn active_positions(&self) -> Vec<Position> {
        let mut active: Vec<Position> = self
            .positions
            .values()
            .filter(|p| !p.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|p| p.opened_at);
        active
    }

    fn active_count(&self) -> usize {
        self.positions
            .values()
            .filter(|p| !p.status.is_terminal())
            .count()
    }

    fn update_position(&mut self, position: &Position) -> Result<Position, StoreError> {
        let stored = self
            .positions
            .get_mut(&position.id)
            .ok_or(StoreError::PositionNotFound(position.id))?;

        if stored.status.is_terminal() {
            return Err(StoreError::Terminal(position.id));
        }
        if stored.version != position.version {
            return Err(StoreError::VersionConflict {
                id: position.id,
                expected: position.version,
                found: stored.version,
            });
        }

        let mut updated = position.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    fn record_signal(&mut self, signal: SeenSignal) -> bool {
        if self.signals.contains_key(&signal.id) {
            return false;
        }
        self.signals.insert(signal.id.clone(), signal);
        true
    }
}

/// In-process store for tests and throwaway paper sessions.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded macro events, oldest first. Used by status reporting.
    pub async fn macro_events(&self) -> Vec<MacroEvent> {
        self.inner.lock().await.macro_events.clone()
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn insert_position(
        &self,
        position: Position,
        max_active: usize,
    ) -> Result<Position, StoreError> {
        self.inner.lock().await.insert_position(position, max_active)
    }

    async fn position(&self, id: Uuid) -> Result<Position, StoreError> {
        self.inner.lock().await.position(id)
    }

    async fn active_positions(&self) -> Result<Vec<Position>, StoreError> {
        Ok(self.inner.lock().await.active_positions())
    }

    async fn active_count(&self) -> Result<usize, StoreError> {
        Ok(self.inner.lock().await.active_count())
    }

    async fn update_position(&self, position: &Position) -> Result<Position, StoreError> {
        self.inner.lock().await.update_position(position)
    }

    async fn record_signal(&self, signal: SeenSignal) -> Result<bool, StoreError> {
        Ok(self.inner.lock().await.record_signal(signal))
    }

    async fn signal_seen(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().await.signals.contains_key(id))
    }

    async fn record_macro_event(&self, event: MacroEvent) -> Result<(), StoreError> {
        self.inner.lock().await.macro_events.push(event);
        Ok(())
    }

    async fn set_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .state
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn state(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().await.state.get(key).cloned())
    }
}

/// Durable store backing a real deployment: positions, processed signals,
/// macro events and system state in one JSON file, rewritten atomically on
/// every mutation. The run loop, `status` and `close-all` all share it.
pub struct FileStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl FileStore {
    /// Load existing state or start empty if the file does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let inner = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Persistence(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == ErrorKind::NotFound => Inner::default(),
            Err(e) => {
                return Err(StoreError::Persistence(format!("{}: {e}", path.display())))
            }
        };
        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    /// Snapshot to a sibling tmp file, then rename over the real one so a
    /// crash mid-write never leaves a torn state file.
    async fn persist(&self, inner: &Inner) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(inner)
            .map_err(|e| StoreError::Persistence(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &json)
            .await
            .map_err(|e| StoreError::Persistence(format!("{}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::Persistence(format!("{}: {e}", self.path.display())))?;
        Ok(())
    }
}

#[async_trait]
impl PositionStore for FileStore {
    async fn insert_position(
        &self,
        position: Position,
        max_active: usize,
    ) -> Result<Position, StoreError> {
        let mut inner = self.inner.lock().await;
        let inserted = inner.insert_position(position, max_active)?;
        self.persist(&inner).await?;
        Ok(inserted)
    }

    async fn position(&self, id: Uuid) -> Result<Position, StoreError> {
        self.inner.lock().await.position(id)
    }

    async fn active_positions(&self) -> Result<Vec<Position>, StoreError> {
        Ok(self.inner.lock().await.active_positions())
    }

    async fn active_count(&self) -> Result<usize, StoreError> {
        Ok(self.inner.lock().await.active_count())
    }

    async fn update_position(&self, position: &Position) -> Result<Position, StoreError> {
        let mut inner = self.inner.lock().await;
        let updated = inner.update_position(position)?;
        self.persist(&inner).await?;
        Ok(updated)
    }

    async fn record_signal(&self, signal: SeenSignal) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let recorded = inner.record_signal(signal);
        if recorded {
            self.persist(&inner).await?;
        }
        Ok(recorded)
    }

    async fn signal_seen(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().await.signals.contains_key(id))
    }

    async fn record_macro_event(&self, event: MacroEvent) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.macro_events.push(event);
        self.persist(&inner).await
    }

    async fn set_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.state.insert(key.to_string(), value.to_string());
        self.persist(&inner).await
    }

    async fn state(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().await.state.get(key).cloned())
    }
}
