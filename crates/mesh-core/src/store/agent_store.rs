use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::MeshError;
use crate::models::agent::AgentRecord;

/// Shared handle to one agent's record. Every mutation of a single agent goes
/// through this mutex, which linearizes metric and status updates per id.
pub type AgentSlot = Arc<Mutex<AgentRecord>>;

pub(crate) fn poisoned<T>(_: PoisonError<T>) -> MeshError {
    MeshError::Internal("agent store lock poisoned".to_string())
}

/// In-memory table of known agents.
///
/// The outer lock guards membership only; record contents are guarded by
/// each slot's own mutex.
#[derive(Default)]
pub struct AgentRecordStore {
    agents: RwLock<HashMap<String, AgentSlot>>,
}

impl AgentRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, AgentSlot>>, MeshError> {
        self.agents.read().map_err(poisoned)
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, AgentSlot>>, MeshError> {
        self.agents.write().map_err(poisoned)
    }

    /// Copy of one record.
    pub fn snapshot(&self, agent_id: &str) -> Option<AgentRecord> {
        let agents = self.agents.read().ok()?;
        let slot = agents.get(agent_id)?;
        let record = slot.lock().ok()?.clone();
        Some(record)
    }

    /// Copies of every record, sorted by id.
    pub fn list(&self) -> Vec<AgentRecord> {
        let mut records: Vec<AgentRecord> = self
            .agents
            .read()
            .map(|agents| {
                agents
                    .values()
                    .filter_map(|slot| slot.lock().ok().map(|r| r.clone()))
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn len(&self) -> usize {
        self.agents.read().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_list() {
        let store = AgentRecordStore::new();
        {
            let mut agents = store.write().unwrap();
            for id in ["b", "a"] {
                let record = AgentRecord::new(id, id.to_uppercase(), ["grammar_check"], "sim://x");
                agents.insert(id.to_string(), Arc::new(Mutex::new(record)));
            }
        }
        assert_eq!(store.len(), 2);
        assert_eq!(store.snapshot("a").unwrap().display_name, "A");
        assert!(store.snapshot("missing").is_none());
        let ids: Vec<_> = store.list().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
