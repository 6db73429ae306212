//! Capability name → agent ids, restricted to agents that can take work.

use std::collections::{BTreeSet, HashMap};

use crate::models::agent::{normalize_key, AgentRecord};

#[derive(Debug, Default)]
pub struct CapabilityIndex {
    entries: HashMap<String, BTreeSet<String>>,
}

impl CapabilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-derive the entries for one record. Offline agents are dropped.
    pub fn sync(&mut self, record: &AgentRecord) {
        self.remove(&record.id);
        if record.status.is_available() {
            for key in record.capability_keys() {
                self.entries
                    .entry(key)
                    .or_default()
                    .insert(record.id.clone());
            }
        }
    }

    pub fn remove(&mut self, agent_id: &str) {
        self.entries.retain(|_, ids| {
            ids.remove(agent_id);
            !ids.is_empty()
        });
    }

    /// Ids indexed under a capability, ordered by id.
    pub fn ids(&self, capability: &str) -> Vec<String> {
        self.entries
            .get(&normalize_key(capability))
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, capability: &str, agent_id: &str) -> bool {
        self.entries
            .get(&normalize_key(capability))
            .map(|ids| ids.contains(agent_id))
            .unwrap_or(false)
    }

    pub fn capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = self.entries.keys().cloned().collect();
        caps.sort();
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::agent::AgentStatus;

    #[test]
    fn test_sync_tracks_availability() {
        let mut index = CapabilityIndex::new();
        let mut record = AgentRecord::new("crm", "CRMConnector", ["CRM_Lookup", "contact_lookup"], "sim://crm");
        index.sync(&record);
        assert_eq!(index.ids("crm_lookup"), vec!["crm"]);
        assert!(index.contains("contact_lookup", "crm"));

        record.status = AgentStatus::Offline;
        index.sync(&record);
        assert!(index.ids("crm_lookup").is_empty());
        assert!(index.capabilities().is_empty());
    }

    #[test]
    fn test_sync_drops_removed_capabilities() {
        let mut index = CapabilityIndex::new();
        let mut record = AgentRecord::new("bot", "Bot", ["email_draft", "grammar_check"], "sim://bot");
        index.sync(&record);
        record.capabilities.remove("grammar_check");
        index.sync(&record);
        assert_eq!(index.capabilities(), vec!["email_draft"]);
    }
}
