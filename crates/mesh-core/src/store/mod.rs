pub mod agent_store;

pub use agent_store::{AgentRecordStore, AgentSlot};
