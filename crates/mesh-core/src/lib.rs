//! MESH Core — transport-agnostic orchestration for professional-assistant
//! agents.
//!
//! This crate knows which agents exist, what they can do and whether they are
//! healthy, and turns declared multi-step workflows into concurrent,
//! dependency-respecting execution plans. It has **no transport dependency**;
//! protocol servers and the `mesh` CLI sit on top of it.
//!
//! # Feature Flags
//!
//! - `axum` — Enables `IntoResponse` impl on `MeshError` for use in axum handlers.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod store;
pub mod workflow;

// Convenience re-exports
pub use config::{MeshConfig, OrchestratorConfig, RegistryConfig, RetryPolicy};
pub use dispatch::{AgentInvoker, HttpAgentInvoker, SimulatedInvoker, TaskDispatcher};
pub use error::{ErrorDetail, MeshError};
pub use orchestrator::WorkflowOrchestrator;
pub use registry::AgentRegistry;
pub use workflow::{CompiledGraph, GraphBuilder};
