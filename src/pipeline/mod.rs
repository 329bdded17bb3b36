//! Request-driven pipeline: ingestion gateway, per-node serialization, orchestrator.

pub mod ingest;
pub mod node_locks;
pub mod orchestrator;
