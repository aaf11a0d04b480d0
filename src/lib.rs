//! Lornu AI Key Audit Library
//!
//! Service account key provenance classification with GCP API integrations.

pub mod agents;
pub mod tools;

pub use agents::key_audit::KeyAuditAgent;
