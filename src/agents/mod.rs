//! Agent modules for Lornu AI Key Audit
//!
//! - `key_audit`: Service account key provenance classification

pub mod key_audit;

pub use key_audit::KeyAuditAgent;
