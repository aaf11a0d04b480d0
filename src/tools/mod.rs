pub mod asset_inventory;
pub mod gcp_auth;
pub mod iam;
pub mod x509_metadata;
