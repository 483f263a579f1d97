//! cloud-init-azure library
//!
//! Metadata acquisition for cloud-init-rs: retrying and racing HTTP fetches
//! against instance metadata services, and the Azure wire server protocol
//! (goal state, certificate bundles, health reports).
//!
//! # Design Principles
//!
//! - **Safety First**: No unsafe code (`#![forbid(unsafe_code)]`)
//! - **Bounded Waits**: Every network entry point takes an explicit wall-clock budget
//! - **Fast Boot**: Candidate addresses are raced, the first answer wins

pub mod config;
pub mod datasources;
pub mod url_helper;

mod error;

pub use error::{CloudInitError, UrlError};

/// Instance metadata retrieved from datasource
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceMetadata {
    pub instance_id: Option<String>,
    pub local_hostname: Option<String>,
    pub region: Option<String>,
    pub availability_zone: Option<String>,
    pub instance_type: Option<String>,
    pub cloud_name: Option<String>,
    pub platform: Option<String>,
}

/// User data as served by the datasource
///
/// Interpreting it (cloud-config, scripts, MIME) is left to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserData {
    /// Raw user data
    Raw(String),
    /// No user data
    None,
}
