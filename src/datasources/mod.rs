//! Datasource implementations for various cloud providers
//!
//! Datasources provide instance metadata and user data from cloud providers.

pub mod azure;
pub mod ec2;

use crate::{CloudInitError, InstanceMetadata, UserData};
use async_trait::async_trait;

/// Trait for cloud metadata datasources
///
/// Each cloud provider implements this trait to provide instance metadata
/// and user data in a consistent way.
#[async_trait]
pub trait Datasource: Send + Sync {
    /// Name of this datasource (e.g., "EC2", "Azure")
    fn name(&self) -> &'static str;

    /// Check if this datasource is available
    ///
    /// This should be a quick check (e.g., a single HTTP request with a short
    /// timeout, or a race across the candidate addresses).
    async fn is_available(&self) -> bool;

    /// Fetch instance metadata from this datasource
    async fn get_metadata(&self) -> Result<InstanceMetadata, CloudInitError>;

    /// Fetch user data from this datasource
    async fn get_userdata(&self) -> Result<UserData, CloudInitError>;
}
