//! Azure datasource
//!
//! Instance metadata and custom data come from the Instance Metadata Service
//! (IMDS). Provisioning state and injected SSH keys go through the wire
//! server's goal state protocol.
//! <https://docs.microsoft.com/en-us/azure/virtual-machines/linux/instance-metadata-service>

pub mod certificates;
pub mod endpoint;
pub mod goal_state;
pub mod health;
pub mod provisioning;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::Datasource;
use crate::config::AzureConfig;
use crate::url_helper::{FetchRequest, RetryBudget, RetryingFetcher};
use crate::{CloudInitError, InstanceMetadata, UserData};

pub use provisioning::{ProvisioningResult, ProvisioningShim};

/// API version for Azure IMDS
const AZURE_API_VERSION: &str = "2021-02-01";

/// Azure IMDS response structures
#[derive(Debug, Deserialize)]
struct AzureInstanceMetadata {
    compute: AzureCompute,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureCompute {
    #[serde(default)]
    vm_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    vm_size: String,
    #[serde(default)]
    zone: String,
    #[serde(default)]
    computer_name: String,
}

/// Azure datasource
pub struct Azure {
    fetcher: RetryingFetcher,
    config: AzureConfig,
    imds_budget: RetryBudget,
}

impl Azure {
    pub fn new(fetcher: RetryingFetcher, config: AzureConfig) -> Result<Self, CloudInitError> {
        let imds_budget = config.imds.to_budget()?;
        Ok(Self {
            fetcher,
            config,
            imds_budget,
        })
    }

    /// Create with a custom IMDS base URL (for testing)
    pub fn with_base_url(base_url: &str) -> Result<Self, CloudInitError> {
        let config = AzureConfig {
            imds_url: base_url.to_string(),
            ..Default::default()
        };
        Self::new(RetryingFetcher::new()?, config)
    }

    /// Use a different IMDS retry budget
    pub fn with_imds_budget(mut self, budget: RetryBudget) -> Self {
        self.imds_budget = budget;
        self
    }

    fn imds_request(&self, path: &str) -> FetchRequest {
        let url = format!(
            "{}/{}api-version={}",
            self.config.imds_url.trim_end_matches('/'),
            path,
            AZURE_API_VERSION
        );
        FetchRequest::get(url).header("Metadata", "true")
    }

    /// Fetch Azure IMDS instance metadata
    async fn fetch_instance_metadata(&self) -> Result<AzureInstanceMetadata, CloudInitError> {
        let request = self.imds_request("instance?");
        debug!("Fetching Azure IMDS: {}", request.url);

        let response = self.fetcher.fetch(&request, &self.imds_budget).await?;
        Ok(serde_json::from_str(&response.body)?)
    }

    /// Report Ready to the wire server and collect the SSH keys it hands out
    ///
    /// `fingerprints` lists the certificate thumbprints whose keys should be
    /// returned; with none, no certificates are requested.
    pub async fn provision(
        &self,
        fingerprints: &[String],
    ) -> Result<ProvisioningResult, CloudInitError> {
        let endpoint = endpoint::find_endpoint(&self.config).await;
        let mut shim = ProvisioningShim::new(self.fetcher.clone(), &self.config)?
            .with_dispatch(self.fetcher.dispatch().clone());
        shim.fetch_and_report_ready(&endpoint, Some(fingerprints))
            .await
    }

    /// Tell the wire server provisioning failed
    pub async fn report_failure(&self, description: &str) -> Result<(), CloudInitError> {
        let endpoint = endpoint::find_endpoint(&self.config).await;
        let mut shim = ProvisioningShim::new(self.fetcher.clone(), &self.config)?
            .with_dispatch(self.fetcher.dispatch().clone());
        shim.report_failure(&endpoint, description).await
    }
}

#[async_trait]
impl Datasource for Azure {
    fn name(&self) -> &'static str {
        "Azure"
    }

    async fn is_available(&self) -> bool {
        let request = self.imds_request("instance?");
        let budget = RetryBudget::single_attempt(Duration::from_secs(2));
        self.fetcher.fetch(&request, &budget).await.is_ok()
    }

    async fn get_metadata(&self) -> Result<InstanceMetadata, CloudInitError> {
        debug!("Fetching Azure instance metadata");

        let azure_meta = self.fetch_instance_metadata().await?;

        let mut metadata = InstanceMetadata {
            cloud_name: Some("azure".to_string()),
            platform: Some("azure".to_string()),
            ..Default::default()
        };

        if !azure_meta.compute.vm_id.is_empty() {
            metadata.instance_id = Some(azure_meta.compute.vm_id);
        }

        if !azure_meta.compute.computer_name.is_empty() {
            metadata.local_hostname = Some(azure_meta.compute.computer_name);
        } else if !azure_meta.compute.name.is_empty() {
            metadata.local_hostname = Some(azure_meta.compute.name);
        }

        if !azure_meta.compute.location.is_empty() {
            metadata.region = Some(azure_meta.compute.location.clone());
            // Azure uses zone within location
            if !azure_meta.compute.zone.is_empty() {
                metadata.availability_zone = Some(format!(
                    "{}-{}",
                    azure_meta.compute.location, azure_meta.compute.zone
                ));
            }
        }

        if !azure_meta.compute.vm_size.is_empty() {
            metadata.instance_type = Some(azure_meta.compute.vm_size);
        }

        Ok(metadata)
    }

    async fn get_userdata(&self) -> Result<UserData, CloudInitError> {
        debug!("Fetching Azure custom data");

        // 404 means no custom data; anything else non-2xx is retried
        let request = self
            .imds_request("instance/compute/customData?format=text&")
            .accept_status(404);
        let response = self.fetcher.fetch(&request, &self.imds_budget).await?;

        if response.status == 404 {
            debug!("No custom data available");
            return Ok(UserData::None);
        }

        let content = response.body.trim();
        if content.is_empty() {
            return Ok(UserData::None);
        }

        // Azure custom data is base64 encoded
        let decoded = match STANDARD.decode(content) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            Err(_) => content.to_string(),
        };

        Ok(UserData::Raw(decoded))
    }
}
