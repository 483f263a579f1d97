//! Provisioning against the wire server
//!
//! Ties goal state retrieval, certificate decryption and health reporting
//! together into "fetch and report ready" and "report failure".

use std::collections::BTreeMap;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, debug, info, warn};

use super::certificates::{CertificateVault, KeyDirectory, normalize_fingerprint};
use super::goal_state::GoalStateClient;
use super::health::HealthReporter;
use crate::CloudInitError;
use crate::config::AzureConfig;
use crate::url_helper::RetryingFetcher;

/// Substatus sent with NotReady reports
pub const FAILURE_SUBSTATUS: &str = "ProvisioningFailed";

/// What provisioning discovered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisioningResult {
    /// SSH public keys by certificate fingerprint
    pub metadata: BTreeMap<String, String>,
}

/// Drives one provisioning run against the wire server
pub struct ProvisioningShim {
    goal_state: GoalStateClient,
    reporter: HealthReporter,
    vault: CertificateVault,
    dispatch: Dispatch,
}

impl ProvisioningShim {
    /// Build the components from the Azure datasource settings
    pub fn new(fetcher: RetryingFetcher, config: &AzureConfig) -> Result<Self, CloudInitError> {
        let mut vault = CertificateVault::new();
        if let Some(dir) = &config.certificate_dir {
            vault = vault.with_base_dir(dir);
        }
        Ok(Self::from_parts(
            GoalStateClient::new(fetcher.clone(), config.goal_state.to_budget()?),
            HealthReporter::new(fetcher, config.health.to_budget()?),
            vault,
        ))
    }

    pub fn from_parts(
        goal_state: GoalStateClient,
        reporter: HealthReporter,
        vault: CertificateVault,
    ) -> Self {
        Self {
            goal_state,
            reporter,
            vault,
            dispatch: tracing::dispatcher::get_default(Dispatch::clone),
        }
    }

    /// Route logging of the shim and all its components to `dispatch`
    pub fn with_dispatch(self, dispatch: Dispatch) -> Self {
        Self {
            goal_state: self.goal_state.with_dispatch(dispatch.clone()),
            reporter: self.reporter.with_dispatch(dispatch.clone()),
            vault: self.vault.with_dispatch(dispatch.clone()),
            dispatch,
        }
    }

    pub fn reporter(&self) -> &HealthReporter {
        &self.reporter
    }

    /// Fetch the goal state, collect SSH keys and report Ready
    ///
    /// Certificates are only requested when `pubkey_filter` lists at least one
    /// fingerprint, and the result is narrowed to those fingerprints. On any
    /// failure other than the health report itself a NotReady report is
    /// attempted before the original error is returned.
    pub async fn fetch_and_report_ready(
        &mut self,
        endpoint: &str,
        pubkey_filter: Option<&[String]>,
    ) -> Result<ProvisioningResult, CloudInitError> {
        let dispatch = self.dispatch.clone();
        async {
            let result = self.ready(endpoint, pubkey_filter).await;
            let result = match result {
                Err(err) if !err.is_health_report() => {
                    let description = format!("Provisioning failed: {err}");
                    if let Err(report_err) = self.failure(endpoint, &description).await {
                        warn!("Could not report provisioning failure: {}", report_err);
                    }
                    Err(err)
                }
                other => other,
            };
            self.vault.cleanup();
            result
        }
        .with_subscriber(dispatch)
        .await
    }

    /// Report NotReady/ProvisioningFailed with `description`
    pub async fn report_failure(
        &mut self,
        endpoint: &str,
        description: &str,
    ) -> Result<(), CloudInitError> {
        let dispatch = self.dispatch.clone();
        async {
            let result = self.failure(endpoint, description).await;
            self.vault.cleanup();
            result
        }
        .with_subscriber(dispatch)
        .await
    }

    async fn ready(
        &mut self,
        endpoint: &str,
        pubkey_filter: Option<&[String]>,
    ) -> Result<ProvisioningResult, CloudInitError> {
        let need_certificates = pubkey_filter.is_some_and(|filter| !filter.is_empty());
        let transport_certificate = if need_certificates {
            Some(self.vault.transport_certificate()?)
        } else {
            None
        };

        let goal_state = self
            .goal_state
            .fetch_goal_state(endpoint, transport_certificate.as_deref())
            .await?;

        let metadata = match &goal_state.certificates_xml {
            Some(xml) => {
                let keys = self.vault.decrypt(xml)?;
                filter_keys(keys, pubkey_filter)
            }
            None => {
                debug!("No certificates in goal state, no keys to extract");
                BTreeMap::new()
            }
        };

        self.reporter.send_ready(endpoint, &goal_state).await?;
        info!("Provisioning complete with {} SSH key(s)", metadata.len());
        Ok(ProvisioningResult { metadata })
    }

    async fn failure(&mut self, endpoint: &str, description: &str) -> Result<(), CloudInitError> {
        let goal_state = self.goal_state.fetch_goal_state(endpoint, None).await?;
        self.reporter
            .send_failure(endpoint, &goal_state, FAILURE_SUBSTATUS, description)
            .await
    }
}

/// Keep only keys whose fingerprint was asked for
fn filter_keys(keys: KeyDirectory, filter: Option<&[String]>) -> BTreeMap<String, String> {
    let Some(filter) = filter else {
        return keys;
    };
    let wanted: Vec<String> = filter.iter().map(|f| normalize_fingerprint(f)).collect();
    keys.into_iter()
        .filter(|(fingerprint, _)| {
            let keep = wanted.contains(&normalize_fingerprint(fingerprint));
            if !keep {
                debug!("Dropping key {} not in the requested list", fingerprint);
            }
            keep
        })
        .collect()
}
