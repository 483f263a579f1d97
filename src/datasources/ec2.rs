//! EC2 (AWS) datasource
//!
//! Fetches metadata from the EC2 Instance Metadata Service (IMDS). The
//! service may answer on IPv4, IPv6 or both, so the candidate addresses are
//! raced and the first to answer is used for the rest of the run. IMDSv2
//! tokens are preferred; IMDSv1 is the fallback when token requests are
//! refused.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::Datasource;
use crate::config::Ec2Config;
use crate::url_helper::{
    AddressRacer, CancelFlag, FetchRequest, RetryBudget, RetryingFetcher,
};
use crate::{CloudInitError, InstanceMetadata, UserData};

/// IMDSv2 token TTL in seconds
const TOKEN_TTL_SECONDS: u32 = 21600;

const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";

/// IMDS address that answered, plus the session token if IMDSv2 is on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ec2Endpoint {
    pub base_url: String,
    pub token: Option<String>,
}

/// EC2 datasource for AWS and compatible clouds
pub struct Ec2 {
    fetcher: RetryingFetcher,
    racer: AddressRacer,
    candidates: Vec<String>,
    probe_budget: RetryBudget,
    read_budget: RetryBudget,
    endpoint: OnceCell<Ec2Endpoint>,
}

impl Ec2 {
    pub fn new(fetcher: RetryingFetcher, config: &Ec2Config) -> Result<Self, CloudInitError> {
        let probe_budget = config.budget()?;
        let racer = AddressRacer::new(config.stagger_delay()?, probe_budget.max_wait)
            .with_dispatch(fetcher.dispatch().clone());
        let read_budget = RetryBudget::new(Duration::from_secs(20), Duration::from_secs(5))
            .with_sleep(Duration::from_secs(1));

        Ok(Self {
            fetcher,
            racer,
            candidates: config
                .metadata_urls
                .iter()
                .map(|url| url.trim_end_matches('/').to_string())
                .collect(),
            probe_budget,
            read_budget,
            endpoint: OnceCell::new(),
        })
    }

    /// Create with a single base URL and short budgets (for testing)
    pub fn with_base_url(base_url: &str) -> Result<Self, CloudInitError> {
        let config = Ec2Config {
            metadata_urls: vec![base_url.to_string()],
            max_wait: 5.0,
            timeout: 2.0,
            stagger_delay: 0.0,
        };
        let ec2 = Self::new(RetryingFetcher::new()?, &config)?;
        Ok(ec2.with_read_budget(RetryBudget::single_attempt(Duration::from_secs(2))))
    }

    pub fn with_read_budget(mut self, budget: RetryBudget) -> Self {
        self.read_budget = budget;
        self
    }

    /// Race the candidate addresses; `None` if none answered in time
    pub async fn find_endpoint(&self) -> Result<Option<Ec2Endpoint>, CloudInitError> {
        let fetcher = self.fetcher.clone();
        let budget = self.probe_budget;

        let winner = self
            .racer
            .race(&self.candidates, move |base_url, cancel| {
                probe(fetcher.clone(), base_url, budget, cancel)
            })
            .await?;

        Ok(winner.map(|winner| {
            info!(
                "Using metadata service at {} (IMDSv{})",
                winner.candidate,
                if winner.value.token.is_some() { 2 } else { 1 }
            );
            winner.value
        }))
    }

    async fn endpoint(&self) -> Result<&Ec2Endpoint, CloudInitError> {
        self.endpoint
            .get_or_try_init(|| async {
                self.find_endpoint().await?.ok_or_else(|| {
                    CloudInitError::Datasource("metadata service did not answer".to_string())
                })
            })
            .await
    }

    fn request(endpoint: &Ec2Endpoint, path: &str) -> FetchRequest {
        let request = FetchRequest::get(format!("{}/{}", endpoint.base_url, path));
        match &endpoint.token {
            Some(token) => request.header(TOKEN_HEADER, token.as_str()),
            None => request,
        }
    }

    /// Fetch a path under `latest/meta-data/`
    pub async fn fetch_metadata_path(&self, path: &str) -> Result<String, CloudInitError> {
        let endpoint = self.endpoint().await?;
        let request = Self::request(endpoint, &format!("latest/meta-data/{path}"));
        let response = self.fetcher.fetch(&request, &self.read_budget).await?;
        Ok(response.body.trim().to_string())
    }
}

/// Find out whether `base_url` serves IMDS, preferring an IMDSv2 token
async fn probe(
    fetcher: RetryingFetcher,
    base_url: String,
    budget: RetryBudget,
    cancel: CancelFlag,
) -> Result<Ec2Endpoint, CloudInitError> {
    let token_request = FetchRequest::put(format!("{base_url}/latest/api/token"))
        .header(TOKEN_TTL_HEADER, TOKEN_TTL_SECONDS.to_string())
        .accept_any_status();
    let response = fetcher
        .fetch_cancellable(&token_request, &budget, &cancel)
        .await?;

    if response.is_success() && !response.body.trim().is_empty() {
        return Ok(Ec2Endpoint {
            base_url,
            token: Some(response.body.trim().to_string()),
        });
    }

    debug!(
        "Token request to {} returned {}, trying IMDSv1",
        base_url, response.status
    );
    let v1_request = FetchRequest::get(format!("{base_url}/latest/meta-data/instance-id"));
    fetcher
        .fetch_cancellable(&v1_request, &RetryBudget::single_attempt(budget.per_attempt_timeout), &cancel)
        .await?;

    Ok(Ec2Endpoint {
        base_url,
        token: None,
    })
}

/// Region is the zone minus its last character (us-east-1a -> us-east-1)
fn region_from_zone(az: &str) -> Option<&str> {
    let (last, _) = az.char_indices().last()?;
    (last > 0).then(|| &az[..last])
}

#[async_trait]
impl Datasource for Ec2 {
    fn name(&self) -> &'static str {
        "EC2"
    }

    async fn is_available(&self) -> bool {
        match self.endpoint().await {
            Ok(_) => true,
            Err(e) => {
                debug!("EC2 metadata service unavailable: {}", e);
                false
            }
        }
    }

    async fn get_metadata(&self) -> Result<InstanceMetadata, CloudInitError> {
        debug!("Fetching EC2 instance metadata");

        let mut metadata = InstanceMetadata {
            cloud_name: Some("aws".to_string()),
            platform: Some("ec2".to_string()),
            ..Default::default()
        };

        metadata.instance_id = Some(self.fetch_metadata_path("instance-id").await?);

        // The rest is optional (continue on individual failures)

        match self.fetch_metadata_path("local-hostname").await {
            Ok(hostname) => metadata.local_hostname = Some(hostname),
            Err(e) => warn!("No local-hostname: {}", e),
        }

        match self.fetch_metadata_path("placement/availability-zone").await {
            Ok(az) => {
                metadata.region = region_from_zone(&az).map(str::to_string);
                metadata.availability_zone = Some(az);
            }
            Err(e) => warn!("No availability zone: {}", e),
        }

        if let Ok(instance_type) = self.fetch_metadata_path("instance-type").await {
            metadata.instance_type = Some(instance_type);
        }

        Ok(metadata)
    }

    async fn get_userdata(&self) -> Result<UserData, CloudInitError> {
        debug!("Fetching EC2 user-data");

        let endpoint = self.endpoint().await?;
        let request = Self::request(endpoint, "latest/user-data").accept_status(404);
        let response = self.fetcher.fetch(&request, &self.read_budget).await?;

        // 404 means no user-data configured
        if response.status == 404 {
            debug!("No user-data available");
            return Ok(UserData::None);
        }

        if response.body.is_empty() {
            return Ok(UserData::None);
        }

        Ok(UserData::Raw(response.body))
    }
}
