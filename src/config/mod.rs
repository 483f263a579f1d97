//! Datasource configuration
//!
//! Only the `datasource:` mapping of cloud.cfg is read here. Keys follow
//! cloud-init naming, with times in (fractional) seconds:
//!
//! ```yaml
//! datasource:
//!   Ec2:
//!     metadata_urls: ["http://169.254.169.254"]
//!     max_wait: 120
//!     timeout: 50
//!   Azure:
//!     goal_state:
//!       max_wait: 600
//!       timeout: 30
//! ```

pub mod loader;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::CloudInitError;
use crate::url_helper::{RetryBudget, SleepSchedule};
use crate::url_helper::fetch::{DEFAULT_SLEEP_CAP, DEFAULT_STEP_ATTEMPTS};

/// Default EC2 metadata addresses, IPv4 first
pub const EC2_METADATA_URLS: [&str; 2] = ["http://169.254.169.254", "http://[fd00:ec2::254]"];

/// Default Azure IMDS base URL
pub const AZURE_IMDS_URL: &str = "http://169.254.169.254/metadata";

/// The parts of cloud.cfg this crate consumes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub datasource: DatasourceConfig,
}

/// Per-backend settings under `datasource:`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasourceConfig {
    #[serde(rename = "Azure")]
    pub azure: Option<AzureConfig>,

    #[serde(rename = "Ec2")]
    pub ec2: Option<Ec2Config>,
}

impl DatasourceConfig {
    /// Overlay `other` on top of `self`; a backend present in `other` replaces ours
    pub fn merge(&mut self, other: DatasourceConfig) {
        if other.azure.is_some() {
            self.azure = other.azure;
        }
        if other.ec2.is_some() {
            self.ec2 = other.ec2;
        }
    }

    pub fn azure(&self) -> AzureConfig {
        self.azure.clone().unwrap_or_default()
    }

    pub fn ec2(&self) -> Ec2Config {
        self.ec2.clone().unwrap_or_default()
    }
}

/// Retry limits for one kind of request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total wall-clock seconds for all attempts
    pub max_wait: f64,
    /// Seconds per attempt
    pub timeout: f64,
    /// Fixed sleep between attempts; escalating schedule when absent
    pub sleep: Option<f64>,
    pub step_attempts: u32,
    /// Longest escalating sleep in seconds
    pub sleep_cap: f64,
}

impl RetrySettings {
    pub fn new(max_wait: f64, timeout: f64) -> Self {
        Self {
            max_wait,
            timeout,
            ..Self::default()
        }
    }

    pub fn to_budget(&self) -> Result<RetryBudget, CloudInitError> {
        let budget = RetryBudget::new(seconds("max_wait", self.max_wait)?, seconds("timeout", self.timeout)?);
        let schedule = match self.sleep {
            Some(sleep) => SleepSchedule::Fixed(seconds("sleep", sleep)?),
            None => SleepSchedule::Escalating {
                step_attempts: self.step_attempts,
                cap: seconds("sleep_cap", self.sleep_cap)?,
            },
        };
        Ok(budget.with_schedule(schedule))
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_wait: 1200.0,
            timeout: 30.0,
            sleep: None,
            step_attempts: DEFAULT_STEP_ATTEMPTS,
            sleep_cap: DEFAULT_SLEEP_CAP.as_secs_f64(),
        }
    }
}

/// `datasource: Ec2:` settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ec2Config {
    pub metadata_urls: Vec<String>,
    pub max_wait: f64,
    pub timeout: f64,
    pub stagger_delay: f64,
}

impl Ec2Config {
    /// Budget for finding a reachable metadata address
    pub fn budget(&self) -> Result<RetryBudget, CloudInitError> {
        Ok(RetryBudget::new(
            seconds("max_wait", self.max_wait)?,
            seconds("timeout", self.timeout)?,
        ))
    }

    pub fn stagger_delay(&self) -> Result<Duration, CloudInitError> {
        seconds("stagger_delay", self.stagger_delay)
    }
}

impl Default for Ec2Config {
    fn default() -> Self {
        Self {
            metadata_urls: EC2_METADATA_URLS.iter().map(|s| s.to_string()).collect(),
            max_wait: 120.0,
            timeout: 50.0,
            stagger_delay: 0.15,
        }
    }
}

/// `datasource: Azure:` settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    /// Skip lease discovery and talk to this wire server
    pub wireserver_endpoint: Option<String>,
    pub dhclient_lease_file: Option<PathBuf>,
    /// Parent directory for the transport keypair
    pub certificate_dir: Option<PathBuf>,
    pub imds_url: String,
    pub imds: RetrySettings,
    pub goal_state: RetrySettings,
    pub health: RetrySettings,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            wireserver_endpoint: None,
            dhclient_lease_file: None,
            certificate_dir: None,
            imds_url: AZURE_IMDS_URL.to_string(),
            imds: RetrySettings::new(300.0, 2.0),
            goal_state: RetrySettings::default(),
            health: RetrySettings::default(),
        }
    }
}

fn seconds(key: &str, value: f64) -> Result<Duration, CloudInitError> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| CloudInitError::Config(format!("invalid {key} ({value}): {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_datasource_section() {
        let yaml = r#"
datasource_list: [Azure, Ec2]
datasource:
  Ec2:
    metadata_urls: ["http://10.0.0.1"]
    max_wait: 30
  Azure:
    wireserver_endpoint: "168.63.129.16"
    health:
      max_wait: 60
      timeout: 5
      sleep: 1
"#;
        let config: SystemConfig = serde_yaml::from_str(yaml).unwrap();
        let ec2 = config.datasource.ec2();
        assert_eq!(ec2.metadata_urls, vec!["http://10.0.0.1"]);
        assert_eq!(ec2.max_wait, 30.0);
        assert_eq!(ec2.timeout, 50.0);

        let azure = config.datasource.azure();
        assert_eq!(azure.wireserver_endpoint.as_deref(), Some("168.63.129.16"));
        let budget = azure.health.to_budget().unwrap();
        assert_eq!(budget.max_wait, Duration::from_secs(60));
        assert_eq!(budget.sleep, SleepSchedule::Fixed(Duration::from_secs(1)));
        assert_eq!(
            azure.goal_state.to_budget().unwrap().sleep,
            SleepSchedule::escalating()
        );
    }

    #[test]
    fn test_negative_durations_rejected() {
        let settings = RetrySettings::new(-1.0, 5.0);
        assert!(matches!(settings.to_budget(), Err(CloudInitError::Config(_))));
    }

    #[test]
    fn test_merge_replaces_whole_backend() {
        let mut base = DatasourceConfig {
            ec2: Some(Ec2Config {
                max_wait: 10.0,
                ..Default::default()
            }),
            azure: Some(AzureConfig::default()),
        };
        base.merge(DatasourceConfig {
            ec2: Some(Ec2Config {
                timeout: 2.0,
                ..Default::default()
            }),
            azure: None,
        });
        let ec2 = base.ec2();
        assert_eq!(ec2.max_wait, 120.0);
        assert_eq!(ec2.timeout, 2.0);
        assert!(base.azure.is_some());
    }
}
