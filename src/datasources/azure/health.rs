//! Health reports posted back to the wire server
//!
//! Each field is escaped on its own before it goes into the template. The
//! rendered document is never escaped as a whole.

use std::fmt;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, info, warn};

use super::goal_state::{GoalState, base_headers, wireserver_url};
use crate::CloudInitError;
use crate::url_helper::{FetchRequest, RetryBudget, RetryingFetcher};

/// Raw description characters kept before escaping
pub const MAX_DESCRIPTION_CHARS: usize = 512;

/// Upper bound the wire server accepts for the escaped description
pub const MAX_ESCAPED_DESCRIPTION_CHARS: usize = 4096;

/// Escape the five XML special characters
pub fn xml_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Reported provisioning state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Ready,
    NotReady {
        substatus: String,
        description: String,
    },
}

impl HealthStatus {
    pub fn state(&self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::NotReady { .. } => "NotReady",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "Ready"),
            Self::NotReady { substatus, .. } => write!(f, "NotReady ({substatus})"),
        }
    }
}

/// Health report for one goal state incarnation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub incarnation: String,
    pub container_id: String,
    pub instance_id: String,
    pub status: HealthStatus,
}

impl HealthReport {
    pub fn ready(goal_state: &GoalState) -> Self {
        Self::new(goal_state, HealthStatus::Ready)
    }

    /// A NotReady report; `description` is cut to [`MAX_DESCRIPTION_CHARS`]
    pub fn not_ready(goal_state: &GoalState, substatus: &str, description: &str) -> Self {
        Self::new(
            goal_state,
            HealthStatus::NotReady {
                substatus: substatus.to_string(),
                description: description.chars().take(MAX_DESCRIPTION_CHARS).collect(),
            },
        )
    }

    fn new(goal_state: &GoalState, status: HealthStatus) -> Self {
        Self {
            incarnation: goal_state.incarnation.clone(),
            container_id: goal_state.container_id.clone(),
            instance_id: goal_state.instance_id.clone(),
            status,
        }
    }

    /// Render the report document
    pub fn to_xml(&self) -> String {
        let details = match &self.status {
            HealthStatus::Ready => String::new(),
            HealthStatus::NotReady {
                substatus,
                description,
            } => {
                let description: String = description.chars().take(MAX_DESCRIPTION_CHARS).collect();
                format!(
                    "\n            <Details>\n              <SubStatus>{}</SubStatus>\n              <Description>{}</Description>\n            </Details>",
                    xml_escape(substatus),
                    xml_escape(&description)
                )
            }
        };

        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<Health xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns:xsd="http://www.w3.org/2001/XMLSchema">
  <GoalStateIncarnation>{incarnation}</GoalStateIncarnation>
  <Container>
    <ContainerId>{container_id}</ContainerId>
    <RoleInstanceList>
      <Role>
        <InstanceId>{instance_id}</InstanceId>
        <Health>
          <State>{state}</State>{details}
        </Health>
      </Role>
    </RoleInstanceList>
  </Container>
</Health>
"#,
            incarnation = xml_escape(&self.incarnation),
            container_id = xml_escape(&self.container_id),
            instance_id = xml_escape(&self.instance_id),
            state = xml_escape(self.status.state()),
        )
    }
}

/// Where the reporter is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportState {
    Unreported,
    Ready,
    NotReady,
}

/// Posts health reports; one terminal report per lifetime
#[derive(Debug)]
pub struct HealthReporter {
    fetcher: RetryingFetcher,
    budget: RetryBudget,
    state: ReportState,
    dispatch: Dispatch,
}

impl HealthReporter {
    pub fn new(fetcher: RetryingFetcher, budget: RetryBudget) -> Self {
        let dispatch = fetcher.dispatch().clone();
        Self {
            fetcher,
            budget,
            state: ReportState::Unreported,
            dispatch,
        }
    }

    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.fetcher = self.fetcher.with_dispatch(dispatch.clone());
        self.dispatch = dispatch;
        self
    }

    pub fn state(&self) -> ReportState {
        self.state
    }

    pub async fn send_ready(
        &mut self,
        endpoint: &str,
        goal_state: &GoalState,
    ) -> Result<(), CloudInitError> {
        self.send(endpoint, HealthReport::ready(goal_state)).await
    }

    pub async fn send_failure(
        &mut self,
        endpoint: &str,
        goal_state: &GoalState,
        substatus: &str,
        description: &str,
    ) -> Result<(), CloudInitError> {
        self.send(
            endpoint,
            HealthReport::not_ready(goal_state, substatus, description),
        )
        .await
    }

    async fn send(&mut self, endpoint: &str, report: HealthReport) -> Result<(), CloudInitError> {
        let dispatch = self.dispatch.clone();
        self.post(endpoint, report).with_subscriber(dispatch).await
    }

    async fn post(&mut self, endpoint: &str, report: HealthReport) -> Result<(), CloudInitError> {
        if self.state != ReportState::Unreported {
            warn!(
                "Health already reported as {:?}, not sending {}",
                self.state, report.status
            );
            return Err(CloudInitError::InvalidData(format!(
                "health already reported as {:?}",
                self.state
            )));
        }

        let url = format!("{}/machine?comp=health", wireserver_url(endpoint));
        let request = FetchRequest::post(url, report.to_xml())
            .headers(base_headers())
            .header("Content-Type", "text/xml; charset=utf-8");

        self.fetcher
            .fetch(&request, &self.budget)
            .await
            .map_err(|e| match e {
                CloudInitError::Fetch { attempts, source } => {
                    CloudInitError::HealthReport { attempts, source }
                }
                other => other,
            })?;

        info!(
            "Reported {} for incarnation {}",
            report.status, report.incarnation
        );
        self.state = match report.status {
            HealthStatus::Ready => ReportState::Ready,
            HealthStatus::NotReady { .. } => ReportState::NotReady,
        };
        Ok(())
    }
}
