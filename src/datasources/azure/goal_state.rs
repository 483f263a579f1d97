//! Goal state retrieval from the wire server

use roxmltree::{Document, Node};
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, debug, info};

use crate::CloudInitError;
use crate::url_helper::{FetchRequest, RetryBudget, RetryingFetcher};

/// Agent name announced to the wire server
pub const AGENT_NAME: &str = "WALinuxAgent";

/// Wire protocol version
pub const PROTOCOL_VERSION: &str = "2012-11-30";

/// Cipher the wire server should encrypt certificate bundles with
pub const CERTIFICATE_CIPHER: &str = "DES_EDE3_CBC";

/// Base URL for a wire server endpoint given as `host[:port]` or a full URL
pub fn wireserver_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    }
}

/// Headers every wire server request carries
pub fn base_headers() -> Vec<(String, String)> {
    vec![
        ("x-ms-agent-name".to_string(), AGENT_NAME.to_string()),
        ("x-ms-version".to_string(), PROTOCOL_VERSION.to_string()),
    ]
}

/// Headers asking for content encrypted to our transport certificate
pub fn secure_headers(transport_certificate: &str) -> Vec<(String, String)> {
    let mut headers = base_headers();
    headers.push(("x-ms-cipher-name".to_string(), CERTIFICATE_CIPHER.to_string()));
    headers.push((
        "x-ms-guest-agent-public-x509-cert".to_string(),
        transport_certificate.to_string(),
    ));
    headers
}

/// The control plane's current goal state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoalState {
    pub incarnation: String,
    pub container_id: String,
    pub instance_id: String,
    pub certificates_url: Option<String>,
    /// Raw certificates document, only fetched when asked for
    pub certificates_xml: Option<String>,
}

impl GoalState {
    /// Parse a goal state document
    ///
    /// Incarnation, ContainerId and InstanceId must all be present and
    /// non-empty.
    pub fn parse(xml: &str) -> Result<Self, CloudInitError> {
        let doc = Document::parse(xml).map_err(|e| {
            let pos = e.pos();
            CloudInitError::GoalStateParse {
                line: pos.row,
                column: pos.col,
                message: e.to_string(),
            }
        })?;

        let root = doc.root_element();
        if !root.has_tag_name("GoalState") {
            return Err(CloudInitError::InvalidGoalState(format!(
                "unexpected root element <{}>",
                root.tag_name().name()
            )));
        }

        Ok(Self {
            incarnation: required(root, &["Incarnation"])?,
            container_id: required(root, &["Container", "ContainerId"])?,
            instance_id: required(
                root,
                &["Container", "RoleInstanceList", "RoleInstance", "InstanceId"],
            )?,
            certificates_url: child_text(
                root,
                &[
                    "Container",
                    "RoleInstanceList",
                    "RoleInstance",
                    "Configuration",
                    "Certificates",
                ],
            ),
            certificates_xml: None,
        })
    }
}

fn required(root: Node<'_, '_>, path: &[&str]) -> Result<String, CloudInitError> {
    child_text(root, path)
        .ok_or_else(|| CloudInitError::InvalidGoalState(format!("missing {}", path.join("/"))))
}

/// Trimmed, non-empty text of the element at `path` below `node`
fn child_text(node: Node<'_, '_>, path: &[&str]) -> Option<String> {
    let mut current = node;
    for name in path {
        current = current
            .children()
            .find(|child| child.is_element() && child.has_tag_name(*name))?;
    }
    let text = current.text()?.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Polls the wire server for the goal state
#[derive(Debug, Clone)]
pub struct GoalStateClient {
    fetcher: RetryingFetcher,
    budget: RetryBudget,
    dispatch: Dispatch,
}

impl GoalStateClient {
    pub fn new(fetcher: RetryingFetcher, budget: RetryBudget) -> Self {
        let dispatch = fetcher.dispatch().clone();
        Self {
            fetcher,
            budget,
            dispatch,
        }
    }

    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.fetcher = self.fetcher.with_dispatch(dispatch.clone());
        self.dispatch = dispatch;
        self
    }

    /// Fetch and parse the goal state
    ///
    /// With a transport certificate the certificates document is fetched too,
    /// encrypted to that certificate. Without one, no second request is made.
    pub async fn fetch_goal_state(
        &self,
        endpoint: &str,
        transport_certificate: Option<&str>,
    ) -> Result<GoalState, CloudInitError> {
        self.fetch(endpoint, transport_certificate)
            .with_subscriber(self.dispatch.clone())
            .await
    }

    async fn fetch(
        &self,
        endpoint: &str,
        transport_certificate: Option<&str>,
    ) -> Result<GoalState, CloudInitError> {
        let url = format!("{}/machine/?comp=goalstate", wireserver_url(endpoint));
        let request = FetchRequest::get(url).headers(base_headers());
        let response = self.fetcher.fetch(&request, &self.budget).await?;

        let mut goal_state = GoalState::parse(&response.body)?;
        info!(
            "Goal state incarnation {} (container {}, instance {})",
            goal_state.incarnation, goal_state.container_id, goal_state.instance_id
        );

        match (transport_certificate, &goal_state.certificates_url) {
            (Some(certificate), Some(certificates_url)) => {
                debug!("Fetching certificates from {}", certificates_url);
                let request =
                    FetchRequest::get(certificates_url.clone()).headers(secure_headers(certificate));
                let response = self.fetcher.fetch(&request, &self.budget).await?;
                goal_state.certificates_xml = Some(response.body);
            }
            (Some(_), None) => debug!("Goal state carries no certificates"),
            (None, _) => debug!("Certificates not requested"),
        }

        Ok(goal_state)
    }
}
