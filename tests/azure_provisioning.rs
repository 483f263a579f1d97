//! Integration tests for Azure wire server provisioning using wiremock

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use openssl::asn1::Asn1Time;
use openssl::cms::{CMSOptions, CmsContentInfo};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::symm::Cipher;
use openssl::x509::{X509, X509Builder, X509NameBuilder};
use tracing::Dispatch;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use cloud_init_azure::CloudInitError;
use cloud_init_azure::config::{AzureConfig, RetrySettings};
use cloud_init_azure::datasources::azure::ProvisioningShim;
use cloud_init_azure::datasources::azure::certificates::certificate_fingerprint;
use cloud_init_azure::datasources::azure::health::ReportState;
use cloud_init_azure::url_helper::RetryingFetcher;

const TRANSPORT_HEADER: &str = "x-ms-guest-agent-public-x509-cert";

fn goal_state_xml(incarnation: &str, certificates_url: Option<&str>) -> String {
    let certificates = certificates_url
        .map(|url| format!("<Certificates>{url}</Certificates>"))
        .unwrap_or_default();
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<GoalState xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:noNamespaceSchemaLocation="goalstate10.xsd">
  <Version>2012-11-30</Version>
  <Incarnation>{incarnation}</Incarnation>
  <Machine>
    <ExpectedState>Started</ExpectedState>
    <StopRolesDeadlineHint>300000</StopRolesDeadlineHint>
  </Machine>
  <Container>
    <ContainerId>MyContainerId</ContainerId>
    <RoleInstanceList>
      <RoleInstance>
        <InstanceId>MyInstanceId</InstanceId>
        <State>Started</State>
        <Configuration>
          <HostingEnvironmentConfig>http://100.86.192.70:80/machine/hostingenv</HostingEnvironmentConfig>
          <SharedConfig>http://100.86.192.70:80/machine/sharedconfig</SharedConfig>
          {certificates}
        </Configuration>
      </RoleInstance>
    </RoleInstanceList>
  </Container>
</GoalState>"#
    )
}

/// Config with short budgets so failures surface quickly
fn azure_config(certificate_dir: &Path) -> AzureConfig {
    let mut fast = RetrySettings::new(1.0, 0.5);
    fast.sleep = Some(0.1);
    AzureConfig {
        certificate_dir: Some(certificate_dir.to_path_buf()),
        goal_state: fast.clone(),
        health: fast,
        ..Default::default()
    }
}

fn shim(config: &AzureConfig) -> ProvisioningShim {
    let fetcher = RetryingFetcher::new().unwrap();
    ProvisioningShim::new(fetcher, config)
        .unwrap()
        .with_dispatch(Dispatch::none())
}

async fn mount_goal_state(server: &MockServer, xml: String) {
    Mock::given(method("GET"))
        .and(path("/machine/"))
        .and(query_param("comp", "goalstate"))
        .and(header("x-ms-version", "2012-11-30"))
        .and(header("x-ms-agent-name", "WALinuxAgent"))
        .respond_with(ResponseTemplate::new(200).set_body_string(xml))
        .mount(server)
        .await;
}

async fn mount_health(server: &MockServer, status: u16) {
    Mock::given(method("POST"))
        .and(path("/machine"))
        .and(query_param("comp", "health"))
        .and(header("Content-Type", "text/xml; charset=utf-8"))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

async fn health_bodies(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|request| request.method.as_str() == "POST")
        .map(|request| String::from_utf8(request.body).unwrap())
        .collect()
}

fn user_certificate(cn: &str) -> (PKey<Private>, X509) {
    let pkey = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    let name = name.build();
    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&pkey).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(30).unwrap())
        .unwrap();
    builder.sign(&pkey, MessageDigest::sha256()).unwrap();
    (pkey, builder.build())
}

/// Answers a certificates request by encrypting a PKCS#12 bag to the
/// transport certificate the client sent
struct CertificatesResponder {
    pkey: PKey<Private>,
    cert: X509,
}

impl Respond for CertificatesResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let Some(transport) = request
            .headers
            .get(TRANSPORT_HEADER)
            .and_then(|value| value.to_str().ok())
        else {
            return ResponseTemplate::new(400);
        };
        let recipient = X509::from_der(&STANDARD.decode(transport).unwrap()).unwrap();

        let bag = Pkcs12::builder()
            .pkey(&self.pkey)
            .cert(&self.cert)
            .build2("")
            .unwrap()
            .to_der()
            .unwrap();
        let mut recipients = Stack::new().unwrap();
        recipients.push(recipient).unwrap();
        let envelope =
            CmsContentInfo::encrypt(&recipients, &bag, Cipher::des_ede3_cbc(), CMSOptions::BINARY)
                .unwrap();

        ResponseTemplate::new(200).set_body_string(format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<CertificateFile><Version>2012-11-30</Version><Incarnation>1634</Incarnation><Format>Pkcs7BlobWithPfxContents</Format><Data>{}</Data></CertificateFile>"#,
            STANDARD.encode(envelope.to_der().unwrap())
        ))
    }
}

#[tokio::test]
async fn test_report_ready_without_certificates() {
    let server = MockServer::start().await;
    mount_goal_state(&server, goal_state_xml("1634", None)).await;
    mount_health(&server, 200).await;
    let dir = tempfile::tempdir().unwrap();

    let mut shim = shim(&azure_config(dir.path()));
    let result = shim
        .fetch_and_report_ready(&server.uri(), None)
        .await
        .unwrap();

    assert!(result.metadata.is_empty());
    assert_eq!(shim.reporter().state(), ReportState::Ready);

    let bodies = health_bodies(&server).await;
    assert_eq!(bodies.len(), 1);
    let body = &bodies[0];
    assert!(body.contains("<GoalStateIncarnation>1634</GoalStateIncarnation>"));
    assert!(body.contains("<ContainerId>MyContainerId</ContainerId>"));
    assert!(body.contains("<InstanceId>MyInstanceId</InstanceId>"));
    assert!(body.contains("<State>Ready</State>"));
    assert!(!body.contains("<Details>"));
}

#[tokio::test]
async fn test_certificates_not_fetched_without_fingerprints() {
    let server = MockServer::start().await;
    mount_goal_state(
        &server,
        goal_state_xml("7", Some(&format!("{}/certificates", server.uri()))),
    )
    .await;
    mount_health(&server, 200).await;
    Mock::given(method("GET"))
        .and(path("/certificates"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().unwrap();

    let mut shim = shim(&azure_config(dir.path()));
    let result = shim
        .fetch_and_report_ready(&server.uri(), Some(Vec::new().as_slice()))
        .await
        .unwrap();

    assert!(result.metadata.is_empty());
}

#[tokio::test]
async fn test_report_ready_returns_requested_ssh_keys() {
    let server = MockServer::start().await;
    let certificates_url = format!("{}/certificates", server.uri());
    mount_goal_state(&server, goal_state_xml("1634", Some(&certificates_url))).await;
    mount_health(&server, 200).await;

    let (pkey, cert) = user_certificate("azureuser");
    let fingerprint = certificate_fingerprint(&cert).unwrap();
    Mock::given(method("GET"))
        .and(path("/certificates"))
        .and(header("x-ms-cipher-name", "DES_EDE3_CBC"))
        .respond_with(CertificatesResponder { pkey, cert })
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut shim = shim(&azure_config(dir.path()));
    // Lowercase with colons still matches the uppercase thumbprint.
    let requested: String = fingerprint
        .to_lowercase()
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).to_string())
        .collect::<Vec<_>>()
        .join(":");
    let wanted = vec![requested, "0000".to_string()];

    let result = shim
        .fetch_and_report_ready(&server.uri(), Some(wanted.as_slice()))
        .await
        .unwrap();

    assert_eq!(result.metadata.len(), 1);
    assert!(result.metadata[&fingerprint].starts_with("ssh-rsa AAAAB3NzaC1yc2E"));
    assert_eq!(shim.reporter().state(), ReportState::Ready);

    // The transport keypair does not outlive the run.
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_report_failure_posts_not_ready() {
    let server = MockServer::start().await;
    mount_goal_state(&server, goal_state_xml("3", None)).await;
    Mock::given(method("POST"))
        .and(path("/machine"))
        .and(query_param("comp", "health"))
        .and(body_string_contains("<State>NotReady</State>"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().unwrap();

    let mut shim = shim(&azure_config(dir.path()));
    shim.report_failure(&server.uri(), "disk full").await.unwrap();

    assert_eq!(shim.reporter().state(), ReportState::NotReady);
    let bodies = health_bodies(&server).await;
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].contains("<SubStatus>ProvisioningFailed</SubStatus>"));
    assert!(bodies[0].contains("<Description>disk full</Description>"));
}

#[tokio::test]
async fn test_invalid_goal_state_is_reported_and_returned() {
    let server = MockServer::start().await;
    mount_goal_state(
        &server,
        goal_state_xml("", None).replace("<Incarnation></Incarnation>", ""),
    )
    .await;
    mount_health(&server, 200).await;
    let dir = tempfile::tempdir().unwrap();

    let mut shim = shim(&azure_config(dir.path()));
    let err = shim
        .fetch_and_report_ready(&server.uri(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, CloudInitError::InvalidGoalState(_)), "{err:?}");
    // The failure report needs a goal state too, so nothing was posted.
    assert!(health_bodies(&server).await.is_empty());
    assert_eq!(shim.reporter().state(), ReportState::Unreported);
}

#[tokio::test]
async fn test_certificate_failure_reports_not_ready() {
    let server = MockServer::start().await;
    let certificates_url = format!("{}/certificates", server.uri());
    mount_goal_state(&server, goal_state_xml("9", Some(&certificates_url))).await;
    mount_health(&server, 200).await;
    Mock::given(method("GET"))
        .and(path("/certificates"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<CertificateFile/>"))
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().unwrap();

    let mut shim = shim(&azure_config(dir.path()));
    let err = shim
        .fetch_and_report_ready(&server.uri(), Some(&["AABB".to_string()][..]))
        .await
        .unwrap_err();

    assert!(matches!(err, CloudInitError::CertificateDecrypt(_)), "{err:?}");
    assert_eq!(shim.reporter().state(), ReportState::NotReady);
    let bodies = health_bodies(&server).await;
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].contains("<State>NotReady</State>"));
    assert!(bodies[0].contains("Certificate decryption failed"));
}

#[tokio::test]
async fn test_goal_state_unavailable_returns_fetch_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/machine/"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    mount_health(&server, 200).await;
    let dir = tempfile::tempdir().unwrap();

    let mut shim = shim(&azure_config(dir.path()));
    let err = shim
        .fetch_and_report_ready(&server.uri(), None)
        .await
        .unwrap_err();

    match err {
        CloudInitError::Fetch { source, .. } => assert_eq!(source.status(), Some(503)),
        other => panic!("expected fetch error, got {other:?}"),
    }
    assert!(health_bodies(&server).await.is_empty());
}

#[tokio::test]
async fn test_health_post_failure_is_fatal() {
    let server = MockServer::start().await;
    mount_goal_state(&server, goal_state_xml("1634", None)).await;
    mount_health(&server, 500).await;
    let dir = tempfile::tempdir().unwrap();

    let mut shim = shim(&azure_config(dir.path()));
    let err = shim
        .fetch_and_report_ready(&server.uri(), None)
        .await
        .unwrap_err();

    assert!(err.is_health_report(), "{err:?}");
    assert_eq!(shim.reporter().state(), ReportState::Unreported);
    // Every POST was a Ready attempt; no NotReady follow-up.
    let bodies = health_bodies(&server).await;
    assert!(!bodies.is_empty());
    assert!(bodies.iter().all(|body| body.contains("<State>Ready</State>")));
}
