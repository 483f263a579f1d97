//! Integration tests for EC2 datasource using wiremock

use std::time::Duration;

use cloud_init_azure::config::Ec2Config;
use cloud_init_azure::datasources::Datasource;
use cloud_init_azure::datasources::ec2::Ec2;
use cloud_init_azure::url_helper::RetryingFetcher;
use cloud_init_azure::UserData;
use tracing::Dispatch;
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "test-token-12345";

async fn mount_token(server: &MockServer) {
    Mock::given(method("PUT"))
        .and(path("/latest/api/token"))
        .and(header("X-aws-ec2-metadata-token-ttl-seconds", "21600"))
        .respond_with(ResponseTemplate::new(200).set_body_string(TOKEN))
        .mount(server)
        .await;
}

async fn mount_metadata(server: &MockServer, item: &str, value: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/latest/meta-data/{item}")))
        .respond_with(ResponseTemplate::new(200).set_body_string(value))
        .mount(server)
        .await;
}

fn ec2_for(urls: Vec<String>, max_wait: f64, timeout: f64) -> Ec2 {
    let config = Ec2Config {
        metadata_urls: urls,
        max_wait,
        timeout,
        stagger_delay: 0.05,
    };
    let fetcher = RetryingFetcher::new().unwrap().with_dispatch(Dispatch::none());
    Ec2::new(fetcher, &config).unwrap()
}

/// Test full metadata retrieval with an IMDSv2 token
#[tokio::test]
async fn test_ec2_metadata_with_token() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server).await;

    // Every metadata read must carry the session token
    Mock::given(method("GET"))
        .and(path("/latest/meta-data/instance-id"))
        .and(header("X-aws-ec2-metadata-token", TOKEN))
        .respond_with(ResponseTemplate::new(200).set_body_string("i-1234567890abcdef0\n"))
        .mount(&mock_server)
        .await;
    mount_metadata(&mock_server, "local-hostname", "ip-172-31-0-1.ec2.internal").await;
    mount_metadata(&mock_server, "placement/availability-zone", "us-east-1a").await;
    mount_metadata(&mock_server, "instance-type", "t3.micro").await;

    let ec2 = Ec2::with_base_url(&mock_server.uri()).unwrap();
    assert!(ec2.is_available().await);

    let metadata = ec2.get_metadata().await.unwrap();
    assert_eq!(metadata.instance_id.as_deref(), Some("i-1234567890abcdef0"));
    assert_eq!(
        metadata.local_hostname.as_deref(),
        Some("ip-172-31-0-1.ec2.internal")
    );
    assert_eq!(metadata.availability_zone.as_deref(), Some("us-east-1a"));
    assert_eq!(metadata.region.as_deref(), Some("us-east-1"));
    assert_eq!(metadata.instance_type.as_deref(), Some("t3.micro"));
    assert_eq!(metadata.cloud_name.as_deref(), Some("aws"));

    let token_requests = mock_server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() == "PUT")
        .count();
    assert_eq!(token_requests, 1);
}

/// Test that a zone ending in a multi-byte character still yields a region
#[tokio::test]
async fn test_ec2_non_ascii_availability_zone() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server).await;
    mount_metadata(&mock_server, "instance-id", "i-unicode").await;
    mount_metadata(&mock_server, "placement/availability-zone", "zoneé").await;

    let ec2 = Ec2::with_base_url(&mock_server.uri()).unwrap();
    let metadata = ec2.get_metadata().await.unwrap();
    assert_eq!(metadata.availability_zone.as_deref(), Some("zoneé"));
    assert_eq!(metadata.region.as_deref(), Some("zone"));
}

/// Test fallback to IMDSv1 when token requests are refused
#[tokio::test]
async fn test_ec2_imdsv1_fallback() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/latest/api/token"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&mock_server)
        .await;
    // No token header on any read
    Mock::given(method("GET"))
        .and(header_exists("X-aws-ec2-metadata-token"))
        .respond_with(ResponseTemplate::new(401))
        .with_priority(1)
        .mount(&mock_server)
        .await;
    mount_metadata(&mock_server, "instance-id", "i-v1only").await;

    let ec2 = Ec2::with_base_url(&mock_server.uri()).unwrap();
    let endpoint = ec2.find_endpoint().await.unwrap().unwrap();
    assert_eq!(endpoint.base_url, mock_server.uri());
    assert_eq!(endpoint.token, None);

    // Optional items missing is not an error
    let metadata = ec2.get_metadata().await.unwrap();
    assert_eq!(metadata.instance_id.as_deref(), Some("i-v1only"));
    assert_eq!(metadata.local_hostname, None);
    assert_eq!(metadata.region, None);
}

/// Test user-data retrieval
#[tokio::test]
async fn test_ec2_userdata() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server).await;

    let userdata = "#cloud-config\nhostname: test-host\n";
    Mock::given(method("GET"))
        .and(path("/latest/user-data"))
        .and(header("X-aws-ec2-metadata-token", TOKEN))
        .respond_with(ResponseTemplate::new(200).set_body_string(userdata))
        .mount(&mock_server)
        .await;

    let ec2 = Ec2::with_base_url(&mock_server.uri()).unwrap();
    assert_eq!(
        ec2.get_userdata().await.unwrap(),
        UserData::Raw(userdata.to_string())
    );
}

/// Test that 404 on user-data means no user-data
#[tokio::test]
async fn test_ec2_userdata_not_found() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server).await;

    Mock::given(method("GET"))
        .and(path("/latest/user-data"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let ec2 = Ec2::with_base_url(&mock_server.uri()).unwrap();
    assert_eq!(ec2.get_userdata().await.unwrap(), UserData::None);
}

/// Test that other user-data errors are not swallowed
#[tokio::test]
async fn test_ec2_userdata_server_error() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server).await;

    Mock::given(method("GET"))
        .and(path("/latest/user-data"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let ec2 = Ec2::with_base_url(&mock_server.uri()).unwrap();
    assert!(ec2.get_userdata().await.is_err());
}

/// Test that the first address to answer is used
#[tokio::test]
async fn test_ec2_races_metadata_addresses() {
    let silent = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&silent)
        .await;

    let answering = MockServer::start().await;
    mount_token(&answering).await;
    mount_metadata(&answering, "instance-id", "i-raced").await;

    let ec2 = ec2_for(vec![silent.uri(), answering.uri()], 5.0, 2.0);
    let endpoint = ec2.find_endpoint().await.unwrap().unwrap();
    assert_eq!(endpoint.base_url, answering.uri());
    assert_eq!(endpoint.token.as_deref(), Some(TOKEN));

    let metadata = ec2.get_metadata().await.unwrap();
    assert_eq!(metadata.instance_id.as_deref(), Some("i-raced"));
}

/// Test that an unreachable metadata service makes the datasource unavailable
#[tokio::test]
async fn test_ec2_not_available_when_nothing_answers() {
    let silent = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&silent)
        .await;

    let ec2 = ec2_for(vec![silent.uri()], 0.5, 0.2);
    assert!(!ec2.is_available().await);
    assert!(ec2.get_metadata().await.is_err());
}
