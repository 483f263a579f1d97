//! Wire server endpoint discovery
//!
//! Azure hands out the wire server address in DHCP option 245. dhclient
//! records it as `option unknown-245 a8:3f:81:10;`, systemd-networkd as
//! `OPTION_245=a83f8110`. Without a lease we fall back to the well-known
//! address.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::AzureConfig;

/// Wire server address used when no lease advertises one
pub const DEFAULT_WIRESERVER_ENDPOINT: &str = "168.63.129.16";

/// Directories scanned for DHCP leases, in order
const LEASE_DIRS: [&str; 4] = [
    "/var/lib/dhcp",
    "/var/lib/dhclient",
    "/var/lib/NetworkManager",
    "/run/systemd/netif/leases",
];

/// Decode an option 245 value into an IPv4 address
pub fn parse_option_245(value: &str) -> Option<Ipv4Addr> {
    let value = value.trim().trim_end_matches(';').trim_matches('"');

    let octets: Vec<u8> = if value.contains(':') {
        value
            .split(':')
            .map(|part| u8::from_str_radix(part, 16).ok())
            .collect::<Option<_>>()?
    } else if value.len() == 8 {
        (0..8)
            .step_by(2)
            .map(|i| u8::from_str_radix(value.get(i..i + 2)?, 16).ok())
            .collect::<Option<_>>()?
    } else {
        return None;
    };

    let octets: [u8; 4] = octets.try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

/// Find the wire server address in lease file content; the last lease wins
pub fn endpoint_from_lease(content: &str) -> Option<Ipv4Addr> {
    content
        .lines()
        .map(str::trim)
        .filter_map(|line| {
            line.strip_prefix("option unknown-245")
                .or_else(|| line.strip_prefix("OPTION_245="))
        })
        .filter_map(parse_option_245)
        .last()
}

/// Resolve the wire server endpoint for this instance
///
/// Precedence: configured endpoint, configured lease file, lease directories,
/// then [`DEFAULT_WIRESERVER_ENDPOINT`].
pub async fn find_endpoint(config: &AzureConfig) -> String {
    if let Some(endpoint) = &config.wireserver_endpoint {
        debug!("Using configured wire server endpoint {}", endpoint);
        return endpoint.clone();
    }

    let lease_files = match &config.dhclient_lease_file {
        Some(path) => vec![path.clone()],
        None => collect_lease_files(&LEASE_DIRS).await,
    };

    let mut found = None;
    for path in &lease_files {
        match fs::read_to_string(path).await {
            Ok(content) => {
                if let Some(addr) = endpoint_from_lease(&content) {
                    debug!("Found option 245 ({}) in {}", addr, path.display());
                    found = Some(addr);
                }
            }
            Err(e) => warn!("Failed to read lease file {}: {}", path.display(), e),
        }
    }

    match found {
        Some(addr) => {
            info!("Wire server endpoint from DHCP lease: {}", addr);
            addr.to_string()
        }
        None => {
            info!(
                "No option 245 in {} lease file(s), using {}",
                lease_files.len(),
                DEFAULT_WIRESERVER_ENDPOINT
            );
            DEFAULT_WIRESERVER_ENDPOINT.to_string()
        }
    }
}

async fn collect_lease_files(dirs: &[impl AsRef<Path>]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for dir in dirs {
        let Ok(mut read_dir) = fs::read_dir(dir.as_ref()).await else {
            continue;
        };
        let mut entries = Vec::new();
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let path = entry.path();
            let is_lease = path.file_name().is_some_and(|name| {
                let name = name.to_string_lossy();
                name.contains("lease") || dir.as_ref().ends_with("leases")
            });
            if is_lease && path.is_file() {
                entries.push(path);
            }
        }
        entries.sort();
        files.extend(entries);
    }
    files
}
