//! cloud-init-azure - metadata acquisition and Azure provisioning
//!
//! Focused on:
//! - Bounded, retrying metadata fetches
//! - Racing dual-stack metadata addresses
//! - Reporting provisioning health to the Azure wire server

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use cloud_init_azure::config::loader::{ConfigPaths, load_datasource_config};
use cloud_init_azure::datasources::Datasource;
use cloud_init_azure::datasources::azure::{ProvisioningShim, endpoint};
use cloud_init_azure::datasources::ec2::Ec2;
use cloud_init_azure::url_helper::{AddressRacer, RetryBudget, RetryingFetcher, wait_for_url};

#[derive(Parser)]
#[command(name = "cloud-init-azure")]
#[command(author, version, about = "Metadata acquisition and Azure provisioning", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Directory holding cloud.cfg and cloud.cfg.d
    #[arg(long, env = "CLOUD_INIT_CONFIG_DIR", default_value = "/etc/cloud")]
    config_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the goal state, collect SSH keys and report Ready
    Ready {
        /// Wire server endpoint (host[:port]); discovered from DHCP leases if omitted
        #[arg(long)]
        endpoint: Option<String>,
        /// Certificate thumbprints whose SSH keys should be returned
        #[arg(long = "fingerprint")]
        fingerprints: Vec<String>,
    },
    /// Report provisioning failure to the wire server
    Fail {
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        description: String,
    },
    /// Query EC2 instance metadata
    Ec2Metadata,
    /// Race URLs and print the first one to answer
    Probe {
        urls: Vec<String>,
        /// Overall budget in seconds
        #[arg(long, default_value_t = 30.0)]
        max_wait: f64,
        /// Per-attempt timeout in seconds
        #[arg(long, default_value_t = 5.0)]
        timeout: f64,
        /// Delay between candidate starts in seconds
        #[arg(long, default_value_t = 0.15)]
        stagger: f64,
    },
}

fn init_logging(verbosity: u8) -> anyhow::Result<()> {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

fn seconds(name: &str, value: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid --{name} {value}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let paths = ConfigPaths::with_config_dir(&cli.config_dir);
    let config = load_datasource_config(&paths)
        .await
        .context("Failed to load configuration")?;
    let fetcher = RetryingFetcher::new()?;

    match cli.command {
        Commands::Ready {
            endpoint: explicit,
            fingerprints,
        } => {
            let azure = config.azure();
            let endpoint = match explicit {
                Some(endpoint) => endpoint,
                None => endpoint::find_endpoint(&azure).await,
            };
            info!("Reporting ready to {}", endpoint);

            let mut shim = ProvisioningShim::new(fetcher, &azure)?;
            let result = shim
                .fetch_and_report_ready(&endpoint, Some(fingerprints.as_slice()))
                .await
                .context("Provisioning failed")?;
            for (fingerprint, key) in &result.metadata {
                println!("{fingerprint} {key}");
            }
        }
        Commands::Fail {
            endpoint: explicit,
            description,
        } => {
            let azure = config.azure();
            let endpoint = match explicit {
                Some(endpoint) => endpoint,
                None => endpoint::find_endpoint(&azure).await,
            };
            let mut shim = ProvisioningShim::new(fetcher, &azure)?;
            shim.report_failure(&endpoint, &description)
                .await
                .context("Failed to report provisioning failure")?;
        }
        Commands::Ec2Metadata => {
            let ec2 = Ec2::new(fetcher, &config.ec2())?;
            let metadata = ec2.get_metadata().await?;
            println!("{metadata:#?}");
        }
        Commands::Probe {
            urls,
            max_wait,
            timeout,
            stagger,
        } => {
            if urls.is_empty() {
                bail!("no URLs given");
            }
            let budget = RetryBudget::new(seconds("max-wait", max_wait)?, seconds("timeout", timeout)?);
            let racer = AddressRacer::new(seconds("stagger", stagger)?, budget.max_wait);
            match wait_for_url(&fetcher, &racer, &urls, &[], &budget).await? {
                Some(winner) => println!(
                    "{} answered HTTP {} after {:.3}s",
                    winner.candidate,
                    winner.value.status,
                    winner.elapsed.as_secs_f64()
                ),
                None => bail!("no URL answered within {max_wait}s"),
            }
        }
    }

    Ok(())
}
