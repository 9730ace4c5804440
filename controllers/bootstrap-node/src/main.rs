//! Bare-metal Bootstrap Node
//!
//! Creates the temporary bootstrap VM that brings up a cluster's control plane,
//! and destroys it again once the control plane is up:
//! - `create`: storage pool, base and overlay volumes, ignition volume, domain
//! - `destroy`: domain, volumes and pool, tolerating what is already gone
//!
//! Host overrides for test harnesses come from `TERRAFORM_LIBVIRT_TEST_DOMAIN_TYPE`
//! and `TF_LIBVIRT_RNG_DEV`.

mod cli;

use bootstrap_provisioner::{Bootstrapper, HostOverrides};
use clap::Parser;
use cli::{Cli, Command, DestroyTarget};
use libvirt_client::VirshClient;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn connect(uri: &str, call_timeout: Option<Duration>) -> VirshClient {
    let client = VirshClient::new(uri);
    match call_timeout {
        Some(timeout) => client.with_call_timeout(timeout),
        None => client,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let call_timeout = cli.call_timeout();

    match cli.command {
        Command::Create { var_files } => {
            let config = cli::load_config(&var_files)?;
            let overrides = HostOverrides::from_env();

            info!("Starting bootstrap create");
            info!("Configuration:");
            info!("  Cluster ID: {}", config.cluster_id);
            info!("  libvirt URI: {}", config.libvirt_uri);
            info!("  OS image: {}", config.bootstrap_os_image);
            info!("  Domain type: {}", overrides.machine_type);

            let bootstrapper = Bootstrapper::new(connect(&config.libvirt_uri, call_timeout));
            match bootstrapper.create(&config, &overrides).await {
                Ok(record) => info!("Bootstrap create finished at {:?}", record.phase),
                Err(e) => {
                    error!("Bootstrap create failed: {}", e);
                    return Err(e.into());
                }
            }
        }
        Command::Destroy {
            var_files,
            cluster_id,
            libvirt_uri,
        } => {
            let target = DestroyTarget::resolve(&var_files, cluster_id.as_deref(), libvirt_uri.as_deref())?;

            info!("Starting bootstrap destroy");
            info!("  Domain: {}", target.names.domain);
            info!("  libvirt URI: {}", target.libvirt_uri);

            let bootstrapper = Bootstrapper::new(connect(&target.libvirt_uri, call_timeout));
            match bootstrapper.destroy(&target.names).await {
                Ok(record) => info!("Bootstrap destroy finished at {:?}", record.phase),
                Err(e) => {
                    error!("Bootstrap destroy failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    Ok(())
}
