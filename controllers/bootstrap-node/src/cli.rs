//! Command-line interface

use anyhow::{bail, Context};
use bootstrap_provisioner::config::{validate_cluster_id, validate_uri};
use bootstrap_provisioner::{BootstrapNames, ProvisioningConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "baremetal-bootstrap")]
#[command(about = "Create or destroy the bare-metal bootstrap VM on libvirt", long_about = None)]
pub struct Cli {
    /// Deadline for each hypervisor call, in seconds
    #[arg(long, global = true, value_name = "SECONDS")]
    pub call_timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Provision the bootstrap VM
    Create {
        /// Terraform variable file (JSON); repeat to merge, later files win
        #[arg(long = "var-file", value_name = "PATH", required = true)]
        var_files: Vec<PathBuf>,
    },
    /// Tear down the bootstrap VM and its storage
    Destroy {
        /// Terraform variable file (JSON); repeat to merge, later files win
        #[arg(long = "var-file", value_name = "PATH", conflicts_with_all = ["cluster_id", "libvirt_uri"])]
        var_files: Vec<PathBuf>,

        /// Cluster identifier, instead of variable files
        #[arg(long, requires = "libvirt_uri")]
        cluster_id: Option<String>,

        /// libvirt connection URI, instead of variable files
        #[arg(long, requires = "cluster_id")]
        libvirt_uri: Option<String>,
    },
}

impl Cli {
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout.map(Duration::from_secs)
    }
}

/// What a destroy run needs to find the resources
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyTarget {
    pub names: BootstrapNames,
    pub libvirt_uri: String,
}

impl DestroyTarget {
    pub fn resolve(
        var_files: &[PathBuf],
        cluster_id: Option<&str>,
        libvirt_uri: Option<&str>,
    ) -> anyhow::Result<Self> {
        if !var_files.is_empty() {
            let config = load_config(var_files)?;
            return Ok(Self {
                names: config.names(),
                libvirt_uri: config.libvirt_uri,
            });
        }

        match (cluster_id, libvirt_uri) {
            (Some(cluster_id), Some(libvirt_uri)) => {
                validate_cluster_id(cluster_id)?;
                validate_uri(libvirt_uri)?;
                Ok(Self {
                    names: BootstrapNames::new(cluster_id),
                    libvirt_uri: libvirt_uri.to_string(),
                })
            }
            _ => bail!("destroy needs --var-file, or --cluster-id together with --libvirt-uri"),
        }
    }
}

pub fn load_config(var_files: &[PathBuf]) -> anyhow::Result<ProvisioningConfig> {
    ProvisioningConfig::from_var_files(var_files).context("failed to load Terraform variables")
}
