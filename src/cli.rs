use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ip-address-controller")]
#[command(about = "Reconciles pre-reserved static public IPs onto cluster nodes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and permissions
    Check,

    /// List Kubernetes resources (pools, nodes)
    List {
        /// Resource type to list (pools, nodes)
        resource: String,
    },

    /// Manage the NetIPAllocation CRD
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Start the NetIPAllocation controller runtime
    Run,
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,

    /// Install the CRD into the connected cluster
    Install,
}
