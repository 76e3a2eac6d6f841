use clap::{Parser, Subcommand};

/// Invoking the binary with no subcommand starts the long-running operator.
#[derive(Parser)]
#[command(name = "hsj-operator")]
#[command(about = "HotStandbyJob warm-pool operator")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Never delete surplus active child Jobs; rely on workload completion
    /// and the min/max bounds instead.
    #[arg(long)]
    pub disable_scale_down: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and permissions
    Check,

    /// Manage the HotStandbyJob CRD
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Inspect or clean the shared pod-state store
    Store {
        #[command(subcommand)]
        action: StoreAction,
    },
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,

    /// Install the CRD into the connected cluster
    Install,
}

#[derive(Subcommand)]
pub enum StoreAction {
    /// Print a per-state summary of all registered pods
    Summary,

    /// Delete records not updated within the timeout, plus unparseable ones
    Cleanup {
        #[arg(long, default_value_t = 600)]
        timeout_seconds: i64,
    },

    /// Delete a single pod's record
    Remove { pod_name: String },

    /// Delete every record (maintenance only)
    Clear,
}
