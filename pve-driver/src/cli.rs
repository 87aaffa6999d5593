//! Command-line argument parsing.

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};

/// pve-driver - Proxmox VE instance lifecycle driver
#[derive(Parser, Debug)]
#[command(name = "pve-driver")]
#[command(about = "pve-driver - Proxmox VE instance lifecycle driver")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Cluster address
    #[arg(long, env = "PVE_ADDRESS")]
    pub address: Option<String>,

    /// API user, e.g. root@pam
    #[arg(long, env = "PVE_USER")]
    pub user: Option<String>,

    /// API password
    #[arg(long, env = "PVE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by the deploy commands.
#[derive(ClapArgs, Debug, Clone)]
pub struct DeployArgs {
    /// Application name the instance is named after
    #[arg(long)]
    pub app_name: String,

    /// Derive a unique name from the app name
    #[arg(long)]
    pub autogenerate_name: bool,

    /// Storage for full clones
    #[arg(long)]
    pub storage: Option<String>,

    /// Node to place the new instance on
    #[arg(long)]
    pub target_node: Option<String>,

    /// Cloud-init user (VMs only)
    #[arg(long)]
    pub ci_user: Option<String>,

    /// Cloud-init password (VMs only)
    #[arg(long, env = "PVE_CI_PASSWORD", hide_env_values = true)]
    pub ci_password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Access,
    Trunk,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Clone a new VM from an existing VM (always a full copy)
    DeployFromVm {
        #[command(flatten)]
        deploy: DeployArgs,
        /// Source VM ID
        #[arg(long)]
        vm_id: u32,
        /// Clone from this snapshot of the source
        #[arg(long)]
        snapshot: Option<String>,
    },

    /// Clone a new VM from a template
    DeployFromTemplate {
        #[command(flatten)]
        deploy: DeployArgs,
        /// Template VM ID
        #[arg(long)]
        template_id: u32,
        /// Force a full (true) or linked (false) copy
        #[arg(long)]
        full_clone: Option<bool>,
    },

    /// Clone a new container from an image or another container
    DeployContainer {
        #[command(flatten)]
        deploy: DeployArgs,
        /// Container template, by ID or name
        #[arg(long, conflicts_with = "container_id", required_unless_present = "container_id")]
        image: Option<String>,
        /// Existing container to copy
        #[arg(long)]
        container_id: Option<u32>,
        /// Clone from this snapshot of the source container
        #[arg(long, requires = "container_id")]
        snapshot: Option<String>,
        /// Force a full (true) or linked (false) copy of an image
        #[arg(long, requires = "image")]
        full_clone: Option<bool>,
    },

    /// Validate the configuration and report the cluster version
    Discover,

    /// Power on an instance
    PowerOn { id: u32 },

    /// Power off an instance
    PowerOff {
        id: u32,
        /// Stop immediately instead of the configured shutdown method
        #[arg(long, conflicts_with = "soft")]
        hard: bool,
        /// Request an ACPI shutdown regardless of configuration
        #[arg(long)]
        soft: bool,
    },

    /// Stop and delete an instance and its disks
    Delete { id: u32 },

    /// Print the power state of an instance
    Status { id: u32 },

    /// Print resources, NICs and addresses of an instance
    Details { id: u32 },

    /// Wait for the guest to report an IPv4 address
    RefreshIp {
        id: u32,
        /// Only accept addresses starting with this prefix
        #[arg(long)]
        prefix: Option<String>,
        /// Seconds to wait for an address
        #[arg(long, default_value = "300")]
        timeout_secs: u64,
    },

    /// Connect a NIC to a bridge/VLAN
    Connect {
        id: u32,
        /// NIC slot (net<N>); first free slot when omitted
        #[arg(long)]
        slot: Option<u32>,
        /// VLAN id (access) or ids and ranges (trunk)
        #[arg(long, default_value = "")]
        vlan: String,
        #[arg(long, value_enum, default_value = "access")]
        mode: ModeArg,
        /// Bridge name; the configured default bridge when omitted
        #[arg(long)]
        switch: Option<String>,
        #[arg(long)]
        firewall: bool,
    },

    /// Disconnect the NIC with the given MAC
    Disconnect {
        id: u32,
        #[arg(long)]
        mac: String,
    },

    /// Take a snapshot; without a name, a timestamped orchestration snapshot
    SnapshotSave {
        id: u32,
        #[arg(long)]
        name: Option<String>,
        /// Include RAM ("Yes" or "No")
        #[arg(long, default_value = "No")]
        save_memory: String,
    },

    /// Roll back to a snapshot name or an orchestration artifact
    SnapshotRestore {
        id: u32,
        #[arg(long, conflicts_with = "artifact", required_unless_present = "artifact")]
        name: Option<String>,
        /// Artifact returned by snapshot-save, e.g. proxmox_snapshot:snap_...
        #[arg(long)]
        artifact: Option<String>,
    },

    /// Delete a snapshot
    SnapshotRemove {
        id: u32,
        #[arg(long)]
        name: String,
    },

    /// List the snapshots of an instance
    SnapshotList { id: u32 },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::DeployFromVm { .. } => "deploy-from-vm",
            Command::DeployFromTemplate { .. } => "deploy-from-template",
            Command::DeployContainer { .. } => "deploy-container",
            Command::Discover => "discover",
            Command::PowerOn { .. } => "power-on",
            Command::PowerOff { .. } => "power-off",
            Command::Delete { .. } => "delete",
            Command::Status { .. } => "status",
            Command::Details { .. } => "details",
            Command::RefreshIp { .. } => "refresh-ip",
            Command::Connect { .. } => "connect",
            Command::Disconnect { .. } => "disconnect",
            Command::SnapshotSave { .. } => "snapshot-save",
            Command::SnapshotRestore { .. } => "snapshot-restore",
            Command::SnapshotRemove { .. } => "snapshot-remove",
            Command::SnapshotList { .. } => "snapshot-list",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_deploy_from_template() {
        let args = Args::try_parse_from([
            "pve-driver",
            "--address",
            "pve.lab",
            "deploy-from-template",
            "--app-name",
            "web-01",
            "--template-id",
            "101",
            "--full-clone",
            "false",
        ])
        .unwrap();

        assert_eq!(args.address.as_deref(), Some("pve.lab"));
        match args.command {
            Command::DeployFromTemplate { deploy, template_id, full_clone } => {
                assert_eq!(deploy.app_name, "web-01");
                assert_eq!(template_id, 101);
                assert_eq!(full_clone, Some(false));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_container_source_is_required() {
        assert!(Args::try_parse_from(["pve-driver", "deploy-container", "--app-name", "ct"]).is_err());
        assert!(Args::try_parse_from([
            "pve-driver",
            "deploy-container",
            "--app-name",
            "ct",
            "--image",
            "debian-12",
            "--container-id",
            "200"
        ])
        .is_err());
    }

    #[test]
    fn test_power_off_flags_conflict() {
        assert!(Args::try_parse_from(["pve-driver", "power-off", "7", "--hard", "--soft"]).is_err());
        let args = Args::try_parse_from(["pve-driver", "power-off", "7", "--hard"]).unwrap();
        assert_eq!(args.command.name(), "power-off");
    }

    #[test]
    fn test_parse_discover() {
        let args = Args::try_parse_from(["pve-driver", "discover"]).unwrap();
        assert!(matches!(args.command, Command::Discover));
        assert_eq!(args.command.name(), "discover");
    }
}
