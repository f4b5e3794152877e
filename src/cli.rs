use clap::{Parser, Subcommand};

/// AgentWarden — runtime governance sidecar for AI agents.
#[derive(Parser)]
#[command(name = "agentwarden", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the proxy + management server (the default if no subcommand is given).
    Serve {
        /// Port to bind; overrides AGENTWARDEN_PORT.
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Policy introspection without starting the server.
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },

    /// Inspect or resolve pending human-in-the-loop approvals.
    Approval {
        #[command(subcommand)]
        command: ApprovalCommands,
    },

    /// Kill-switch control, equivalent to the management API's scope endpoints.
    Killswitch {
        #[command(subcommand)]
        command: KillswitchCommands,
    },
}

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// Load and compile the configured policy file, reporting any errors, without starting the server.
    Validate,
    /// List the currently compiled policy set.
    List,
}

#[derive(Subcommand)]
pub enum ApprovalCommands {
    /// List pending approval requests.
    List,
    /// Approve a pending request.
    Approve { approval_id: String },
    /// Deny a pending request.
    Deny { approval_id: String },
}

#[derive(Subcommand)]
pub enum KillswitchCommands {
    /// Trip the global kill switch.
    TriggerGlobal { reason: String },
    /// Reset the global kill switch.
    ResetGlobal { reason: String },
}
