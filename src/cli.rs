use clap::{Parser, Subcommand};

/// esimgate — AI-agent-facing eSIM activation gateway
#[derive(Parser)]
#[command(name = "esimgate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to bind
        #[arg(short, long, default_value = "8443")]
        port: u16,
    },

    /// Manage API keys
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },
}

#[derive(Subcommand)]
pub enum KeyCommands {
    /// Issue a new API key (the secret is printed exactly once)
    Create {
        #[arg(long)]
        label: String,
        /// Hourly quota; defaults to ESIMGATE_DEFAULT_KEY_QUOTA
        #[arg(long)]
        quota: Option<i64>,
        /// Identity that owns this key, for audit attribution
        #[arg(long)]
        owner: Option<String>,
    },
    /// List issued keys (metadata only)
    List,
    /// Revoke a key (one-way, idempotent)
    Revoke {
        #[arg(long)]
        id: String,
    },
}
