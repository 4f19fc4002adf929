use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "cascade-telemetry",
    version,
    about = "Follow a running LLM cascade session from its telemetry endpoints"
)]
pub struct Cli {
    /// Engine base URL. Overrides the config file and CASCADE_TELEMETRY_URL.
    #[arg(long, global = true, value_name = "URL")]
    pub base_url: Option<String>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Follow a session live until it finishes or Ctrl+C is pressed.
    Watch {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },
    /// Fetch a session once and print a summary.
    Status {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
        /// Print the full snapshot as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Check configuration and that the engine is reachable.
    Doctor,
}
